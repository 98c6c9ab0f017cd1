//! Bounded waits on chain state, woken by chain-feed notifications.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, RecvTimeoutError},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bitcoin::OutPoint;

use super::{
    backend::{ChainBackend, ChainEvent},
    watcher_error::WatcherError,
};

/// Wraps a [`ChainBackend`] and its notification stream.
pub struct ChainWatcher {
    chain: Arc<dyn ChainBackend>,
    events: Mutex<Receiver<ChainEvent>>,
    poll_interval: Duration,
}

impl ChainWatcher {
    /// Subscribes to `chain`. Conditions are re-checked on every notification and at least every
    /// `poll_interval`.
    pub fn new(chain: Arc<dyn ChainBackend>, poll_interval: Duration) -> Self {
        let events = chain.subscribe();
        Self {
            chain,
            events: Mutex::new(events),
            poll_interval,
        }
    }

    /// Drops notifications queued while nobody was waiting. Returns how many were dropped.
    pub fn discard_backlog(&self) -> usize {
        let Ok(events) = self.events.lock() else {
            return 0;
        };
        events.try_iter().count()
    }

    /// Blocks until the next notification or `max_wait`, whichever comes first.
    pub fn wait_for_event(&self, max_wait: Duration) -> Option<ChainEvent> {
        let events = match self.events.lock() {
            Ok(events) => events,
            Err(_) => {
                std::thread::sleep(max_wait);
                return None;
            }
        };
        match events.recv_timeout(max_wait) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // Feed without notifications, fall back to plain polling.
                std::thread::sleep(max_wait);
                None
            }
        }
    }

    /// Waits until the output has `required` confirmations.
    ///
    /// With `required == 0` the output only needs to stay visible for `zero_conf_window`.
    /// Returns the confirmation count observed.
    pub fn wait_for_confirmations(
        &self,
        outpoint: &OutPoint,
        required: u32,
        zero_conf_window: Duration,
        timeout: Duration,
        interrupt: Option<&AtomicBool>,
    ) -> Result<u32, WatcherError> {
        let stale = self.discard_backlog();
        if stale > 0 {
            log::debug!("Dropped {stale} stale chain notifications");
        }
        let start = Instant::now();
        let mut first_seen: Option<Instant> = None;
        loop {
            match self.chain.get_confirmations(outpoint)? {
                Some(confs) if confs >= required.max(1) => return Ok(confs),
                Some(confs) if required == 0 => {
                    let seen = *first_seen.get_or_insert_with(Instant::now);
                    if seen.elapsed() >= zero_conf_window {
                        return Ok(confs);
                    }
                }
                Some(_) => {}
                None => first_seen = None,
            }

            self.pause(start, timeout, interrupt)?;
        }
    }

    fn pause(
        &self,
        start: Instant,
        timeout: Duration,
        interrupt: Option<&AtomicBool>,
    ) -> Result<(), WatcherError> {
        if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(WatcherError::Interrupted);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(WatcherError::Timeout);
        }
        self.wait_for_event(self.poll_interval.min(timeout - elapsed));
        Ok(())
    }
}
