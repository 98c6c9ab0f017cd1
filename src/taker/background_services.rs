//! Background service threads for the Taker.
//!
//! Contains `RecoveryLoop`, the periodic recovery retry: a standalone struct with its own
//! background thread, `Arc` state and `Drop` impl.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::watch_tower::{ChainEvent, ChainWatcher};

use super::{api::TakerContext, error::TakerError, recovery::recover_all};

/// Longest time the loop goes without checking its shutdown flag.
const RECOVERY_LOOP_TICK: Duration = Duration::from_millis(200);

/// Background thread that periodically runs the recovery manager over every unfinished swap
/// until their taker hops are resolved.
///
/// Each new block wakes the loop early, a refund becomes spendable on a block boundary.
pub(crate) struct RecoveryLoop {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RecoveryLoop {
    /// Spawn the background recovery thread.
    pub(crate) fn start(ctx: Arc<TakerContext>, interval: Duration) -> Result<Self, TakerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let watcher = ChainWatcher::new(ctx.chain.clone(), interval);

        let handle = thread::Builder::new()
            .name("Recovery loop".to_string())
            .spawn(move || {
                log::info!("Recovery loop started");
                while !shutdown_clone.load(Relaxed) {
                    match recover_all(&ctx) {
                        Ok(outcomes) => {
                            let broadcast: usize =
                                outcomes.iter().map(|o| o.broadcast_txids.len()).sum();
                            let complete = outcomes.iter().filter(|o| o.complete).count();
                            if broadcast > 0 || complete > 0 {
                                log::info!(
                                    "Recovery loop: {broadcast} txs sent, {complete} swaps resolved"
                                );
                            }
                        }
                        Err(e) => log::warn!("Recovery loop: pass failed: {e:?}"),
                    }

                    let deadline = Instant::now() + interval;
                    while !shutdown_clone.load(Relaxed) {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        if let Some(ChainEvent::NewBlock { height }) =
                            watcher.wait_for_event(remaining.min(RECOVERY_LOOP_TICK))
                        {
                            log::debug!("Recovery loop: woke up on block {height}");
                            break;
                        }
                    }
                }
                log::info!("Recovery loop shut down");
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Signal shutdown and wait for the thread to exit.
    pub(crate) fn shutdown(&mut self) {
        self.shutdown.store(true, Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Recovery loop thread panicked");
            }
        }
    }
}

impl Drop for RecoveryLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
