//! Download, process and store Maker offers.
//!
//! The [`OfferBook`] is the taker's view of every known maker: its address, its latest
//! [`Offer`] and a [`MakerHealth`]. Readers never see a book while it is being updated. The
//! [`OfferSyncService`] builds each new book off to the side and swaps it in as a whole through
//! the [`OfferBookHandle`]. The only other writer is the swap coordinator, which marks makers
//! Malicious.
//!
//! Unresponsive makers are retried on an exponential backoff ([`next_eligible_time`]) until a
//! retry ceiling, after which they are skipped until the next full directory refresh.

use std::{
    convert::TryFrom,
    fmt,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, RwLock,
    },
    thread::{self, Builder, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::NetError,
    market::MakerDirectory,
    protocol::Offer,
    taker::routines::{call_with_timeout, MakerTransport},
    utill::now_secs,
};

use super::error::TakerError;

/// Granularity of the sync loop's sleep, bounds how fast shutdown and manual syncs are noticed.
const SYNC_LOOP_TICK: Duration = Duration::from_millis(100);

/// Stable identifier of a maker inside the offerbook. Never reused within a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MakerId(pub usize);

impl fmt::Display for MakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Health of a maker as seen by the taker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MakerHealth {
    /// Never polled.
    Unchecked,
    /// Answered the last offer request.
    Reachable,
    /// Failed the last `retries` offer requests in a row.
    Unreachable {
        /// Consecutive failures.
        retries: u32,
    },
    /// Violated the protocol during a swap. Never used again.
    Malicious,
}

impl fmt::Display for MakerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MakerHealth::Unchecked => f.write_str("Unchecked"),
            MakerHealth::Reachable => f.write_str("Reachable"),
            MakerHealth::Unreachable { retries } => write!(f, "Unreachable (retries: {retries})"),
            MakerHealth::Malicious => f.write_str("Malicious"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct OnionAddress {
    port: String,
    onion_addr: String,
}

/// Network address of a maker, `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct MakerAddress(OnionAddress);

impl fmt::Display for MakerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.0.onion_addr, self.0.port)
    }
}

impl TryFrom<String> for OnionAddress {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (onion_addr, port) = value.rsplit_once(':').ok_or("Missing port")?;

        if onion_addr.is_empty() || port.is_empty() {
            return Err("Empty onion address or port");
        }
        if port.parse::<u16>().is_err() {
            return Err("Invalid port");
        }

        Ok(OnionAddress {
            onion_addr: onion_addr.to_string(),
            port: port.to_string(),
        })
    }
}

impl TryFrom<String> for MakerAddress {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        OnionAddress::try_from(value).map(MakerAddress)
    }
}

impl TryFrom<&str> for MakerAddress {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MakerAddress::try_from(value.to_string())
    }
}

/// Retry schedule for unresponsive makers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound of the delay.
    pub max: Duration,
    /// Failures after which a maker is skipped until the next directory refresh.
    pub retry_ceiling: u32,
}

/// Delay before the next poll of a maker that failed `retries` times in a row:
/// `base * 2^(retries - 1)`, capped at `max`.
pub fn backoff_delay(retries: u32, policy: &BackoffPolicy) -> Duration {
    if retries == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(retries - 1).unwrap_or(u32::MAX);
    policy
        .base
        .checked_mul(factor)
        .unwrap_or(policy.max)
        .min(policy.max)
}

/// Timestamp (secs) from which a maker that failed `retries` times at `last_attempt_ts` may be
/// polled again.
pub fn next_eligible_time(retries: u32, last_attempt_ts: u64, policy: &BackoffPolicy) -> u64 {
    last_attempt_ts.saturating_add(backoff_delay(retries, policy).as_secs())
}

/// Canonical maker record.
/// A maker may or may not currently have an offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerEntry {
    /// Stable id inside the offerbook.
    pub id: MakerId,
    /// Maker Address: onion_addr:port
    pub address: MakerAddress,
    /// Latest offer, if successfully fetched.
    pub offer: Option<Offer>,
    /// Current health of the maker.
    pub health: MakerHealth,
    /// Timestamp (secs) of the last successful offer download.
    pub last_seen: Option<u64>,
    /// Timestamp (secs) before which the maker is not polled again.
    pub next_check_ts: Option<u64>,
}

impl MakerEntry {
    fn new(id: MakerId, address: MakerAddress) -> Self {
        Self {
            id,
            address,
            offer: None,
            health: MakerHealth::Unchecked,
            last_seen: None,
            next_check_ts: None,
        }
    }

    fn mark_success(&mut self, offer: Offer, now_ts: u64) {
        self.offer = Some(offer);
        self.last_seen = Some(now_ts);
        self.next_check_ts = None;
        if self.health != MakerHealth::Malicious {
            self.health = MakerHealth::Reachable;
        }
    }

    fn mark_failure(&mut self, now_ts: u64, policy: &BackoffPolicy) {
        let retries = match self.health {
            MakerHealth::Malicious => return,
            MakerHealth::Unreachable { retries } => retries.saturating_add(1),
            MakerHealth::Unchecked | MakerHealth::Reachable => 1,
        };
        self.health = MakerHealth::Unreachable { retries };
        self.next_check_ts = Some(next_eligible_time(retries, now_ts, policy));
    }

    /// Whether the maker exhausted its retries and waits for a directory refresh.
    pub fn is_dropped(&self, retry_ceiling: u32) -> bool {
        matches!(self.health, MakerHealth::Unreachable { retries } if retries >= retry_ceiling)
    }

    /// Whether the maker can be used in a route right now.
    pub fn is_usable(&self) -> bool {
        self.health == MakerHealth::Reachable && self.offer.is_some()
    }
}

/// A versioned snapshot of all known makers.
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
pub struct OfferBook {
    version: u64,
    makers: Vec<MakerEntry>,
    last_full_sync: Option<u64>,
    last_directory_refresh: Option<u64>,
}

impl OfferBook {
    /// Builds a book from entries, re-numbering their ids by position.
    pub fn from_entries(entries: Vec<MakerEntry>) -> Self {
        let makers = entries
            .into_iter()
            .enumerate()
            .map(|(i, mut entry)| {
                entry.id = MakerId(i);
                entry
            })
            .collect();
        Self {
            makers,
            ..Default::default()
        }
    }

    /// Incremented at every swap-in.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Timestamp (secs) of the last completed sync pass.
    pub fn last_full_sync(&self) -> Option<u64> {
        self.last_full_sync
    }

    /// Maker by id.
    pub fn get(&self, id: MakerId) -> Option<&MakerEntry> {
        self.makers.get(id.0)
    }

    /// Maker by address.
    pub fn find(&self, address: &MakerAddress) -> Option<&MakerEntry> {
        self.makers.iter().find(|m| &m.address == address)
    }

    /// Gets all makers, whatever their health.
    pub fn all_makers(&self) -> &[MakerEntry] {
        &self.makers
    }

    /// Makers currently usable in a route.
    pub fn good_makers(&self) -> Vec<&MakerEntry> {
        self.makers.iter().filter(|m| m.is_usable()).collect()
    }

    /// Makers caught misbehaving.
    pub fn malicious_makers(&self) -> Vec<&MakerEntry> {
        self.makers
            .iter()
            .filter(|m| m.health == MakerHealth::Malicious)
            .collect()
    }

    /// Adds a maker, or returns the id it already has.
    pub(crate) fn upsert_address(&mut self, address: MakerAddress) -> MakerId {
        if let Some(existing) = self.find(&address) {
            return existing.id;
        }
        let id = MakerId(self.makers.len());
        self.makers.push(MakerEntry::new(id, address));
        id
    }

    pub(crate) fn mark_success(&mut self, address: &MakerAddress, offer: Offer, now_ts: u64) {
        if let Some(m) = self.makers.iter_mut().find(|m| &m.address == address) {
            m.mark_success(offer, now_ts);
        }
    }

    pub(crate) fn mark_failure(
        &mut self,
        address: &MakerAddress,
        now_ts: u64,
        policy: &BackoffPolicy,
    ) {
        if let Some(m) = self.makers.iter_mut().find(|m| &m.address == address) {
            m.mark_failure(now_ts, policy);
        }
    }

    pub(crate) fn mark_malicious(&mut self, address: &MakerAddress) -> bool {
        match self.makers.iter_mut().find(|m| &m.address == address) {
            Some(m) if m.health != MakerHealth::Malicious => {
                m.health = MakerHealth::Malicious;
                true
            }
            _ => false,
        }
    }

    fn makers_to_poll(&self, now_ts: u64, retry_ceiling: u32) -> Vec<MakerAddress> {
        self.makers
            .iter()
            .filter(|m| m.health != MakerHealth::Malicious)
            .filter(|m| !m.is_dropped(retry_ceiling))
            .filter(|m| m.next_check_ts.is_none_or(|next_ts| now_ts >= next_ts))
            .map(|m| m.address.clone())
            .collect()
    }

    fn reset_dropped(&mut self, retry_ceiling: u32) -> usize {
        let mut reset = 0;
        for m in self
            .makers
            .iter_mut()
            .filter(|m| m.is_dropped(retry_ceiling))
        {
            m.health = MakerHealth::Unchecked;
            m.next_check_ts = None;
            reset += 1;
        }
        reset
    }

    fn directory_refresh_due(&self, now_ts: u64, interval: Duration) -> bool {
        self.last_directory_refresh
            .is_none_or(|last| now_ts.saturating_sub(last) >= interval.as_secs())
    }

    /// Overwrites the file with the book as pretty JSON.
    fn write_to_disk(&self, path: &Path) -> Result<(), TakerError> {
        let offerdata_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let writer = BufWriter::new(offerdata_file);
        Ok(serde_json::to_writer_pretty(writer, &self)?)
    }

    fn read_from_disk(path: &Path) -> Result<Self, TakerError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Shared access to the current [`OfferBook`] snapshot.
#[derive(Clone)]
pub struct OfferBookHandle {
    current: Arc<RwLock<Arc<OfferBook>>>,
    is_syncing: Arc<AtomicBool>,
    path: Option<PathBuf>,
}

impl OfferBookHandle {
    /// A handle over `book` that is never written to disk.
    pub fn in_memory(book: OfferBook) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(book))),
            is_syncing: Arc::new(AtomicBool::new(false)),
            path: None,
        }
    }

    /// Create or load offerbook on disk.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, TakerError> {
        let path = data_dir.join("offerbook.json");

        let offerbook = if path.exists() {
            match OfferBook::read_from_disk(&path) {
                Ok(book) => {
                    log::info!("Successfully loaded offerbook at {path:?}");
                    book
                }
                Err(e) => {
                    log::error!("Offerbook corrupted at {path:?}. Recreating. Error: {e:?}");
                    OfferBook::default()
                }
            }
        } else {
            log::info!("Offerbook not found. Creating new at {path:?}");
            OfferBook::default()
        };
        offerbook.write_to_disk(&path)?;

        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(offerbook))),
            is_syncing: Arc::new(AtomicBool::new(false)),
            path: Some(path),
        })
    }

    /// The last complete snapshot.
    pub fn snapshot(&self) -> Arc<OfferBook> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Whether a sync pass is running.
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Marks a maker Malicious in a new snapshot. Returns whether the maker was known and not
    /// already Malicious.
    pub fn mark_malicious(&self, address: &MakerAddress) -> bool {
        let marked = {
            let mut current = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut next = OfferBook::clone(&current);
            if !next.mark_malicious(address) {
                return false;
            }
            next.version = current.version + 1;
            *current = Arc::new(next);
            true
        };
        log::warn!("Maker {address} marked malicious");
        if let Err(e) = self.persist() {
            log::warn!("Failed to persist offerbook: {e:?}");
        }
        marked
    }

    /// Swaps in a book built by a sync pass.
    ///
    /// Malicious marks made while the pass was running are carried over.
    fn commit(&self, mut next: OfferBook) -> Arc<OfferBook> {
        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for maker in current.malicious_makers() {
            next.mark_malicious(&maker.address);
        }
        next.version = current.version + 1;
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        next
    }

    /// Persist offerbook on disk.
    pub fn persist(&self) -> Result<(), TakerError> {
        match &self.path {
            Some(path) => self.snapshot().write_to_disk(path),
            None => Ok(()),
        }
    }
}

/// Timing of the offer sync service.
#[derive(Debug, Clone, Copy)]
pub struct OfferSyncConfig {
    /// Pause between two passes.
    pub interval: Duration,
    /// Pause between two directory refreshes.
    pub directory_refresh: Duration,
    /// Bound on each offer request.
    pub request_timeout: Duration,
    /// Retry schedule of unresponsive makers.
    pub backoff: BackoffPolicy,
}

/// Service keeping the offerbook fresh.
pub struct OfferSyncService {
    offerbook: OfferBookHandle,
    directory: Arc<dyn MakerDirectory>,
    transport: Arc<dyn MakerTransport>,
    config: OfferSyncConfig,
    run_now: Arc<AtomicBool>,
    pass_lock: Mutex<()>,
}

/// OfferSync handle, use for shutting down OfferSyncService.
pub struct OfferSyncHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    is_syncing: Arc<AtomicBool>,
    run_now: Arc<AtomicBool>,
}

impl OfferSyncHandle {
    /// Stops the service and waits for its thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    /// Suggests whether offerbook syncing is in progress or not.
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// Runs manual sync, rather than waiting for routine to trigger it.
    pub fn run_sync_now(&self) {
        self.run_now.store(true, Ordering::Relaxed);
    }
}

impl Drop for OfferSyncHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the syncing flag when a pass ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl<'a> SyncingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfferSyncService {
    /// Constructor method.
    pub fn new(
        offerbook: OfferBookHandle,
        directory: Arc<dyn MakerDirectory>,
        transport: Arc<dyn MakerTransport>,
        config: OfferSyncConfig,
    ) -> Self {
        Self {
            offerbook,
            directory,
            transport,
            config,
            run_now: Arc::new(AtomicBool::new(false)),
            pass_lock: Mutex::new(()),
        }
    }

    /// Runs one sync pass and swaps its result in. Individual maker failures never abort a pass.
    pub fn run_once(&self) -> Arc<OfferBook> {
        let _pass = match self.pass_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _syncing = SyncingGuard::set(&self.offerbook.is_syncing);
        let now = now_secs();
        let policy = self.config.backoff;

        let mut next = OfferBook::clone(&self.offerbook.snapshot());

        if next.directory_refresh_due(now, self.config.directory_refresh) {
            match self.directory.maker_addresses() {
                Ok(addresses) => {
                    log::debug!("Directory listed {} makers", addresses.len());
                    for address in addresses {
                        next.upsert_address(address);
                    }
                    let reset = next.reset_dropped(policy.retry_ceiling);
                    if reset > 0 {
                        log::info!("Directory refresh re-enabled {reset} dropped makers");
                    }
                    next.last_directory_refresh = Some(now);
                }
                Err(e) => log::warn!("Failed to fetch maker addresses from directory: {e:?}"),
            }
        }

        let to_poll = next.makers_to_poll(now, policy.retry_ceiling);
        log::info!("Polling {} makers for offers", to_poll.len());

        let results =
            fetch_offer_from_makers(to_poll, &self.transport, self.config.request_timeout);

        for (address, result) in results {
            match result.and_then(|offer| {
                offer.validate().map_err(|e| NetError::UnexpectedMessage {
                    expected: "valid Offer".to_string(),
                    received: format!("{e:?}"),
                })?;
                Ok(offer)
            }) {
                Ok(offer) => {
                    log::debug!("Got offer from {address}");
                    next.mark_success(&address, offer, now);
                }
                Err(e) => {
                    log::debug!("Offer request to {address} failed: {e:?}");
                    next.mark_failure(&address, now, &policy);
                    if let Some(m) = next.find(&address) {
                        if m.is_dropped(policy.retry_ceiling) {
                            log::warn!(
                                "Maker {address} reached {} failures, dropped until next refresh",
                                policy.retry_ceiling
                            );
                        }
                    }
                }
            }
        }
        next.last_full_sync = Some(now);

        let committed = self.offerbook.commit(next);
        log::info!(
            "Offerbook v{} committed: {} usable of {} known makers",
            committed.version(),
            committed.good_makers().len(),
            committed.all_makers().len()
        );
        if let Err(e) = self.offerbook.persist() {
            log::warn!("Failed to persist offerbook: {e:?}");
        }
        committed
    }

    /// Starts the offerbook service on its own thread.
    pub fn start(self: Arc<Self>) -> Result<OfferSyncHandle, TakerError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let is_syncing = self.offerbook.is_syncing.clone();
        let run_now = self.run_now.clone();

        let join = Builder::new()
            .name("offer-sync-service".to_string())
            .spawn(move || {
                log::info!("Offer sync service started");
                while !shutdown_flag.load(Ordering::Relaxed) {
                    log::info!("Running offerbook sync");
                    self.run_once();
                    log::debug!("Running offerbook sync completed");

                    let mut slept = Duration::ZERO;
                    while slept < self.config.interval
                        && !self.run_now.load(Ordering::Relaxed)
                        && !shutdown_flag.load(Ordering::Relaxed)
                    {
                        thread::sleep(SYNC_LOOP_TICK);
                        slept += SYNC_LOOP_TICK;
                    }
                    if self.run_now.swap(false, Ordering::Relaxed) {
                        log::info!("Manual offerbook syncing initiated");
                    }
                }
                log::debug!("Offer sync service stopped");
            })?;

        Ok(OfferSyncHandle {
            shutdown,
            join: Some(join),
            is_syncing,
            run_now,
        })
    }
}

/// Requests offers from `maker_addresses` in parallel, each bounded by `timeout`.
pub(crate) fn fetch_offer_from_makers(
    maker_addresses: Vec<MakerAddress>,
    transport: &Arc<dyn MakerTransport>,
    timeout: Duration,
) -> Vec<(MakerAddress, Result<Offer, NetError>)> {
    if maker_addresses.is_empty() {
        return Vec::new();
    }
    // Limit workers to CPU cores to avoid thread overhead
    let workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(maker_addresses.len());

    let queue = Arc::new(Mutex::new(maker_addresses.clone().into_iter()));
    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(workers);

    for i in 0..workers {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let transport = Arc::clone(transport);

        let spawned = Builder::new()
            .name(format!("maker_offer_fetch_worker_{i}"))
            .spawn(move || loop {
                let next = match queue.lock() {
                    Ok(mut guard) => guard.next(),
                    Err(_) => None,
                };
                let Some(address) = next else { break };
                let request_addr = address.clone();
                let result = call_with_timeout(&transport, timeout, move |t| {
                    t.send_offer_request(&request_addr)
                });
                let _ = tx.send((address, result));
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => log::error!("Failed to spawn offer fetch worker: {e}"),
        }
    }

    // Drop original sender so rx knows when all workers are done
    drop(tx);

    for handle in handles {
        if handle.join().is_err() {
            log::error!("Offer fetch worker thread panicked");
        }
    }

    let mut results: Vec<(MakerAddress, Result<Offer, NetError>)> = rx.iter().collect();
    // Makers a failed worker never reached count as failures.
    for address in maker_addresses {
        if !results.iter().any(|(a, _)| a == &address) {
            results.push((address, Err(NetError::ReachedEOF)));
        }
    }
    results
}

/// Renders a maker's offer as pretty JSON.
pub fn display_offer(entry: &MakerEntry) -> Result<String, TakerError> {
    let offer = entry
        .offer
        .as_ref()
        .ok_or_else(|| TakerError::General(format!("No offer known for {}", entry.address)))?;
    let value = serde_json::json!({
        "address": entry.address.to_string(),
        "health": entry.health.to_string(),
        "base_fee": offer.base_fee,
        "amount_relative_fee_pct": offer.amount_relative_fee_pct,
        "time_relative_fee_pct": offer.time_relative_fee_pct,
        "required_confirms": offer.required_confirms,
        "minimum_locktime": offer.minimum_locktime,
        "max_size": offer.max_size,
        "min_size": offer.min_size,
    });
    Ok(serde_json::to_string_pretty(&value)?)
}
