//! The Taker API.
//!
//! [`Taker`] is the entry point of the crate. It owns the offerbook and its sync service, the UTXO
//! ledger, the persisted swap log and the background recovery loop, and runs at most one swap
//! attempt at a time through the coordinator.
//!
//! Wallet, chain feed, maker transport and maker directory are capabilities supplied by the
//! caller through [`TakerBackends`].

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread::Builder,
};

use bitcoin::{
    hex::DisplayHex,
    secp256k1::rand::{rngs::OsRng, RngCore},
    Amount, OutPoint,
};
use serde::{Deserialize, Serialize};

use crate::{
    market::{MakerDirectory, MultiDirectory, StaticDirectory},
    protocol::contract::{funding_fee, DUST_LIMIT},
    utill::get_taker_dir,
    wallet::{
        build_swap_report, persist_taker_report, Balances, ScriptType, SwapReport, Utxo,
        UtxoCategory, UtxoLedger, WalletBackend,
    },
    watch_tower::{ChainBackend, ChainWatcher},
};

use super::{
    background_services::RecoveryLoop,
    config::TakerConfig,
    coordinator::SwapCoordinator,
    error::{SwapError, TakerError},
    offers::{
        self, MakerAddress, MakerEntry, OfferBook, OfferBookHandle, OfferSyncHandle,
        OfferSyncService,
    },
    recovery::{recover_all, RecoveryOutcome},
    routines::MakerTransport,
    swap::SwapAttempt,
    swap_tracker::{SwapRecord, SwapTracker},
};

/// Swap specific parameters. These are user's policy and can differ among swaps.
/// SwapParams govern the criteria to find suitable set of makers from the offerbook.
///
/// If no maker matches with a given SwapParam, that coinswap round will fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapParams {
    /// Total Amount to Swap.
    pub send_amount: Amount,
    /// How many makers the swap is routed through.
    pub maker_count: usize,
    /// User selected UTXOs, replacing automatic coin selection.
    pub manually_selected_outpoints: Option<Vec<OutPoint>>,
    /// Funding transactions per hop.
    pub tx_count: u32,
    /// Confirmations the taker waits for on its incoming hop. Falls back to the config value.
    pub required_confirms: Option<u32>,
}

impl SwapParams {
    /// Parameters for sending `send_amount` through `maker_count` makers.
    pub fn new(send_amount: Amount, maker_count: usize) -> Self {
        Self {
            send_amount,
            maker_count,
            manually_selected_outpoints: None,
            tx_count: 1,
            required_confirms: None,
        }
    }

    /// Sets the number of funding transactions per hop.
    pub fn with_tx_count(mut self, tx_count: u32) -> Self {
        self.tx_count = tx_count;
        self
    }

    /// Sets the confirmations required on the taker's incoming hop.
    pub fn with_required_confirms(mut self, required_confirms: u32) -> Self {
        self.required_confirms = Some(required_confirms);
        self
    }

    /// Funds the swap from exactly these outpoints.
    pub fn with_utxos(mut self, outpoints: Vec<OutPoint>) -> Self {
        self.manually_selected_outpoints = Some(outpoints);
        self
    }

    fn validate(&self) -> Result<(), SwapError> {
        if self.maker_count == 0 {
            return Err(SwapError::InvalidParams(
                "a swap needs at least one maker".to_string(),
            ));
        }
        if self.send_amount < DUST_LIMIT {
            return Err(SwapError::InvalidParams(format!(
                "send amount {} sats is below dust",
                self.send_amount.to_sat()
            )));
        }
        if self.tx_count != 1 {
            return Err(SwapError::InvalidParams(format!(
                "tx_count {} is not supported, only single funding transactions are",
                self.tx_count
            )));
        }
        if self
            .manually_selected_outpoints
            .as_ref()
            .is_some_and(|outpoints| outpoints.is_empty())
        {
            return Err(SwapError::InvalidParams(
                "manual selection without outpoints".to_string(),
            ));
        }
        Ok(())
    }
}

/// External capabilities the taker drives.
#[derive(Clone)]
pub struct TakerBackends {
    /// Key management, coin selection and signing.
    pub wallet: Arc<dyn WalletBackend>,
    /// Broadcasts, confirmation queries and block notifications.
    pub chain: Arc<dyn ChainBackend>,
    /// Request/response exchanges with makers.
    pub transport: Arc<dyn MakerTransport>,
    /// Source of maker addresses, merged with the addresses listed in the config.
    pub directory: Arc<dyn MakerDirectory>,
}

/// State shared by the coordinator, the recovery manager and the background threads.
pub(crate) struct TakerContext {
    pub(crate) config: TakerConfig,
    pub(crate) data_dir: PathBuf,
    pub(crate) wallet: Arc<dyn WalletBackend>,
    pub(crate) chain: Arc<dyn ChainBackend>,
    pub(crate) transport: Arc<dyn MakerTransport>,
    pub(crate) watcher: ChainWatcher,
    ledger: RwLock<UtxoLedger>,
    tracker: Mutex<SwapTracker>,
    pub(crate) offerbook: OfferBookHandle,
    /// Swap currently driven by the coordinator, skipped by the recovery loop.
    pub(crate) active_swap: Mutex<Option<String>>,
    /// Serializes recovery passes.
    pub(crate) recovery_lock: Mutex<()>,
}

fn poisoned(what: &str) -> TakerError {
    TakerError::General(format!("{what} lock poisoned"))
}

impl TakerContext {
    pub(crate) fn ledger(&self) -> Result<RwLockReadGuard<'_, UtxoLedger>, TakerError> {
        self.ledger.read().map_err(|_| poisoned("ledger"))
    }

    pub(crate) fn ledger_mut(&self) -> Result<RwLockWriteGuard<'_, UtxoLedger>, TakerError> {
        self.ledger.write().map_err(|_| poisoned("ledger"))
    }

    pub(crate) fn tracker(&self) -> Result<MutexGuard<'_, SwapTracker>, TakerError> {
        self.tracker.lock().map_err(|_| poisoned("swap tracker"))
    }

    pub(crate) fn active_swap(&self) -> Result<MutexGuard<'_, Option<String>>, TakerError> {
        self.active_swap.lock().map_err(|_| poisoned("active swap"))
    }

    /// Writes the attempt to the swap log, then checks its commitments against the ledger.
    pub(crate) fn persist(&self, attempt: &SwapAttempt) -> Result<(), TakerError> {
        self.tracker()?.save_attempt(attempt)?;
        self.check_commitments(attempt, Amount::ZERO)
    }

    /// Every taker-funded hop still locked, plus `pending`, must be backed by coins tagged for
    /// the swap.
    pub(crate) fn check_commitments(
        &self,
        attempt: &SwapAttempt,
        pending: Amount,
    ) -> Result<(), TakerError> {
        let committed = attempt.committed_amount() + pending;
        let tagged = self.ledger()?.swap_value(&attempt.id);
        if committed > tagged {
            log::error!(
                "Swap {}: {} sats committed but only {} sats tagged",
                attempt.id,
                committed.to_sat(),
                tagged.to_sat()
            );
            return Err(TakerError::UncoveredCommitment {
                swap_id: attempt.id.clone(),
                committed,
                tagged,
            });
        }
        Ok(())
    }

    /// Flags the record of `swap_id` as fully recovered.
    pub(crate) fn mark_recovered(&self, swap_id: &str) -> Result<(), TakerError> {
        let mut tracker = self.tracker()?;
        if let Some(record) = tracker.get_record(swap_id) {
            if !record.recovered {
                let mut record = record.clone();
                record.recovered = true;
                tracker.save_record(&record)?;
                log::info!("Swap {swap_id}: recovery complete");
            }
        }
        Ok(())
    }
}

/// Re-tags the coins of unfinished swaps after a restart.
fn reload_incomplete_swaps(ledger: &mut UtxoLedger, tracker: &SwapTracker) {
    for record in tracker.incomplete_swaps() {
        let attempt = &record.attempt;
        let Some(funding) = &attempt.taker_funding else {
            continue;
        };
        if funding.broadcast {
            let Some(hop) = attempt.hops.first() else {
                continue;
            };
            if let (false, Some(outpoint)) = (hop.status.is_resolved(), hop.funding_outpoint) {
                ledger.track_contract(
                    &attempt.id,
                    Utxo {
                        outpoint,
                        value: hop.terms.amount,
                        script_type: ScriptType::P2WSH,
                        confirmations: 0,
                        category: UtxoCategory::Regular,
                    },
                );
            }
        } else if let Err(e) = ledger.reserve_for_swap(&funding.inputs, &attempt.id) {
            log::warn!(
                "Swap {}: could not re-reserve funding inputs: {e:?}",
                attempt.id
            );
        }
        log::info!("Reloaded unfinished swap {}", attempt.id);
    }
}

/// Clears the swap-in-progress flag when the attempt ends, however it ends.
struct SwapGuard<'a>(&'a AtomicBool);

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The Taker structure that performs bulk of the coinswap protocol. Taker connects
/// to multiple Makers and send protocol messages sequentially to them.
///
/// All methods take `&self`, a `Taker` can be shared between threads behind an `Arc`.
pub struct Taker {
    ctx: Arc<TakerContext>,
    offer_sync: Arc<OfferSyncService>,
    offer_sync_handle: Mutex<Option<OfferSyncHandle>>,
    recovery_loop: Mutex<Option<RecoveryLoop>>,
    swap_in_progress: AtomicBool,
    cancel: Arc<AtomicBool>,
}

impl Drop for Taker {
    fn drop(&mut self) {
        log::info!("Shutting down taker.");
        if let Ok(mut handle) = self.offer_sync_handle.lock() {
            if let Some(mut handle) = handle.take() {
                handle.shutdown();
            }
        }
        if let Ok(mut recovery) = self.recovery_loop.lock() {
            if let Some(mut recovery) = recovery.take() {
                recovery.shutdown();
            }
        }
        match self.ctx.offerbook.persist() {
            Ok(()) => log::info!("offerbook data saved to disk."),
            Err(e) => log::error!("Failed to save offerbook: {e:?}"),
        }
    }
}

impl Taker {
    // ######## MAIN PUBLIC INTERFACE ############

    ///  Initializes a Taker structure.
    ///
    /// ### Parameters:
    /// - `config`:
    ///   - `Some(value)`: Use this configuration.
    ///   - `None`: Load `config.toml` from the data directory, writing the defaults if missing.
    /// - `data_dir`:
    ///   - `Some(value)`: Use the specified directory for storing data.
    ///   - `None`: Use the default data directory (e.g., for Linux: `~/.coinswap/taker`).
    /// - `backends`: the wallet, chain feed, maker transport and maker directory to drive.
    ///
    /// Unfinished swaps found in the swap log are re-attached to the ledger, the recovery loop
    /// picks them up when enabled.
    pub fn init(
        config: Option<TakerConfig>,
        data_dir: Option<PathBuf>,
        backends: TakerBackends,
    ) -> Result<Taker, TakerError> {
        // Get provided data directory or the default data directory.
        let data_dir = data_dir.unwrap_or_else(get_taker_dir);
        std::fs::create_dir_all(&data_dir)?;

        // If config file doesn't exist, default config will be loaded.
        let config = match config {
            Some(config) => config,
            None => TakerConfig::new(Some(&data_dir.join("config.toml")))?,
        };

        let TakerBackends {
            wallet,
            chain,
            transport,
            directory,
        } = backends;

        let mut ledger = UtxoLedger::new(wallet.list_utxos()?);
        let tracker = SwapTracker::load_or_create(&data_dir)?;
        reload_incomplete_swaps(&mut ledger, &tracker);
        tracker.log_state();

        // Load offerbook. If it doesn't exist, creates fresh file.
        let offerbook = OfferBookHandle::load_or_create(&data_dir)?;
        let static_directory: Arc<dyn MakerDirectory> = Arc::new(StaticDirectory::from_strings(
            config.maker_addresses.iter().cloned(),
        ));
        let directory = Arc::new(MultiDirectory::new(vec![static_directory, directory]));
        let offer_sync = Arc::new(OfferSyncService::new(
            offerbook.clone(),
            directory,
            transport.clone(),
            config.offer_sync_config(),
        ));

        let watcher = ChainWatcher::new(chain.clone(), config.chain_poll_interval());
        let ctx = Arc::new(TakerContext {
            config,
            data_dir,
            wallet,
            chain,
            transport,
            watcher,
            ledger: RwLock::new(ledger),
            tracker: Mutex::new(tracker),
            offerbook,
            active_swap: Mutex::new(None),
            recovery_lock: Mutex::new(()),
        });

        let taker = Taker {
            ctx,
            offer_sync,
            offer_sync_handle: Mutex::new(None),
            recovery_loop: Mutex::new(None),
            swap_in_progress: AtomicBool::new(false),
            cancel: Arc::new(AtomicBool::new(false)),
        };

        if taker.ctx.config.background_sync {
            let handle = Arc::clone(&taker.offer_sync).start()?;
            *taker
                .offer_sync_handle
                .lock()
                .map_err(|_| poisoned("offer sync handle"))? = Some(handle);
        }
        if taker.ctx.config.background_recovery {
            taker.start_recovery_loop()?;
        }

        Ok(taker)
    }

    /// The taker's configuration.
    pub fn config(&self) -> &TakerConfig {
        &self.ctx.config
    }

    /// Directory holding the swap log, the offerbook and the reports.
    pub fn data_dir(&self) -> &Path {
        &self.ctx.data_dir
    }

    ///  Does the coinswap process.
    ///
    /// Selects a route from the current offerbook snapshot, negotiates the hops, funds the first
    /// hop and settles the swap. Only one swap runs at a time, a concurrent call is rejected with
    /// [`SwapError::SwapInProgress`].
    ///
    /// A failed attempt still produces a report: Aborted when no funds ever left the taker's
    /// control, Recovering when the recovery manager has to bring them back.
    pub fn do_coinswap(&self, swap_params: SwapParams) -> Result<SwapReport, SwapError> {
        swap_params.validate()?;

        if self
            .swap_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("Rejecting coinswap request, a swap is already in progress");
            return Err(SwapError::SwapInProgress);
        }
        let _guard = SwapGuard(&self.swap_in_progress);
        self.cancel.store(false, Ordering::Relaxed);

        self.check_funds(&swap_params)?;

        let mut id_bytes = [0u8; 8];
        OsRng.fill_bytes(&mut id_bytes);
        let swap_id = id_bytes.to_lower_hex_string();
        let seed = OsRng.next_u64();

        log::info!(
            "Starting swap {swap_id}: {} sats through {} makers",
            swap_params.send_amount.to_sat(),
            swap_params.maker_count
        );
        let mut attempt = SwapAttempt::new(swap_id.clone(), swap_params);
        self.set_active_swap(Some(swap_id))
            .map_err(|e| SwapError::Failed {
                report: Box::new(build_swap_report(&attempt)),
                cause: e,
            })?;

        let coordinator = SwapCoordinator::new(&self.ctx, &self.cancel, seed);
        let result = coordinator.drive(&mut attempt);

        if let Err(e) = self.set_active_swap(None) {
            log::error!("{e:?}");
        }

        let report = build_swap_report(&attempt);
        report.print();
        if let Err(e) = persist_taker_report(&self.ctx.data_dir, &report) {
            log::error!("Failed to persist swap report: {e:?}");
        }

        match result {
            Ok(()) => Ok(report),
            Err(cause) => Err(SwapError::Failed {
                cause,
                report: Box::new(report),
            }),
        }
    }

    fn check_funds(&self, params: &SwapParams) -> Result<(), SwapError> {
        let failed = |e: TakerError| SwapError::InvalidParams(e.to_string());
        let ledger = self.ctx.ledger().map_err(failed)?;
        let rate = self.ctx.config.fee_rate;

        let (available, input_count) = match &params.manually_selected_outpoints {
            Some(outpoints) => {
                let mut total = Amount::ZERO;
                for outpoint in outpoints {
                    match ledger.get(outpoint) {
                        Some(utxo) if utxo.category == UtxoCategory::Regular => {
                            total += utxo.value
                        }
                        Some(utxo) => {
                            return Err(SwapError::InvalidParams(format!(
                                "outpoint {outpoint} is {:?}, not a regular coin",
                                utxo.category
                            )))
                        }
                        None => {
                            return Err(SwapError::InvalidParams(format!(
                                "outpoint {outpoint} is not a wallet coin"
                            )))
                        }
                    }
                }
                (total, outpoints.len())
            }
            None => (ledger.balances().spendable, 1),
        };

        let required = params.send_amount + funding_fee(input_count, true, rate);
        if available < required {
            log::error!(
                "Not enough balance to do swap: {} sats available, {} sats required",
                available.to_sat(),
                required.to_sat()
            );
            return Err(SwapError::InsufficientFunds {
                available,
                required,
            });
        }
        Ok(())
    }

    fn set_active_swap(&self, swap_id: Option<String>) -> Result<(), TakerError> {
        *self.ctx.active_swap()? = swap_id;
        Ok(())
    }

    /// Asks the running attempt to stop.
    ///
    /// Before funding the attempt aborts and its coins return to Regular. Once funding started it
    /// goes through recovery instead.
    pub fn cancel_swap(&self) {
        if self.swap_in_progress.load(Ordering::Acquire) {
            log::info!("Cancellation requested for the running swap");
            self.cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Whether a swap attempt is running.
    pub fn is_swap_in_progress(&self) -> bool {
        self.swap_in_progress.load(Ordering::Acquire)
    }

    // ######## OFFERBOOK ############

    /// The last complete offerbook snapshot. Never blocks on a running sync.
    pub fn fetch_offers(&self) -> Arc<OfferBook> {
        self.ctx.offerbook.snapshot()
    }

    /// Every maker known to the offerbook, whatever its health.
    pub fn fetch_all_makers(&self) -> Vec<MakerEntry> {
        self.fetch_offers().all_makers().to_vec()
    }

    /// Pretty JSON view of one maker's entry.
    pub fn display_offer(&self, address: &MakerAddress) -> Result<String, TakerError> {
        let book = self.fetch_offers();
        let entry = book
            .find(address)
            .ok_or_else(|| TakerError::General(format!("unknown maker {address}")))?;
        offers::display_offer(entry)
    }

    /// Triggers an offerbook sync without waiting for it.
    pub fn run_offer_sync_now(&self) -> Result<(), TakerError> {
        let handle = self
            .offer_sync_handle
            .lock()
            .map_err(|_| poisoned("offer sync handle"))?;
        match handle.as_ref() {
            Some(handle) => handle.run_sync_now(),
            None => {
                if self.is_offerbook_syncing() {
                    log::debug!("Offerbook sync already running");
                    return Ok(());
                }
                let service = Arc::clone(&self.offer_sync);
                Builder::new()
                    .name("offer-sync-oneshot".to_string())
                    .spawn(move || {
                        service.run_once();
                    })?;
            }
        }
        Ok(())
    }

    /// Whether a sync pass is running.
    pub fn is_offerbook_syncing(&self) -> bool {
        self.ctx.offerbook.is_syncing()
    }

    /// Runs one sync pass on the calling thread and returns the committed snapshot.
    pub fn sync_offerbook(&self) -> Arc<OfferBook> {
        self.offer_sync.run_once()
    }

    // ######## WALLET ############

    /// Balances by category, from the ledger.
    pub fn get_balances(&self) -> Result<Balances, TakerError> {
        Ok(self.ctx.ledger()?.balances())
    }

    /// Reconciles the ledger with the wallet's current UTXOs.
    pub fn sync_wallet(&self) -> Result<(), TakerError> {
        let utxos = self.ctx.wallet.list_utxos()?;
        self.ctx.ledger_mut()?.sync(utxos);
        Ok(())
    }

    /// Every UTXO in the ledger with its category.
    pub fn list_utxos(&self) -> Result<Vec<Utxo>, TakerError> {
        Ok(self.ctx.ledger()?.utxos())
    }

    // ######## RECOVERY ############

    /// The persisted record of a swap.
    pub fn swap_record(&self, swap_id: &str) -> Result<Option<SwapRecord>, TakerError> {
        Ok(self.ctx.tracker()?.get_record(swap_id).cloned())
    }

    /// Runs the recovery manager over every unfinished swap, except the running one.
    pub fn recover_incomplete_swaps(&self) -> Result<Vec<RecoveryOutcome>, TakerError> {
        recover_all(&self.ctx)
    }

    /// Starts the background recovery loop if it is not running.
    pub fn start_recovery_loop(&self) -> Result<(), TakerError> {
        let mut recovery = self
            .recovery_loop
            .lock()
            .map_err(|_| poisoned("recovery loop"))?;
        if recovery.is_none() {
            *recovery = Some(RecoveryLoop::start(
                Arc::clone(&self.ctx),
                self.ctx.config.recovery_interval(),
            )?);
        }
        Ok(())
    }
}
