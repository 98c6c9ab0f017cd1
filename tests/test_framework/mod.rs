//! A Framework to write functional tests for the Coinswap Taker.
//!
//! The taker only talks to its capabilities: a wallet, a chain feed, a maker transport and a maker
//! directory. This framework provides in-memory versions of all four:
//!
//! - [`StubChain`]: a regtest-like chain. Every broadcast lands in a new block by default, blocks
//!   can also be mined by hand to reach refund heights. Locktimes and double spends are enforced.
//! - [`StubWallet`]: derives deterministic keys and lists the outputs it owns on the stub chain.
//! - [`StubTransport`]: answers on behalf of every maker, each with its own [`MakerBehavior`].
//!   Normal makers fund their outgoing hop on the stub chain and claim their incoming hop at
//!   settlement.
//!
//! Each test gets its own temporary data directory which is removed when the [`TestFramework`]
//! is dropped.
//!
//! Checkout `tests/standard_swap.rs` for example of simple coinswap simulation test
//! between 1 Taker and 2 Makers.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering::Relaxed},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use bitcoin::{
    absolute::LockTime,
    hashes::{sha256d, Hash},
    secp256k1::{self, All, Secp256k1, SecretKey},
    transaction::Version,
    Address, Amount, CompressedPublicKey, Network, OutPoint, PublicKey, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use log::LevelFilter;
use tempfile::TempDir;

use coinswap_taker::{
    error::NetError,
    market::StaticDirectory,
    protocol::{
        contract::{contract_script_pubkey, create_contract_redeemscript},
        FundingNotice, FundingRequest, HopAccept, HopResponse, HopTerms, Offer, Settlement,
        SettlementAck,
    },
    taker::{MakerAddress, MakerTransport, Taker, TakerBackends, TakerConfig},
    utill::setup_taker_logger,
    wallet::{
        AddressType, Balances, SpendInfo, Utxo, UtxoCategory, WalletBackend, WalletError,
    },
    watch_tower::{BroadcastError, ChainBackend, ChainError, ChainEvent},
};

/// Height of the stub chain when a test starts.
pub const START_HEIGHT: u32 = 100;

fn unique_outpoint(tag: &[u8]) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array(sha256d::Hash::hash(tag).to_byte_array()),
        vout: 0,
    }
}

fn spend_tx(inputs: Vec<OutPoint>, outputs: Vec<TxOut>, lock_time: LockTime) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

fn secret_key(tag: u8, index: u32) -> SecretKey {
    let mut bytes = [tag; 32];
    bytes[28..].copy_from_slice(&index.to_be_bytes());
    SecretKey::from_slice(&bytes).expect("valid secret key")
}

// ------------------------------------------------------------------------------------------------
// Chain
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct ChainState {
    height: u32,
    /// Every known transaction with the height of the block it was mined in.
    txs: HashMap<Txid, (Transaction, Option<u32>)>,
    spends: HashMap<OutPoint, Txid>,
    broadcasts: Vec<Txid>,
    rejections: VecDeque<BroadcastError>,
    auto_mine: bool,
    unavailable: bool,
    next_coin: u64,
}

impl ChainState {
    fn mine(&mut self, blocks: u32) -> u32 {
        let first = self.height + 1;
        self.height += blocks;
        for (_, block) in self.txs.values_mut() {
            if block.is_none() {
                *block = Some(first);
            }
        }
        self.height
    }

    fn confirmations(&self, txid: &Txid) -> Option<u32> {
        self.txs
            .get(txid)
            .map(|(_, block)| block.map_or(0, |b| self.height + 1 - b))
    }
}

/// In-memory chain feed.
pub struct StubChain {
    state: Mutex<ChainState>,
    subscribers: Mutex<Vec<Sender<ChainEvent>>>,
}

impl StubChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState {
                height: START_HEIGHT,
                auto_mine: true,
                ..Default::default()
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn notify(&self, event: ChainEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Mines `blocks` blocks, confirming everything in the mempool.
    pub fn mine_blocks(&self, blocks: u32) -> u32 {
        let height = self.state.lock().unwrap().mine(blocks);
        self.notify(ChainEvent::NewBlock { height });
        height
    }

    /// Mines up to `height` if the tip is below it.
    pub fn mine_to(&self, height: u32) {
        let current = self.height();
        if height > current {
            self.mine_blocks(height - current);
        }
    }

    pub fn height(&self) -> u32 {
        self.state.lock().unwrap().height
    }

    /// Whether broadcasts are mined right away. On by default.
    pub fn set_auto_mine(&self, auto_mine: bool) {
        self.state.lock().unwrap().auto_mine = auto_mine;
    }

    /// Makes every call fail as if the node was down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    /// The next broadcast fails with `error`.
    pub fn reject_next_broadcast(&self, error: BroadcastError) {
        self.state.lock().unwrap().rejections.push_back(error);
    }

    /// Txids accepted so far, in order.
    pub fn broadcasts(&self) -> Vec<Txid> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub fn transaction(&self, txid: &Txid) -> Option<Transaction> {
        self.state
            .lock()
            .unwrap()
            .txs
            .get(txid)
            .map(|(tx, _)| tx.clone())
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.state.lock().unwrap().spends.get(outpoint).copied()
    }

    pub fn output(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.state
            .lock()
            .unwrap()
            .txs
            .get(&outpoint.txid)
            .and_then(|(tx, _)| tx.output.get(outpoint.vout as usize).cloned())
    }

    /// Mines a coin paying `amount` to `script_pubkey`.
    pub fn fund_script(&self, script_pubkey: ScriptBuf, amount: Amount) -> OutPoint {
        let (height, txid) = {
            let mut state = self.state.lock().unwrap();
            state.next_coin += 1;
            let source = unique_outpoint(format!("coinbase-{}", state.next_coin).as_bytes());
            let tx = spend_tx(
                vec![source],
                vec![TxOut {
                    value: amount,
                    script_pubkey,
                }],
                LockTime::ZERO,
            );
            let txid = tx.compute_txid();
            state.txs.insert(txid, (tx, None));
            (state.mine(1), txid)
        };
        self.notify(ChainEvent::NewBlock { height });
        OutPoint { txid, vout: 0 }
    }

    /// Unspent outputs whose script satisfies `owned`, with their confirmations.
    pub fn unspent_outputs<F>(&self, owned: F) -> Vec<(OutPoint, Amount, u32)>
    where
        F: Fn(&ScriptBuf) -> bool,
    {
        let state = self.state.lock().unwrap();
        let mut outputs = Vec::new();
        for (txid, (tx, _)) in state.txs.iter() {
            for (vout, out) in tx.output.iter().enumerate() {
                let outpoint = OutPoint {
                    txid: *txid,
                    vout: vout as u32,
                };
                if owned(&out.script_pubkey) && !state.spends.contains_key(&outpoint) {
                    let confirmations = state.confirmations(txid).unwrap_or(0);
                    outputs.push((outpoint, out.value, confirmations));
                }
            }
        }
        outputs
    }
}

impl ChainBackend for StubChain {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError> {
        let txid = tx.compute_txid();
        let mined = {
            let mut state = self.state.lock().unwrap();
            if state.unavailable {
                return Err(BroadcastError::Unavailable("node offline".to_string()));
            }
            if state.txs.contains_key(&txid) {
                return Ok(txid);
            }
            if let Some(error) = state.rejections.pop_front() {
                return Err(error);
            }
            if tx.lock_time.is_block_height() && tx.lock_time.to_consensus_u32() > state.height {
                return Err(BroadcastError::NonFinal);
            }
            if tx.input.iter().any(|input| {
                state
                    .spends
                    .get(&input.previous_output)
                    .is_some_and(|spender| *spender != txid)
            }) {
                return Err(BroadcastError::AlreadySpent);
            }
            for input in &tx.input {
                state.spends.insert(input.previous_output, txid);
            }
            state.txs.insert(txid, (tx.clone(), None));
            state.broadcasts.push(txid);
            if state.auto_mine {
                Some(state.mine(1))
            } else {
                None
            }
        };

        self.notify(ChainEvent::NewTx { txid });
        if let Some(height) = mined {
            self.notify(ChainEvent::NewBlock { height });
        }
        Ok(txid)
    }

    fn get_confirmations(&self, outpoint: &OutPoint) -> Result<Option<u32>, ChainError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(ChainError::Unavailable("node offline".to_string()));
        }
        let exists = state
            .txs
            .get(&outpoint.txid)
            .is_some_and(|(tx, _)| (outpoint.vout as usize) < tx.output.len());
        Ok(exists.then(|| state.confirmations(&outpoint.txid)).flatten())
    }

    fn spending_txid(&self, outpoint: &OutPoint) -> Result<Option<Txid>, ChainError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(ChainError::Unavailable("node offline".to_string()));
        }
        Ok(state.spends.get(outpoint).copied())
    }

    fn current_height(&self) -> Result<u32, ChainError> {
        let state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(ChainError::Unavailable("node offline".to_string()));
        }
        Ok(state.height)
    }

    fn subscribe(&self) -> Receiver<ChainEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

// ------------------------------------------------------------------------------------------------
// Wallet
// ------------------------------------------------------------------------------------------------

/// Deterministic single-key wallet living on a [`StubChain`].
///
/// Signing is a no-op: the stub chain never checks witnesses, and txids do not commit to them.
pub struct StubWallet {
    chain: Arc<StubChain>,
    secp: Secp256k1<All>,
    next_index: AtomicU32,
    scripts: Mutex<HashSet<ScriptBuf>>,
}

impl StubWallet {
    pub fn new(chain: Arc<StubChain>) -> Self {
        Self {
            chain,
            secp: Secp256k1::new(),
            next_index: AtomicU32::new(1),
            scripts: Mutex::new(HashSet::new()),
        }
    }

    fn next_key(&self) -> secp256k1::PublicKey {
        let index = self.next_index.fetch_add(1, Relaxed);
        secp256k1::PublicKey::from_secret_key(&self.secp, &secret_key(0x11, index))
    }

    /// Mines `count` coins of `amount` to fresh wallet addresses.
    pub fn fund(&self, count: usize, amount: Amount) -> Vec<OutPoint> {
        (0..count)
            .map(|_| {
                let address = self.derive_address(AddressType::P2WPKH).unwrap();
                self.chain.fund_script(address.script_pubkey(), amount)
            })
            .collect()
    }

    pub fn owns(&self, script_pubkey: &ScriptBuf) -> bool {
        self.scripts.lock().unwrap().contains(script_pubkey)
    }
}

impl WalletBackend for StubWallet {
    fn list_utxos(&self) -> Result<Vec<Utxo>, WalletError> {
        let scripts = self.scripts.lock().unwrap().clone();
        Ok(self
            .chain
            .unspent_outputs(|spk| scripts.contains(spk))
            .into_iter()
            .map(|(outpoint, value, confirmations)| Utxo::regular(outpoint, value, confirmations))
            .collect())
    }

    fn select_inputs(
        &self,
        amount: Amount,
        excluded: &HashSet<OutPoint>,
    ) -> Result<Vec<Utxo>, WalletError> {
        let mut candidates: Vec<Utxo> = self
            .list_utxos()?
            .into_iter()
            .filter(|utxo| !excluded.contains(&utxo.outpoint))
            .collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));

        let mut selected = Vec::new();
        let mut total = Amount::ZERO;
        for utxo in candidates {
            if total >= amount {
                break;
            }
            total += utxo.value;
            selected.push(utxo);
        }
        if total < amount {
            return Err(WalletError::InsufficientFund {
                available: total.to_sat(),
                required: amount.to_sat(),
            });
        }
        Ok(selected)
    }

    fn derive_address(&self, _address_type: AddressType) -> Result<Address, WalletError> {
        let address = Address::p2wpkh(&CompressedPublicKey(self.next_key()), Network::Regtest);
        self.scripts.lock().unwrap().insert(address.script_pubkey());
        Ok(address)
    }

    fn derive_contract_pubkey(&self) -> Result<PublicKey, WalletError> {
        Ok(PublicKey::new(self.next_key()))
    }

    fn sign(&self, tx: Transaction, _spend: &SpendInfo) -> Result<Transaction, WalletError> {
        Ok(tx)
    }
}

// ------------------------------------------------------------------------------------------------
// Makers
// ------------------------------------------------------------------------------------------------

/// How a stub maker answers the taker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MakerBehavior {
    /// Follows the protocol.
    Normal,
    /// Refuses every hop proposal.
    RejectHop,
    /// Never answers hop proposals.
    TimeoutOnPropose,
    /// Answers hop proposals after the given number of milliseconds.
    SlowPropose(u64),
    /// Accepts hop proposals committing to one sat more than proposed.
    WrongOutgoingAmount,
    /// Accepts the hop, then never answers the funding request.
    VanishBeforeFunding,
    /// Funds its outgoing hop with 1000 sats less than agreed.
    BadFunding,
    /// Claims its incoming hop at settlement but the acknowledgement never arrives.
    ClaimWithoutAck,
    /// Never answers the settlement and never claims.
    SilentAtSettlement,
    /// Unreachable for everything.
    Offline,
}

struct StubMaker {
    offer: Offer,
    behavior: MakerBehavior,
    key: PublicKey,
    /// Incoming contract of each hop the maker funded, keyed by (swap id, funded hop).
    upstream: HashMap<(String, usize), OutPoint>,
}

/// Answers on behalf of every stub maker.
pub struct StubTransport {
    chain: Arc<StubChain>,
    makers: Mutex<HashMap<MakerAddress, StubMaker>>,
    calls: Mutex<Vec<(MakerAddress, &'static str)>>,
    offer_generation: AtomicU64,
    offer_delay_ms: AtomicU64,
}

fn transport_error(e: impl std::fmt::Display) -> NetError {
    NetError::IO(std::io::Error::other(e.to_string()))
}

impl StubTransport {
    pub fn new(chain: Arc<StubChain>) -> Self {
        Self {
            chain,
            makers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            offer_generation: AtomicU64::new(0),
            offer_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn add_maker(&self, address: MakerAddress, offer: Offer, behavior: MakerBehavior) {
        let secp = Secp256k1::new();
        let mut makers = self.makers.lock().unwrap();
        let index = makers.len() as u32;
        let key = PublicKey::new(secp256k1::PublicKey::from_secret_key(
            &secp,
            &secret_key(0x42, index),
        ));
        makers.insert(
            address,
            StubMaker {
                offer,
                behavior,
                key,
                upstream: HashMap::new(),
            },
        );
    }

    pub fn set_behavior(&self, address: &MakerAddress, behavior: MakerBehavior) {
        if let Some(maker) = self.makers.lock().unwrap().get_mut(address) {
            maker.behavior = behavior;
        }
    }

    /// Added to every advertised base fee, bump it between sync passes to tell them apart.
    pub fn set_offer_generation(&self, generation: u64) {
        self.offer_generation.store(generation, Relaxed);
    }

    /// Delay of every offer request.
    pub fn set_offer_delay(&self, delay: Duration) {
        self.offer_delay_ms.store(delay.as_millis() as u64, Relaxed);
    }

    /// Number of `kind` requests sent to any maker.
    pub fn call_count(&self, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k)| *k == kind)
            .count()
    }

    /// Number of `kind` requests sent to `address`.
    pub fn calls_to(&self, address: &MakerAddress, kind: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, k)| a == address && *k == kind)
            .count()
    }

    fn record(
        &self,
        address: &MakerAddress,
        kind: &'static str,
    ) -> Result<(MakerBehavior, PublicKey), NetError> {
        self.calls.lock().unwrap().push((address.clone(), kind));
        let makers = self.makers.lock().unwrap();
        let maker = makers.get(address).ok_or(NetError::ConnectionRefused)?;
        if maker.behavior == MakerBehavior::Offline {
            return Err(NetError::ConnectionRefused);
        }
        Ok((maker.behavior, maker.key))
    }

    fn claim_upstream(&self, address: &MakerAddress, swap_id: &str, hop_index: usize) {
        let upstream = self
            .makers
            .lock()
            .unwrap()
            .get(address)
            .and_then(|m| m.upstream.get(&(swap_id.to_string(), hop_index)).copied());
        let Some(outpoint) = upstream else {
            return;
        };
        let Some(output) = self.chain.output(&outpoint) else {
            return;
        };
        let claim = spend_tx(
            vec![outpoint],
            vec![TxOut {
                value: output.value - Amount::from_sat(500),
                script_pubkey: ScriptBuf::new_p2wsh(&ScriptBuf::new().wscript_hash()),
            }],
            LockTime::ZERO,
        );
        if let Err(e) = self.chain.broadcast(&claim) {
            log::warn!("Maker {address} could not claim {outpoint}: {e:?}");
        }
    }
}

impl MakerTransport for StubTransport {
    fn send_offer_request(&self, address: &MakerAddress) -> Result<Offer, NetError> {
        self.record(address, "offer")?;
        let delay = self.offer_delay_ms.load(Relaxed);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        let mut offer = self
            .makers
            .lock()
            .unwrap()
            .get(address)
            .map(|m| m.offer.clone())
            .ok_or(NetError::ConnectionRefused)?;
        offer.base_fee += self.offer_generation.load(Relaxed);
        Ok(offer)
    }

    fn propose_hop(
        &self,
        address: &MakerAddress,
        terms: &HopTerms,
    ) -> Result<HopResponse, NetError> {
        let (behavior, key) = self.record(address, "propose")?;
        let mut outgoing_amount = terms.outgoing.amount;
        match behavior {
            MakerBehavior::TimeoutOnPropose => return Err(NetError::ConnectionTimedOut),
            MakerBehavior::RejectHop => {
                return Ok(HopResponse::Reject {
                    reason: "not taking swaps right now".to_string(),
                })
            }
            MakerBehavior::SlowPropose(ms) => thread::sleep(Duration::from_millis(ms)),
            MakerBehavior::WrongOutgoingAmount => outgoing_amount += Amount::from_sat(1),
            _ => {}
        }
        Ok(HopResponse::Accept(HopAccept {
            swap_id: terms.swap_id.clone(),
            hashlock_pubkey: key,
            outgoing_amount,
        }))
    }

    fn request_funding(
        &self,
        address: &MakerAddress,
        request: &FundingRequest,
    ) -> Result<FundingNotice, NetError> {
        let (behavior, key) = self.record(address, "funding")?;
        let amount = match behavior {
            MakerBehavior::VanishBeforeFunding => return Err(NetError::ConnectionTimedOut),
            MakerBehavior::BadFunding => request.terms.amount - Amount::from_sat(1000),
            _ => request.terms.amount,
        };

        let redeemscript = create_contract_redeemscript(
            &request.terms.hashlock,
            &request.receiver_pubkey,
            &key,
            request.terms.locktime,
        )
        .map_err(|e| transport_error(format!("{e:?}")))?;
        let source = unique_outpoint(
            format!("{address}-{}-{}", request.swap_id, request.hop_index).as_bytes(),
        );
        let funding_tx = spend_tx(
            vec![source],
            vec![TxOut {
                value: amount,
                script_pubkey: contract_script_pubkey(&redeemscript),
            }],
            LockTime::ZERO,
        );
        self.chain.broadcast(&funding_tx).map_err(transport_error)?;

        if let Some(maker) = self.makers.lock().unwrap().get_mut(address) {
            maker.upstream.insert(
                (request.swap_id.clone(), request.hop_index),
                request.upstream_outpoint,
            );
        }

        Ok(FundingNotice {
            funding_tx,
            contract_redeemscript: redeemscript,
            timelock_pubkey: key,
        })
    }

    fn exchange_settlement(
        &self,
        address: &MakerAddress,
        settlement: &Settlement,
    ) -> Result<SettlementAck, NetError> {
        let (behavior, _) = self.record(address, "settlement")?;
        if behavior == MakerBehavior::SilentAtSettlement {
            return Err(NetError::ConnectionTimedOut);
        }
        self.claim_upstream(address, &settlement.swap_id, settlement.hop_index);
        if behavior == MakerBehavior::ClaimWithoutAck {
            return Err(NetError::ConnectionTimedOut);
        }
        Ok(SettlementAck {
            swap_id: settlement.swap_id.clone(),
            hop_index: settlement.hop_index,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Framework
// ------------------------------------------------------------------------------------------------

/// Offer advertised by the stub makers unless a test provides its own.
pub fn default_offer() -> Offer {
    Offer {
        base_fee: 1000,
        amount_relative_fee_pct: 0.025,
        time_relative_fee_pct: 0.001,
        required_confirms: 1,
        minimum_locktime: 20,
        max_size: 5_000_000,
        min_size: 10_000,
    }
}

/// Taker configuration for tests: no background threads and short timeouts.
pub fn test_config() -> TakerConfig {
    TakerConfig {
        maker_timeout_ms: 1_000,
        funding_timeout_secs: 5,
        backoff_base_secs: 1,
        backoff_max_secs: 2,
        chain_poll_ms: 20,
        recovery_interval_secs: 1,
        background_sync: false,
        background_recovery: false,
        ..TakerConfig::default()
    }
}

pub struct TestFramework {
    pub chain: Arc<StubChain>,
    pub wallet: Arc<StubWallet>,
    pub transport: Arc<StubTransport>,
    pub directory: Arc<StaticDirectory>,
    /// Maker addresses in the order they were configured.
    pub makers: Vec<MakerAddress>,
    temp_dir: TempDir,
}

impl TestFramework {
    /// Initializes a framework with one stub maker per `(port, behavior)` entry, all advertising
    /// [`default_offer`].
    pub fn init(makers_config_map: Vec<(u16, MakerBehavior)>) -> Self {
        Self::init_with_offers(
            makers_config_map
                .into_iter()
                .map(|(port, behavior)| (port, default_offer(), behavior))
                .collect(),
        )
    }

    /// Initializes a framework with makers advertising their own offers.
    pub fn init_with_offers(makers: Vec<(u16, Offer, MakerBehavior)>) -> Self {
        setup_taker_logger(
            LevelFilter::Info,
            Some(std::env::temp_dir().join("coinswap-taker-tests")),
        );

        let chain = Arc::new(StubChain::new());
        let wallet = Arc::new(StubWallet::new(chain.clone()));
        let transport = Arc::new(StubTransport::new(chain.clone()));

        let addresses: Vec<MakerAddress> = makers
            .into_iter()
            .map(|(port, offer, behavior)| {
                let address = MakerAddress::try_from(format!("maker{port}.onion:{port}"))
                    .expect("valid maker address");
                transport.add_maker(address.clone(), offer, behavior);
                address
            })
            .collect();
        let directory = Arc::new(StaticDirectory::new(addresses.clone()));

        log::info!("🧪 Test framework ready with {} makers", addresses.len());

        Self {
            chain,
            wallet,
            transport,
            directory,
            makers: addresses,
            temp_dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    pub fn taker_data_dir(&self) -> PathBuf {
        self.temp_dir.path().join("taker")
    }

    pub fn backends(&self) -> TakerBackends {
        TakerBackends {
            wallet: self.wallet.clone(),
            chain: self.chain.clone(),
            transport: self.transport.clone(),
            directory: self.directory.clone(),
        }
    }

    /// Starts a taker on the framework's data directory. Calling it again after dropping the
    /// previous taker simulates a restart.
    pub fn init_taker(&self, config: TakerConfig) -> Taker {
        Taker::init(Some(config), Some(self.taker_data_dir()), self.backends())
            .expect("taker init")
    }
}

/// Funds the taker's wallet with `utxo_count` coins of `utxo_value` and checks the balances.
///
/// Returns the spendable balance.
pub fn fund_and_verify_taker(
    framework: &TestFramework,
    taker: &Taker,
    utxo_count: usize,
    utxo_value: Amount,
) -> Amount {
    log::info!("💰 Funding taker with {utxo_count} coins of {utxo_value}");
    framework.wallet.fund(utxo_count, utxo_value);
    taker.sync_wallet().unwrap();

    let balances = taker.get_balances().unwrap();
    let expected = utxo_value * utxo_count as u64;
    assert_eq!(balances.spendable, expected);
    assert_eq!(balances.confirmed, expected);
    assert_eq!(balances.swap, Amount::ZERO);
    balances.spendable
}

/// Checks that no coin is left committed to a swap.
pub fn assert_no_coins_in_flight(taker: &Taker) -> Balances {
    let balances = taker.get_balances().unwrap();
    assert_eq!(balances.swap, Amount::ZERO, "coins still committed to a swap");
    assert!(taker
        .list_utxos()
        .unwrap()
        .iter()
        .all(|utxo| !matches!(utxo.category, UtxoCategory::SwapInFlight { .. })));
    balances
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
