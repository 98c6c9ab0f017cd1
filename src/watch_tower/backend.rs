//! The chain-feed capability.

use std::sync::mpsc::Receiver;

use bitcoin::{OutPoint, Transaction, Txid};

use super::watcher_error::ChainError;

/// Notifications pushed by the chain feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    /// A new block was connected at `height`.
    NewBlock {
        /// Height of the new tip.
        height: u32,
    },
    /// A transaction entered the mempool.
    NewTx {
        /// Its txid.
        txid: Txid,
    },
}

/// Why a broadcast was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// Fee below the node's relay or replacement threshold. Retry with a higher fee.
    InsufficientFee,
    /// An input is already spent by another transaction.
    AlreadySpent,
    /// Locktime not reached yet.
    NonFinal,
    /// Rejected for any other reason.
    Rejected(String),
    /// The node could not be reached.
    Unavailable(String),
}

impl std::fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Blockchain access the taker relies on.
pub trait ChainBackend: Send + Sync {
    /// Submits a transaction to the network.
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError>;

    /// Confirmations of the transaction creating `outpoint`.
    ///
    /// `None` when the output is unknown to the node, `Some(0)` while it sits in the mempool.
    fn get_confirmations(&self, outpoint: &OutPoint) -> Result<Option<u32>, ChainError>;

    /// Txid of the transaction spending `outpoint`, mempool included.
    fn spending_txid(&self, outpoint: &OutPoint) -> Result<Option<Txid>, ChainError>;

    /// Height of the current tip.
    fn current_height(&self) -> Result<u32, ChainError>;

    /// New receiver of block and transaction notifications.
    fn subscribe(&self) -> Receiver<ChainEvent>;
}
