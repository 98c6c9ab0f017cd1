//! The wallet capability consumed by the taker.
//!
//! Key management, coin selection and signing live behind [`WalletBackend`]. The taker only
//! tells the wallet which transaction to sign and through which spending path, and keeps its own
//! view of the UTXO categories in the [`UtxoLedger`](super::UtxoLedger).

use std::{collections::HashSet, fmt::Display};

use bitcoin::{Address, Amount, OutPoint, PublicKey, ScriptBuf, Transaction};
use serde::{Deserialize, Serialize};

use super::{ledger::Utxo, WalletError};
use crate::protocol::Preimage;

/// Address types the taker requests from the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    /// Native segwit v0 single key.
    P2WPKH,
    /// Taproot single key.
    P2TR,
}

/// How the inputs of a transaction handed to [`WalletBackend::sign`] are spent.
#[derive(Debug, Clone, PartialEq)]
pub enum SpendInfo {
    /// Every input is a regular wallet coin.
    SeedCoins,
    /// Single input: a hop contract spent through its timelock branch.
    TimelockContract {
        /// Redeemscript of the contract.
        redeemscript: ScriptBuf,
        /// Value of the contract output.
        input_value: Amount,
    },
    /// Single input: a hop contract spent through its hashlock branch.
    HashlockContract {
        /// Redeemscript of the contract.
        redeemscript: ScriptBuf,
        /// Value of the contract output.
        input_value: Amount,
        /// The swap preimage.
        preimage: Preimage,
    },
}

impl Display for SpendInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SeedCoins => write!(f, "seed-coins"),
            Self::TimelockContract { .. } => write!(f, "timelock-contract"),
            Self::HashlockContract { .. } => write!(f, "hashlock-contract"),
        }
    }
}

/// Wallet operations the taker relies on.
///
/// Implementations must be safe to share across the taker's threads.
pub trait WalletBackend: Send + Sync {
    /// All UTXOs the wallet currently controls, with their wallet-level category.
    fn list_utxos(&self) -> Result<Vec<Utxo>, WalletError>;

    /// Picks regular coins worth at least `amount`, never returning an outpoint in `excluded`.
    fn select_inputs(
        &self,
        amount: Amount,
        excluded: &HashSet<OutPoint>,
    ) -> Result<Vec<Utxo>, WalletError>;

    /// A fresh address of the given type.
    fn derive_address(&self, address_type: AddressType) -> Result<Address, WalletError>;

    /// A fresh key for one side of a hop contract.
    fn derive_contract_pubkey(&self) -> Result<PublicKey, WalletError>;

    /// Signs every input of `tx` according to `spend`.
    fn sign(&self, tx: Transaction, spend: &SpendInfo) -> Result<Transaction, WalletError>;
}

/// Represents total wallet balances of different categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Everything the taker owns: regular, in-flight swap and fidelity coins.
    pub total: Amount,
    /// Regular coins with at least one confirmation.
    pub confirmed: Amount,
    /// Regular coins still in the mempool.
    pub unconfirmed: Amount,
    /// Regular coins available for a new swap.
    pub spendable: Amount,
    /// Coins committed to a swap that is not finished.
    pub swap: Amount,
    /// Coins locked in fidelity bonds.
    pub fidelity: Amount,
}
