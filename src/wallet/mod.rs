//! The taker's view of its wallet.
//!
//! Signing, key derivation and coin selection are delegated to a [`WalletBackend`]. The
//! [`UtxoLedger`] keeps the swap-related category of every coin, and [`reports`] summarizes
//! finished swaps.

mod api;
mod error;
mod ledger;
pub mod reports;

pub use api::{AddressType, Balances, SpendInfo, WalletBackend};
pub use error::WalletError;
pub use ledger::{ScriptType, Utxo, UtxoCategory, UtxoLedger};
pub use reports::{build_swap_report, persist_taker_report, MakerFeeInfo, SwapReport};
