//! All Wallet-related errors.

use bitcoin::OutPoint;

use super::ledger::UtxoCategory;

/// Represents various errors that can occur within the wallet capability or the UTXO ledger.
#[derive(Debug)]
pub enum WalletError {
    /// Represents a standard I/O error.
    ///
    /// Typically occurs while persisting reports.
    IO(std::io::Error),

    /// Represents an error during JSON serialization or deserialization.
    Json(serde_json::Error),

    /// Represents a general error with a descriptive message.
    ///
    /// Wallet backends use this for failures that do not fall under any specific category.
    General(String),

    /// Represents an error when the wallet has insufficient funds to complete an operation.
    InsufficientFund {
        /// The amount of funds available in the wallet.
        available: u64,
        /// The amount of funds needed to complete the operation.
        required: u64,
    },

    /// The ledger has no entry for the outpoint.
    UtxoNotFound(OutPoint),

    /// A category change not allowed by the ledger.
    IllegalCategoryTransition {
        /// The UTXO being changed.
        outpoint: OutPoint,
        /// Its current category.
        from: UtxoCategory,
        /// The requested category.
        to: UtxoCategory,
    },

    /// The signer could not produce a valid signature.
    Signing(String),
}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        Self::IO(e)
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::IO(e) => write!(f, "I/O error: {}", e),
            WalletError::Json(e) => write!(f, "JSON error: {}", e),
            WalletError::General(msg) => write!(f, "{}", msg),
            WalletError::InsufficientFund {
                available,
                required,
            } => write!(
                f,
                "Insufficient funds: available {} sats, required {} sats",
                available, required
            ),
            WalletError::UtxoNotFound(outpoint) => write!(f, "UTXO not found: {}", outpoint),
            WalletError::IllegalCategoryTransition { outpoint, from, to } => write!(
                f,
                "Illegal category transition for {}: {:?} -> {:?}",
                outpoint, from, to
            ),
            WalletError::Signing(msg) => write!(f, "Signing error: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}
