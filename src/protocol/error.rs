//! All Contract and Protocol related errors.

use bitcoin::{absolute, Amount, OutPoint};

/// Errors that can occur while building or checking hop contracts.
///
/// Encapsulates errors from:
/// - Locktime schedule violations
/// - Script mismatches
/// - Funding output checks
/// - Hop status transitions
#[derive(Debug)]
pub enum ContractError {
    /// Locktimes of consecutive hops are not strictly decreasing.
    NonDecreasingLocktime {
        /// Index of the offending hop.
        hop: usize,
        /// Locktime of the hop before it.
        previous: u32,
        /// Locktime of the offending hop.
        current: u32,
    },
    /// A hop contract was received with a redeemscript other than the agreed one.
    RedeemscriptMismatch {
        /// Index of the hop.
        hop: usize,
    },
    /// The funding transaction has no output paying to the contract.
    MissingContractOutput {
        /// Index of the hop.
        hop: usize,
    },
    /// The funding transaction pays the contract a different amount.
    IncorrectFundingAmount {
        /// Agreed hop amount.
        expected: Amount,
        /// Amount found in the funding transaction.
        found: Amount,
    },
    /// Hop contract is missing data required for the requested operation.
    Incomplete {
        /// Index of the hop.
        hop: usize,
        /// What is missing.
        missing: &'static str,
    },
    /// Attempted an illegal hop status change.
    IllegalTransition {
        /// Index of the hop.
        hop: usize,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },
    /// The value of a contract output cannot cover the spend fee.
    ValueBelowFee {
        /// The contract outpoint.
        outpoint: OutPoint,
        /// Required fee.
        fee: Amount,
    },
    /// Block height cannot be expressed as an absolute locktime.
    Locktime(absolute::ConversionError),
}

impl From<absolute::ConversionError> for ContractError {
    fn from(value: absolute::ConversionError) -> Self {
        Self::Locktime(value)
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Protocol-level errors that can occur during swap execution.
///
/// Raised when a maker's message has the wrong shape or content for the step
/// the taker is in. Each of these is grounds for marking the maker Malicious.
#[derive(Debug)]
pub enum ProtocolError {
    /// Received unexpected message in protocol sequence.
    WrongMessage {
        /// Message the taker expected.
        expected: String,
        /// Message actually received.
        received: String,
    },
    /// The maker answered for a different swap.
    SwapIdMismatch {
        /// Swap id of the current attempt.
        expected: String,
        /// Swap id echoed by the maker.
        received: String,
    },
    /// The maker committed to an outgoing amount other than the agreed one.
    IncorrectOutgoingAmount {
        /// Agreed amount.
        expected: Amount,
        /// Amount the maker committed to.
        found: Amount,
    },
    /// The offer advertised by a maker is internally inconsistent.
    InvalidOffer(&'static str),
    /// Settlement acknowledgement for the wrong hop.
    WrongSettlementHop {
        /// Hop the taker settled.
        expected: usize,
        /// Hop acknowledged by the maker.
        received: usize,
    },
    /// Error in contract creation or validation.
    Contract(ContractError),
}

impl From<ContractError> for ProtocolError {
    fn from(value: ContractError) -> Self {
        Self::Contract(value)
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
