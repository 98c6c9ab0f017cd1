//! All Taker-related errors.

use bitcoin::Amount;

use crate::{
    error::NetError,
    protocol::error::{ContractError, ProtocolError},
    taker::offers::MakerAddress,
    wallet::{reports::SwapReport, WalletError},
    watch_tower::ChainError,
};

/// Not enough qualifying makers in the offerbook to build a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoRouteError {
    /// Makers the route needs.
    pub required: usize,
    /// Makers that passed every filter.
    pub available: usize,
}

impl std::fmt::Display for NoRouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "no route: {} makers required, {} qualifying",
            self.required, self.available
        )
    }
}

/// Represents errors that can occur during taker operations.
///
/// Encapsulates errors from:
/// - Route selection
/// - Maker communications and maker misbehaviour
/// - Chain feed availability
/// - Wallet operations
/// - Swap state persistence
#[derive(Debug)]
pub enum TakerError {
    /// Standard IO errors during file operations.
    IO(std::io::Error),
    /// Not enough qualifying makers for the swap route.
    NoRoute(NoRouteError),
    /// A maker violated the expected message or contract shape. The maker is marked Malicious.
    MakerProtocol {
        /// The offending maker.
        maker: MakerAddress,
        /// Hop being processed when the violation was seen.
        hop: usize,
        /// What went wrong.
        reason: String,
    },
    /// A maker did not answer in time, or could not be reached.
    MakerTimeout {
        /// The unresponsive maker.
        maker: MakerAddress,
        /// Hop being processed.
        hop: usize,
    },
    /// A maker refused the proposed hop terms.
    MakerRejected {
        /// The refusing maker.
        maker: MakerAddress,
        /// Reason given by the maker.
        reason: String,
    },
    /// The chain feed is unreachable.
    ChainUnavailable(ChainError),
    /// Waiting for a funding transaction timed out.
    FundingTxWaitTimeOut {
        /// Hop whose funding never confirmed.
        hop: usize,
    },
    /// The attempt was cancelled by the caller.
    Cancelled,
    /// Errors from wallet operations like selecting inputs or signing.
    Wallet(WalletError),
    /// Network-related errors during connections.
    Net(NetError),
    /// Protocol violation or swap execution errors.
    Protocol(ProtocolError),
    /// Contract construction or verification errors.
    Contract(ContractError),
    /// A swap state change that the state machine does not allow.
    IllegalStateTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },
    /// Hops the taker funded are worth more than the coins tagged for the swap.
    UncoveredCommitment {
        /// The swap.
        swap_id: String,
        /// Value of the unresolved taker-funded hops, plus any hop about to be funded.
        committed: Amount,
        /// Value of the swap's SwapInFlight coins.
        tagged: Amount,
    },
    /// CBOR serialization or deserialization errors.
    Deserialize(serde_cbor::Error),
    /// JSON serialization or deserialization errors.
    Json(serde_json::Error),
    /// General errors with a custom message.
    General(String),
}

impl TakerError {
    /// The maker responsible for this error, if any.
    pub fn faulty_maker(&self) -> Option<&MakerAddress> {
        match self {
            TakerError::MakerProtocol { maker, .. }
            | TakerError::MakerTimeout { maker, .. }
            | TakerError::MakerRejected { maker, .. } => Some(maker),
            _ => None,
        }
    }
}

impl std::fmt::Display for TakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TakerError::NoRoute(e) => write!(f, "{e}"),
            TakerError::MakerProtocol { maker, hop, reason } => {
                write!(f, "maker {maker} violated protocol at hop {hop}: {reason}")
            }
            TakerError::MakerTimeout { maker, hop } => {
                write!(f, "maker {maker} timed out at hop {hop}")
            }
            TakerError::MakerRejected { maker, reason } => {
                write!(f, "maker {maker} rejected the hop: {reason}")
            }
            TakerError::ChainUnavailable(e) => write!(f, "chain unavailable: {e}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl std::error::Error for TakerError {}

impl From<NoRouteError> for TakerError {
    fn from(value: NoRouteError) -> Self {
        Self::NoRoute(value)
    }
}

impl From<serde_cbor::Error> for TakerError {
    fn from(value: serde_cbor::Error) -> Self {
        Self::Deserialize(value)
    }
}

impl From<serde_json::Error> for TakerError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<WalletError> for TakerError {
    fn from(value: WalletError) -> Self {
        Self::Wallet(value)
    }
}

impl From<std::io::Error> for TakerError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<NetError> for TakerError {
    fn from(value: NetError) -> Self {
        Self::Net(value)
    }
}

impl From<ProtocolError> for TakerError {
    fn from(value: ProtocolError) -> Self {
        Self::Protocol(value)
    }
}

impl From<ContractError> for TakerError {
    fn from(value: ContractError) -> Self {
        Self::Contract(value)
    }
}

impl From<ChainError> for TakerError {
    fn from(value: ChainError) -> Self {
        Self::ChainUnavailable(value)
    }
}

/// Error returned by [`Taker::do_coinswap`](crate::taker::Taker::do_coinswap).
#[derive(Debug)]
pub enum SwapError {
    /// The wallet cannot fund the swap. No attempt was created.
    InsufficientFunds {
        /// Spendable balance.
        available: Amount,
        /// Amount needed including the funding fee.
        required: Amount,
    },
    /// Another swap is already running on this taker.
    SwapInProgress,
    /// The parameters cannot describe a swap. No attempt was created.
    InvalidParams(String),
    /// The attempt ended Aborted or Recovering.
    Failed {
        /// What made the attempt fail.
        cause: TakerError,
        /// Report of the failed attempt.
        report: Box<SwapReport>,
    },
}

impl SwapError {
    /// Report of the failed attempt, when one was created.
    pub fn report(&self) -> Option<&SwapReport> {
        match self {
            SwapError::Failed { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Underlying cause of a failed attempt.
    pub fn cause(&self) -> Option<&TakerError> {
        match self {
            SwapError::Failed { cause, .. } => Some(cause),
            _ => None,
        }
    }
}

impl std::fmt::Display for SwapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwapError::InsufficientFunds {
                available,
                required,
            } => write!(
                f,
                "insufficient funds: {} sats available, {} sats required",
                available.to_sat(),
                required.to_sat()
            ),
            SwapError::SwapInProgress => write!(f, "a swap is already in progress"),
            SwapError::InvalidParams(msg) => write!(f, "invalid swap parameters: {msg}"),
            SwapError::Failed { cause, report } => {
                write!(f, "swap {} ended {}: {cause}", report.swap_id, report.status)
            }
        }
    }
}

impl std::error::Error for SwapError {}
