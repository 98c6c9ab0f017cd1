//! Chain-feed error types.

/// The chain feed could not answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Node or indexer unreachable.
    Unavailable(String),
    /// The node answered with something that cannot be interpreted.
    InvalidResponse(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for ChainError {}

/// Errors that can occur while waiting on chain state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherError {
    /// The awaited condition was not met in time.
    Timeout,
    /// The wait was interrupted by the caller.
    Interrupted,
    /// The chain feed failed.
    Chain(ChainError),
}

impl From<ChainError> for WatcherError {
    fn from(value: ChainError) -> Self {
        WatcherError::Chain(value)
    }
}

impl std::fmt::Display for WatcherError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
