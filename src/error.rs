//! High-level network errors.
//!
//! [`NetError`] is what a [`MakerTransport`](crate::taker::MakerTransport) or a
//! [`MakerDirectory`](crate::market::MakerDirectory) reports when talking to a peer fails.
//! The taker distinguishes transient faults (unreachable, timed out) from a peer answering
//! with something it should never have sent.
use std::error::Error;

/// Network-related errors that can occur while talking to makers and directories.
///
/// Encapsulates errors from:
/// - IO operations
/// - Connection handling
/// - Data serialization
/// - Unexpected peer responses
#[derive(Debug)]
pub enum NetError {
    /// Standard IO errors during network operations.
    IO(std::io::Error),
    /// Connection closed unexpectedly, reached end of stream.
    ReachedEOF,
    /// Connection timed out waiting for response.
    ConnectionTimedOut,
    /// Peer refused the connection.
    ConnectionRefused,
    /// Failed to parse or validate network address.
    InvalidNetworkAddress,
    /// CBOR serialization or deserialization error.
    Cbor(serde_cbor::Error),
    /// Peer answered with a message that does not fit the current protocol step.
    UnexpectedMessage {
        /// Message the taker was waiting for.
        expected: String,
        /// Message the peer actually sent.
        received: String,
    },
}

impl NetError {
    /// Whether the fault is a connectivity problem rather than misbehaviour of the peer.
    pub fn is_transient(&self) -> bool {
        !matches!(self, NetError::UnexpectedMessage { .. } | NetError::Cbor(_))
    }
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error for NetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetError::IO(e) => Some(e),
            NetError::Cbor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetError {
    fn from(value: std::io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_cbor::Error> for NetError {
    fn from(value: serde_cbor::Error) -> Self {
        Self::Cbor(value)
    }
}
