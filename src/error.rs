//! Error types for the async transport layer.

use std::fmt;

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, ArqError>;

/// Errors surfaced by streams, listeners, and their driver tasks.
#[derive(Debug, Error)]
pub enum ArqError {
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The protocol engine rejected an operation or a datagram.
    #[error("protocol error: {0}")]
    Protocol(#[from] arq_core::Error),

    /// Connection lifecycle failure.
    #[error("connection error: {0}")]
    Connection(ConnectionError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Why a connection stopped working.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The stream or its driver task has shut down.
    Closed,
    /// The link died: a segment exhausted its retransmission budget.
    Lost,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "connection closed"),
            ConnectionError::Lost => write!(f, "connection lost"),
        }
    }
}

impl ArqError {
    pub(crate) fn closed() -> Self {
        ArqError::Connection(ConnectionError::Closed)
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ArqError::Config(message.into())
    }

    /// True when retrying the operation later could succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ArqError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            ArqError::Protocol(_) => true,
            _ => false,
        }
    }

    /// True when the connection is gone for good.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            ArqError::Connection(ConnectionError::Closed | ConnectionError::Lost)
        )
    }
}
