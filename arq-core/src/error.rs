//! Error type for the protocol engine.

use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, crate::error::Error>;

/// Errors produced by the protocol engine.
///
/// A decode error aborts processing of the offending datagram but leaves
/// the control block in a usable state; nothing here is fatal to the
/// connection itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Datagram is tagged for a different conversation.
    #[error("conversation id mismatch: expected {expected:#010x}, got {got:#010x}")]
    ConvMismatch { expected: u32, got: u32 },

    /// Datagram (or remainder of one) is shorter than a segment header.
    #[error("datagram shorter than a segment header: {0} bytes")]
    ShortDatagram(usize),

    /// Header declares more payload than the datagram carries.
    #[error("truncated payload: header declares {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },

    /// The command byte is none of PUSH/ACK/WASK/WINS.
    #[error("unknown command byte {0}")]
    UnknownCommand(u8),

    /// A message would fragment into more segments than a receive window
    /// can ever hold.
    #[error("message would span {0} fragments, exceeding the receive window")]
    OversizedMessage(usize),

    /// No segment is queued for delivery.
    #[error("receive queue is empty")]
    RecvQueueEmpty,

    /// The message at the head of the receive queue is still missing
    /// fragments.
    #[error("head message is missing fragments")]
    FragmentsMissing,

    /// The caller's buffer cannot hold the next message.
    #[error("buffer too small: next message is {needed} bytes")]
    BufferTooSmall { needed: usize },

    /// Requested MTU cannot fit a segment header.
    #[error("mtu {0} is below the protocol minimum")]
    MtuTooSmall(u32),
}
