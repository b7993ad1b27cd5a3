//! Error taxonomy for the runtime.
//!
//! One flat enum covers buffer misuse, channel lifecycle violations, and
//! unwrapped OS errors. I/O errors on a backend surface as `exception_caught`
//! events at the channel's pipeline; write errors fail the write's promise.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation against a channel past CLOSED.
    #[error("channel is closed")]
    ClosedChannel,

    /// Write or read on a channel that is not connected.
    #[error("channel is not yet connected")]
    NotYetConnected,

    /// A connect is already outstanding on this channel.
    #[error("connection attempt already pending")]
    ConnectionPending,

    /// Connect on an already-connected channel.
    #[error("channel is already connected")]
    AlreadyConnected,

    /// The connect did not complete within the configured timeout.
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The given address could not be resolved to a socket address.
    #[error("unresolved address: {0}")]
    UnresolvedAddress(String),

    /// Use of a buffer whose reference count already reached zero.
    #[error("illegal reference count: {count}")]
    IllegalReferenceCount {
        /// Observed count at the failing operation.
        count: usize,
    },

    /// Buffer index or range violation.
    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Mutation of a read-only buffer.
    #[error("buffer is read-only")]
    ReadOnlyBuffer,

    /// The allocator could not obtain memory.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// A codec frame exceeded its configured limit.
    #[error("frame length exceeds {limit} bytes")]
    TooLongFrame {
        /// Configured frame limit.
        limit: usize,
    },

    /// A decoder reported a failure; the runtime propagates it.
    #[error("decoder failure: {0}")]
    Decoder(String),

    /// An encoder reported a failure; the runtime propagates it.
    #[error("encoder failure: {0}")]
    Encoder(String),

    /// Unwrapped OS error.
    #[error("native I/O error: {0}")]
    NativeIo(#[from] io::Error),

    /// API usage error.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Blocking await from inside an event loop thread.
    #[error("blocking operation from inside an event loop")]
    BlockingOperation,

    /// Another operation of the same kind is already in flight.
    #[error("operation already in progress")]
    Busy,

    /// Submission after graceful shutdown began.
    #[error("event loop is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Wrap a raw (positive) errno value as a native I/O error.
    pub fn from_errno(errno: i32) -> Self {
        Error::NativeIo(io::Error::from_raw_os_error(errno))
    }

    /// The raw OS error number, if this is a native I/O error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::NativeIo(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Shared error handle.
///
/// Failure causes fan out to every promise listener, so they are shared
/// rather than cloned.
pub type SharedError = Arc<Error>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_round_trip() {
        let err = Error::from_errno(libc::ECONNRESET);
        assert_eq!(err.errno(), Some(libc::ECONNRESET));
        assert!(Error::ClosedChannel.errno().is_none());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::ClosedChannel.to_string(), "channel is closed");
        assert_eq!(
            Error::IllegalReferenceCount { count: 0 }.to_string(),
            "illegal reference count: 0"
        );
        assert_eq!(
            Error::TooLongFrame { limit: 1024 }.to_string(),
            "frame length exceeds 1024 bytes"
        );
    }
}
