//! Error types for the ND transport.

use std::io;

use thiserror::Error;

use crate::protocol::HeaderError;

/// How callers are expected to react to an [`NdError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retry later; the connection is intact.
    Transient,
    /// A malformed or unexpected segment; logged and contained.
    Protocol,
    /// The connection is unusable and its queues are purged.
    Fatal,
    /// The request itself is not accepted by this API.
    Rejected,
}

/// Top-level ND errors.
#[derive(Debug, Error)]
pub enum NdError {
    /// Operation would block and the caller asked not to.
    #[error("operation would block")]
    WouldBlock,

    /// A wait was interrupted.
    #[error("interrupted")]
    Interrupted,

    /// The configured send or receive timeout elapsed.
    #[error("timed out")]
    TimedOut,

    /// The memory pool refused a reservation.
    #[error("out of transport memory")]
    NoMemory,

    /// The peer or the local stack tore the connection down.
    #[error("connection reset")]
    ConnectionReset,

    /// The socket is not in a state that allows the operation.
    #[error("not connected")]
    NotConnected,

    /// The message has been fully sent; no further writes are possible.
    #[error("broken pipe")]
    BrokenPipe,

    /// A write would exceed the message length announced at connect time.
    #[error("message too long: {limit} byte limit")]
    MessageTooLong {
        /// Announced total length.
        limit: u32,
    },

    /// Segment header could not be decoded.
    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    /// A well-formed segment that violates the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Legacy socket surface that ND does not implement.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error from the underlying stream socket.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl NdError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            NdError::WouldBlock | NdError::Interrupted | NdError::TimedOut | NdError::NoMemory => {
                ErrorClass::Transient
            }
            NdError::Header(_) | NdError::Protocol(_) => ErrorClass::Protocol,
            NdError::ConnectionReset
            | NdError::NotConnected
            | NdError::BrokenPipe
            | NdError::Io(_) => ErrorClass::Fatal,
            NdError::MessageTooLong { .. } | NdError::Unsupported(_) | NdError::Config(_) => {
                ErrorClass::Rejected
            }
        }
    }

    /// Check if this error is recoverable by retrying.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error is fatal to the connection.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Negative errno-style status code.
    pub fn status(&self) -> i32 {
        match self {
            NdError::WouldBlock => -11,
            NdError::Interrupted => -4,
            NdError::TimedOut => -110,
            NdError::NoMemory => -12,
            NdError::ConnectionReset => -104,
            NdError::NotConnected => -107,
            NdError::BrokenPipe => -32,
            NdError::MessageTooLong { .. } => -90,
            NdError::Header(_) | NdError::Protocol(_) => -71,
            NdError::Unsupported(_) => -38,
            NdError::Config(_) => -22,
            NdError::Io(e) => e.raw_os_error().map(|code| -code).unwrap_or(-5),
        }
    }

    /// Rebuild an error that was recorded on a connection for later report.
    pub(crate) fn duplicate(&self) -> NdError {
        match self {
            NdError::WouldBlock => NdError::WouldBlock,
            NdError::Interrupted => NdError::Interrupted,
            NdError::TimedOut => NdError::TimedOut,
            NdError::NoMemory => NdError::NoMemory,
            NdError::ConnectionReset => NdError::ConnectionReset,
            NdError::NotConnected => NdError::NotConnected,
            NdError::BrokenPipe => NdError::BrokenPipe,
            NdError::MessageTooLong { limit } => NdError::MessageTooLong { limit: *limit },
            NdError::Header(e) => NdError::Header(e.clone()),
            NdError::Protocol(msg) => NdError::Protocol(msg.clone()),
            NdError::Unsupported(what) => NdError::Unsupported(what),
            NdError::Config(msg) => NdError::Config(msg.clone()),
            NdError::Io(e) => NdError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<NdError> for io::Error {
    fn from(err: NdError) -> Self {
        let kind = match &err {
            NdError::WouldBlock => io::ErrorKind::WouldBlock,
            NdError::Interrupted => io::ErrorKind::Interrupted,
            NdError::TimedOut => io::ErrorKind::TimedOut,
            NdError::ConnectionReset => io::ErrorKind::ConnectionReset,
            NdError::NotConnected => io::ErrorKind::NotConnected,
            NdError::BrokenPipe => io::ErrorKind::BrokenPipe,
            NdError::Unsupported(_) => io::ErrorKind::Unsupported,
            NdError::Header(_) | NdError::Protocol(_) => io::ErrorKind::InvalidData,
            NdError::MessageTooLong { .. } | NdError::Config(_) => io::ErrorKind::InvalidInput,
            NdError::NoMemory => io::ErrorKind::OutOfMemory,
            NdError::Io(e) => e.kind(),
        };
        io::Error::new(kind, err)
    }
}

/// Result type for ND operations.
pub type NdResult<T> = Result<T, NdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(NdError::WouldBlock.is_transient());
        assert!(NdError::Interrupted.is_transient());
        assert!(NdError::TimedOut.is_transient());
        assert!(NdError::NoMemory.is_transient());

        assert!(!NdError::ConnectionReset.is_transient());
        assert!(!NdError::Unsupported("ioctl").is_transient());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(NdError::ConnectionReset.is_fatal());
        assert!(NdError::NotConnected.is_fatal());
        assert!(NdError::BrokenPipe.is_fatal());
        assert!(NdError::Io(io::Error::other("test")).is_fatal());

        assert!(!NdError::Protocol("overlap".into()).is_fatal());
        assert!(!NdError::WouldBlock.is_fatal());
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(NdError::Header(HeaderError::InvalidType(9)).class(), ErrorClass::Protocol);
        assert_eq!(NdError::Unsupported("setsockopt").class(), ErrorClass::Rejected);
        assert_eq!(NdError::MessageTooLong { limit: 10 }.class(), ErrorClass::Rejected);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(NdError::WouldBlock.status(), -11);
        assert_eq!(NdError::NotConnected.status(), -107);
        assert_eq!(NdError::Unsupported("poll").status(), -38);
        assert_eq!(NdError::Io(io::Error::other("x")).status(), -5);
    }

    #[test]
    fn test_duplicate_preserves_variant() {
        let err = NdError::Protocol("bad ack".into());
        assert!(matches!(err.duplicate(), NdError::Protocol(m) if m == "bad ack"));
        assert!(matches!(NdError::ConnectionReset.duplicate(), NdError::ConnectionReset));
    }

    #[test]
    fn test_into_io_error() {
        let io: io::Error = NdError::WouldBlock.into();
        assert_eq!(io.kind(), io::ErrorKind::WouldBlock);
    }
}
