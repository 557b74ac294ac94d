//! Domain-specific error types for the fuzzlink protocol.
//!
//! All fallible operations return `Result<T, FuzzlinkError>`.
//! Invalid input never panics; every error is typed.
//!
//! Errors fall into three groups:
//! - **session-fatal** (`is_session_fatal`): transport failures and
//!   handshake problems; the channel must be torn down.
//! - **protocol breaches** by a peer that is otherwise healthy
//!   (duplicate ids, stray results, busy slots).
//! - **encoding** problems surfaced while building a frame locally.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the fuzzlink protocol.
#[derive(Debug, Error)]
pub enum FuzzlinkError {
    // ── Frame Errors ─────────────────────────────────────────────
    /// A frame was truncated, oversized, carried the wrong magic, failed
    /// its checksum, or its body did not match the tagged variant.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A tag did not map to any known message variant.
    #[error("unknown {family} variant tag: {tag:#x}")]
    UnknownVariant { family: &'static str, tag: u32 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Session Errors ───────────────────────────────────────────
    /// The peer did not complete the handshake in time.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The peer runs a different architecture or revision.
    #[error("incompatible peer: {0}")]
    Incompatible(String),

    /// Executor-side setup failed badly enough that the session is useless.
    #[error("executor setup failed: {0}")]
    SetupFailed(String),

    /// A message arrived that is not valid in the current session phase.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Execution Errors ─────────────────────────────────────────
    /// The host tried to reuse an id that is still outstanding.
    #[error("execution id {0} is already outstanding")]
    DuplicateRequest(u64),

    /// A result arrived for an id that is not outstanding.
    #[error("unexpected result for execution id {0}")]
    UnexpectedResult(u64),

    /// A request targeted a worker slot that already runs a program.
    #[error("worker slot {slot} is busy with execution id {busy_with}")]
    SlotBusy { slot: usize, busy_with: u64 },

    /// A program failed and the request did not ask for `ReturnError`.
    #[error("execution {id} failed: {reason}")]
    ExecutionFailed { id: u64, reason: String },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The channel to the peer closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl FuzzlinkError {
    /// Returns `true` if the error leaves the channel in an unusable state.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_)
                | Self::UnknownVariant { .. }
                | Self::HandshakeTimeout(_)
                | Self::Incompatible(_)
                | Self::SetupFailed(_)
                | Self::ExecutionFailed { .. }
                | Self::Connection(_)
                | Self::ChannelClosed
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for FuzzlinkError {
    fn from(s: String) -> Self {
        FuzzlinkError::Other(s)
    }
}

impl From<&str> for FuzzlinkError {
    fn from(s: &str) -> Self {
        FuzzlinkError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for FuzzlinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        FuzzlinkError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = FuzzlinkError::UnknownVariant {
            family: "HostMessage",
            tag: 0x42,
        };
        assert!(e.to_string().contains("HostMessage"));
        assert!(e.to_string().contains("0x42"));

        let e = FuzzlinkError::SlotBusy {
            slot: 3,
            busy_with: 17,
        };
        assert!(e.to_string().contains("slot 3"));
        assert!(e.to_string().contains("17"));
    }

    #[test]
    fn from_string() {
        let e: FuzzlinkError = "something broke".into();
        assert!(matches!(e, FuzzlinkError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: FuzzlinkError = io_err.into();
        assert!(matches!(e, FuzzlinkError::Connection(_)));
        assert!(e.is_session_fatal());
    }

    #[test]
    fn protocol_breaches_are_not_fatal() {
        assert!(!FuzzlinkError::DuplicateRequest(1).is_session_fatal());
        assert!(!FuzzlinkError::UnexpectedResult(1).is_session_fatal());
        assert!(FuzzlinkError::HandshakeTimeout(Duration::from_secs(1)).is_session_fatal());
    }
}
