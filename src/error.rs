//! Error types for the Tor provider library.
//!
//! One error enum covers the whole stack: transport failures, protocol
//! framing problems, command rejections, daemon lifecycle errors, and
//! timeouts. Every public operation either resolves with data or fails
//! with one of these variants.

use std::io;
use thiserror::Error;

/// The main error type for all Tor provider operations.
#[derive(Error, Debug)]
pub enum TorError {
    /// I/O error on the control socket or while touching daemon files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the control connection.
    ///
    /// Distinct from [`TorError::Io`] so callers can tell "stream ended"
    /// apart from "stream broken".
    #[error("control connection closed")]
    ConnectionClosed,

    /// Could not establish a control connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The daemon rejected our credentials. Fatal for the connection.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A command received a 4xx/5xx reply.
    ///
    /// Carries the daemon's numeric status and message text so callers can
    /// distinguish "feature unsupported" from "transient failure" without
    /// re-parsing anything.
    #[error("command rejected (status {status}): {message}")]
    Command {
        /// The 3-digit status code returned by the daemon.
        status: u16,
        /// The daemon's own message text.
        message: String,
    },

    /// Malformed line or message framing. The connection is unsalvageable
    /// because the byte stream's framing state can no longer be trusted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A well-framed reply whose contents could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),

    /// Daemon lifecycle error: missing executable or configuration files,
    /// or a launch that failed outright.
    #[error("daemon process error: {0}")]
    Process(String),

    /// The daemon does not support the requested operation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An operation or the connection-acquisition loop timed out.
    #[error("operation timed out")]
    Timeout,
}

/// Result type alias for Tor provider operations.
pub type Result<T> = std::result::Result<T, TorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_carries_status() {
        let err = TorError::Command {
            status: 552,
            message: "Unrecognized option".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("552"));
        assert!(text.contains("Unrecognized option"));
    }

    #[test]
    fn test_connection_closed_distinct_from_io() {
        let closed = TorError::ConnectionClosed;
        let io = TorError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(closed, TorError::ConnectionClosed));
        assert!(matches!(io, TorError::Io(_)));
    }
}
