//! Error types for the testfarm client transport.

use thiserror::Error;

/// Errors raised by the codec, the channels and the client orchestrator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote end refused the connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that refused the connection.
        addr: String,
    },

    /// Connecting took longer than the configured timeout.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address being connected to.
        addr: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// A read on an accepted connection took longer than the configured timeout.
    #[error("read timeout after {timeout_ms}ms from {peer}")]
    ReadTimeout {
        /// Peer address of the stalled connection.
        peer: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// A decoded message is missing required fields or carries malformed values.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// What was wrong with the message.
        reason: String,
    },

    /// An operation code that does not belong to the operation kind.
    #[error("unknown {kind} operation code: {code}")]
    UnknownOperation {
        /// Operation kind (test, file, product, registry).
        kind: &'static str,
        /// The offending code as received.
        code: String,
    },

    /// A host:port string that could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Submission-time validation failure.
    #[error("invalid test {test_id}: {reason}")]
    InvalidTest {
        /// Test identifier as submitted.
        test_id: String,
        /// Why the test was rejected.
        reason: String,
    },

    /// A test with the same identifier is already registered.
    #[error("test {0} is already registered")]
    DuplicateTest(String),

    /// No registry exists for the test identifier.
    #[error("test {0} is not registered")]
    UnknownTest(String),

    /// Neither the listener nor the workspace could supply a file to PUT.
    #[error("no source for file {name} in {directory}")]
    FileUnavailable {
        /// Directory the file was looked up in.
        directory: String,
        /// File name.
        name: String,
    },

    /// The channel or client has been shut down.
    #[error("{0} is shut down")]
    Shutdown(String),

    /// Underlying socket or filesystem error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        TransportError::InvalidMessage {
            reason: reason.into(),
        }
    }
}
