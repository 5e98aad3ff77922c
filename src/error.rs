//! Error types for the subscription engine.
//!
//! All errors implement `std::error::Error` and carry enough context to decide
//! whether the session can recover on its own.
//!
//! ## Error Categories
//!
//! - **Transport faults**: resets, timeouts and closed sockets. Recovered by a
//!   disconnect followed by a reconnect.
//! - **Protocol violations**: unexpected success/failure codes, malformed headers.
//! - **Decoding faults**: truncated buffers, missing signal index cache, bad
//!   compressed blocks. The offending packet is dropped wholesale.
//! - **Cryptographic faults**: key rotation or payload decryption failures.
//! - **Caller misuse**: rejected synchronously before any I/O happens.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use feedline::SubscriberError;
//!
//! let error = SubscriberError::transport_failed("publisher refused connection");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for subscriber operations.
pub type Result<T, E = SubscriberError> = std::result::Result<T, E>;

/// Main error type for subscriber operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SubscriberError {
    #[error("Transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Connection was reset by the remote host")]
    ConnectionReset {
        #[source]
        source: std::io::Error,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Command channel is not connected")]
    NotConnected,

    #[error("Protocol violation: {details}")]
    ProtocolViolation { details: String },

    #[error("Decode error in {context}: {details}")]
    Decode { context: String, details: String },

    #[error("Truncated {context}: needed {needed} bytes, {available} available")]
    Truncated { context: &'static str, needed: usize, available: usize },

    #[error("Decompression failure: {details}")]
    Decompression {
        details: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Cryptographic failure: {details}")]
    Crypto { details: String },

    #[error("Invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("Invalid operation: {reason}")]
    Misuse { reason: String },

    #[error("Measurement sink failure: {source}")]
    Sink {
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

impl SubscriberError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SubscriberError::Transport { .. } => true,
            SubscriberError::ConnectionReset { .. } => true,
            SubscriberError::Timeout { .. } => true,
            SubscriberError::NotConnected => true,
            SubscriberError::Io { .. } => true,
            SubscriberError::ProtocolViolation { .. } => false,
            SubscriberError::Decode { .. } => false,
            SubscriberError::Truncated { .. } => false,
            SubscriberError::Decompression { .. } => false,
            SubscriberError::Crypto { .. } => false,
            SubscriberError::Configuration { .. } => false,
            SubscriberError::Misuse { .. } => false,
            SubscriberError::Sink { .. } => false,
        }
    }

    /// Returns true for the reset/aborted class of transport errors that should
    /// follow the disconnect/reconnect path instead of being reported as fatal.
    pub fn is_connection_reset(&self) -> bool {
        match self {
            SubscriberError::ConnectionReset { .. } => true,
            SubscriberError::Io { source } => is_reset_kind(source.kind()),
            _ => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            SubscriberError::Transport { .. } => vec![
                "Verify the publisher is running and reachable",
                "Check the host and port in the connection string",
                "Check firewall rules between subscriber and publisher",
            ],
            SubscriberError::ConnectionReset { .. } => vec![
                "Wait for the automatic reconnect cycle",
                "Check publisher logs for forced disconnects",
            ],
            SubscriberError::Timeout { .. } => vec![
                "Increase the data loss interval",
                "Check network latency to the publisher",
            ],
            SubscriberError::NotConnected => vec![
                "Call start() and wait for the connection to be established",
                "Observe connection state before sending commands",
            ],
            SubscriberError::ProtocolViolation { .. } => vec![
                "Check publisher and subscriber protocol versions",
                "Report the offending response code to the publisher operator",
            ],
            SubscriberError::Decode { .. } | SubscriberError::Truncated { .. } => vec![
                "Verify negotiated operational modes match the publisher",
                "Check for transport corruption on the data channel",
            ],
            SubscriberError::Decompression { .. } => vec![
                "Disable payload compression in the operational modes",
                "Verify the publisher compression mode is supported",
            ],
            SubscriberError::Crypto { .. } => vec![
                "Verify the shared secret matches the publisher",
                "Request a cipher key rotation",
            ],
            SubscriberError::Configuration { .. } => vec![
                "Check the subscriber configuration values",
                "Consult the configuration reference for valid settings",
            ],
            SubscriberError::Misuse { .. } => vec![
                "Check the subscriber lifecycle state before calling this operation",
            ],
            SubscriberError::Io { .. } => vec![
                "Check local network interfaces",
                "Retry the operation after reconnect",
            ],
            SubscriberError::Sink { .. } => vec![
                "Check the time-alignment settings accepted by the measurement sink",
            ],
        }
    }

    /// Helper constructor for transport errors.
    pub fn transport_failed(reason: impl Into<String>) -> Self {
        SubscriberError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        SubscriberError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for decode errors.
    pub fn decode_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        SubscriberError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for truncated buffers.
    pub fn truncated(context: &'static str, needed: usize, available: usize) -> Self {
        SubscriberError::Truncated { context, needed, available }
    }

    /// Helper constructor for protocol violations.
    pub fn protocol_violation(details: impl Into<String>) -> Self {
        SubscriberError::ProtocolViolation { details: details.into() }
    }

    /// Helper constructor for decompression failures.
    pub fn decompression_failed(
        details: impl Into<String>,
        source: Option<std::io::Error>,
    ) -> Self {
        SubscriberError::Decompression { details: details.into(), source }
    }

    /// Helper constructor for cryptographic failures.
    pub fn crypto_error(details: impl Into<String>) -> Self {
        SubscriberError::Crypto { details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn configuration_error(reason: impl Into<String>) -> Self {
        SubscriberError::Configuration { reason: reason.into() }
    }

    /// Helper constructor for caller misuse.
    pub fn misuse(reason: impl Into<String>) -> Self {
        SubscriberError::Misuse { reason: reason.into() }
    }
}

fn is_reset_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

impl From<std::io::Error> for SubscriberError {
    fn from(err: std::io::Error) -> Self {
        if is_reset_kind(err.kind()) {
            SubscriberError::ConnectionReset { source: err }
        } else {
            SubscriberError::Io { source: err }
        }
    }
}

impl From<serde_yaml_ng::Error> for SubscriberError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        SubscriberError::Configuration { reason: err.to_string() }
    }
}
