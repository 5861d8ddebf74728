//! Error types for the Scrutiny server core.

use thiserror::Error;

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, ScrutinyError>;

/// The main error type for the device-facing core.
///
/// Every externally observable failure is a value of this type. Errors are
/// local to the failing request or session; the device handler recovers by
/// going back to discovery.
#[derive(Debug, Error)]
pub enum ScrutinyError {
    // === Communication Errors ===
    /// The link reported itself non-operational
    #[error("Link down: {0}")]
    LinkDown(String),

    /// A response did not arrive within the configured window
    #[error("Response timeout")]
    Timeout,

    /// A frame exchange was attempted while another request was active
    #[error("A request is already awaiting its response")]
    ExchangeBusy,

    // === Protocol Errors ===
    /// CRC mismatch or malformed frame/payload
    #[error("Decode error: {0}")]
    Decode(String),

    /// Unexpected command, subfunction or response code
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request too large for the negotiated buffers
    #[error("Request rejected: {0}")]
    Rejected(String),

    // === Datastore Errors ===
    /// Entry id or display path not present in the datastore
    #[error("Unknown entry: {0}")]
    Unknown(String),

    /// Entry id or display path already present in the datastore
    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    /// A pending target update was replaced by a newer one
    #[error("Target update superseded")]
    Superseded,

    /// Value cannot be represented in the entry's embedded type
    #[error("Value conversion error: {0}")]
    ValueConversion(String),

    // === Configuration Errors ===
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // === IO Errors ===
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // === Internal Errors ===
    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScrutinyError {
    /// Check if this error must tear the session down.
    pub fn is_comm_failure(&self) -> bool {
        matches!(
            self,
            Self::LinkDown(_) | Self::Timeout | Self::Io(_) | Self::ExchangeBusy
        )
    }

    /// Create a link-down error.
    pub fn link_down(msg: impl Into<String>) -> Self {
        Self::LinkDown(msg.into())
    }

    /// Create a decode error.
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Create an unknown-entry error.
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_comm_failure() {
        assert!(ScrutinyError::Timeout.is_comm_failure());
        assert!(ScrutinyError::link_down("test").is_comm_failure());
        assert!(!ScrutinyError::protocol("test").is_comm_failure());
        assert!(!ScrutinyError::Superseded.is_comm_failure());
    }
}
