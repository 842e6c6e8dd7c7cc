//! Typed error handling for dispatch operations.

use sluice_store::StoreError;
use thiserror::Error;

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A rule set failed validation. The previous rule set stays active.
    #[error("Invalid dispatch configuration: {0}")]
    InvalidConfig(String),

    /// The transport could not deliver an entry.
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The destination's store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Entries were dropped from memory after their swap-out failed.
    #[error("Entry lost after a failed swap-out")]
    Lost,

    /// No destination with this name has been opened.
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// The destination is shutting down and accepts no more work.
    #[error("Destination {0} is shutting down")]
    Shutdown(String),
}

/// Why a transport refused an entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The channel to the destination is down.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The destination received the entry but refused it.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Specialized `Result` type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_conversion() {
        let err: DispatchError = TransportError::NotConnected("socket closed".to_string()).into();
        assert!(matches!(err, DispatchError::Transport(_)));
        assert_eq!(err.to_string(), "Transport failure: Not connected: socket closed");
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: DispatchError = StoreError::Invariant("broken".to_string()).into();
        assert!(matches!(err, DispatchError::Storage(StoreError::Invariant(_))));
    }
}
