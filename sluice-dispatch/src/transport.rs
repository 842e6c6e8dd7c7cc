//! Collaborators the dispatch core calls out to.

use std::fmt;

use async_trait::async_trait;
use sluice_common::tracing::{info, warn};
use sluice_store::{Entry, StorageId};

use crate::{DispatchAction, DispatchError, TransportError};

/// Delivers entries to a destination.
///
/// A transport also reports its connection health back through
/// [`crate::DispatchManager::on_connection_state_change`] (or the
/// [`crate::Broker`] equivalent); the dispatch core never probes it.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Deliver one entry. Returning `Ok` means the entry is gone for good.
    async fn send(&self, entry: &Entry) -> Result<(), TransportError>;
}

/// Why entries were discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestroyReason {
    /// A rule said `Destroy`
    Policy,
    /// The entry's expiry passed while it was queued
    Expired,
}

impl DestroyReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives everything the dispatch core could not deliver.
///
/// Retrying is the handler's business; the core only reports.
pub trait ErrorHandler: Send + Sync + fmt::Debug {
    /// Entries that failed. For transport failures they are already back in
    /// the queue; for [`DispatchError::Lost`] they are gone.
    fn handle_error(&self, destination: &StorageId, entries: &[Entry], error: &DispatchError);

    /// Entries that were discarded on purpose.
    fn handle_destroyed(&self, destination: &StorageId, entries: &[Entry], reason: DestroyReason);

    /// Entries whose sender asked to be told about the action taken.
    fn handle_notice(&self, _destination: &StorageId, _entries: &[Entry], _action: DispatchAction) {}
}

/// An [`ErrorHandler`] that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn handle_error(&self, destination: &StorageId, entries: &[Entry], error: &DispatchError) {
        for entry in entries {
            warn!(
                destination = %destination,
                id = %entry.id(),
                priority = %entry.priority(),
                error = %error,
                "Dispatch failure"
            );
        }
    }

    fn handle_destroyed(&self, destination: &StorageId, entries: &[Entry], reason: DestroyReason) {
        info!(
            destination = %destination,
            count = entries.len(),
            reason = %reason,
            "Entries destroyed"
        );
    }

    fn handle_notice(&self, destination: &StorageId, entries: &[Entry], action: DispatchAction) {
        for entry in entries {
            info!(
                destination = %destination,
                id = %entry.id(),
                action = ?action,
                "Sender notification requested"
            );
        }
    }
}
