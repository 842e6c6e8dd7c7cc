use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use sluice_common::outbound;
use sluice_dispatch::{Transport, TransportError};
use sluice_store::{Entry, StorageId};

/// A transport that accepts everything and logs it.
///
/// Lets a destination be run end to end without a real network transport.
#[derive(Debug)]
pub struct LogSink {
    destination: StorageId,
    delivered: AtomicU64,
}

impl LogSink {
    #[must_use]
    pub const fn new(destination: StorageId) -> Self {
        Self {
            destination,
            delivered: AtomicU64::new(0),
        }
    }

    /// Number of entries accepted so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LogSink {
    async fn send(&self, entry: &Entry) -> Result<(), TransportError> {
        outbound!(
            level = INFO,
            "[{}] entry {} priority={} size={}",
            self.destination,
            entry.id(),
            entry.priority(),
            entry.size_in_bytes()
        );
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
