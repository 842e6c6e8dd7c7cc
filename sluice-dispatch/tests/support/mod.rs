//! Test doubles for the dispatch collaborators
#![allow(dead_code)]

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_dispatch::{
    DestroyReason, DispatchAction, DispatchError, ErrorHandler, Transport, TransportError,
};
use sluice_store::{Entry, EntryId, Priority, StorageId};

/// A transport that records what it delivers and can be switched off.
#[derive(Debug, Default)]
pub struct MockTransport {
    available: AtomicBool,
    delivered: Mutex<Vec<Entry>>,
}

impl MockTransport {
    pub fn online() -> Self {
        let transport = Self::default();
        transport.set_available(true);
        transport
    }

    pub fn offline() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<EntryId> {
        self.delivered.lock().iter().map(Entry::id).collect()
    }

    pub fn delivered_priorities(&self) -> Vec<u8> {
        self.delivered
            .lock()
            .iter()
            .map(|entry| entry.priority().get())
            .collect()
    }

    /// Poll until at least `count` entries were delivered.
    pub async fn wait_for_deliveries(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.delivered.lock().len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.delivered.lock().len() >= count
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, entry: &Entry) -> Result<(), TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected("no route".to_string()));
        }
        self.delivered.lock().push(entry.clone());
        Ok(())
    }
}

/// An error handler that remembers every report.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    pub errors: Mutex<Vec<(EntryId, String)>>,
    pub destroyed: Mutex<Vec<(u8, DestroyReason)>>,
    pub notices: Mutex<Vec<(EntryId, DispatchAction)>>,
}

impl RecordingHandler {
    pub fn destroyed_priorities(&self) -> Vec<u8> {
        let mut priorities: Vec<u8> = self.destroyed.lock().iter().map(|(p, _)| *p).collect();
        priorities.sort_unstable();
        priorities
    }
}

impl ErrorHandler for RecordingHandler {
    fn handle_error(&self, _: &StorageId, entries: &[Entry], error: &DispatchError) {
        self.errors
            .lock()
            .extend(entries.iter().map(|entry| (entry.id(), error.to_string())));
    }

    fn handle_destroyed(&self, _: &StorageId, entries: &[Entry], reason: DestroyReason) {
        self.destroyed
            .lock()
            .extend(entries.iter().map(|entry| (entry.priority().get(), reason)));
    }

    fn handle_notice(&self, _: &StorageId, entries: &[Entry], action: DispatchAction) {
        self.notices
            .lock()
            .extend(entries.iter().map(|entry| (entry.id(), action)));
    }
}

pub fn destination(name: &str) -> StorageId {
    StorageId::new(name).expect("valid storage id")
}

pub fn entry(destination: &StorageId, priority: u8, persistent: bool) -> Entry {
    Entry::new(
        destination.clone(),
        Priority::new(priority).expect("valid priority"),
        persistent,
        format!("payload at priority {priority}").into_bytes(),
    )
}
