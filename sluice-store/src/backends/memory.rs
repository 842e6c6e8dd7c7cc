use std::{
    collections::HashMap,
    io,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{Entry, EntryId, StoreError, r#trait::BackingStore};

/// In-memory backing store implementation
///
/// Records live in a `HashMap` protected by an `RwLock`, so nothing
/// survives the process. Useful for tests and for destinations that only
/// ever carry non-persistent entries.
///
/// # Capacity Management
/// The store can be limited to a number of records. Once the limit is
/// reached, puts of new ids fail with [`StoreError::Unavailable`], the same
/// way a full disk would.
#[derive(Debug, Clone)]
pub struct MemoryBackingStore {
    pub(crate) records: Arc<RwLock<HashMap<EntryId, Entry>>>,
    /// Maximum number of records to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    /// Create a new empty memory-backed store with unlimited capacity
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            capacity: None,
        }
    }

    /// Create a new memory-backed store with a capacity limit
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            capacity: Some(capacity),
        }
    }

    /// Get the current number of records in the store
    ///
    /// Recovers gracefully if the lock is poisoned by accessing the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the configured capacity (None = unlimited)
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub(crate) fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn put(&self, entry: &Entry) -> crate::Result<()> {
        let mut records = self.records.write()?;

        // Overwriting an existing record never counts against capacity
        if let Some(cap) = self.capacity
            && !records.contains_key(&entry.id())
            && records.len() >= cap
        {
            return Err(StoreError::Unavailable(io::Error::new(
                io::ErrorKind::StorageFull,
                format!(
                    "Memory store capacity exceeded: {}/{cap} records",
                    records.len()
                ),
            )));
        }

        records.insert(entry.id(), entry.clone());
        Ok(())
    }

    async fn get(&self, id: EntryId) -> crate::Result<Entry> {
        self.records
            .read()?
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn delete(&self, id: EntryId) -> crate::Result<()> {
        self.records.write()?.remove(&id);
        Ok(())
    }

    async fn exists(&self, id: EntryId) -> crate::Result<bool> {
        Ok(self.records.read()?.contains_key(&id))
    }

    async fn count(&self) -> crate::Result<usize> {
        Ok(self.records.read()?.len())
    }

    async fn list(&self) -> crate::Result<Vec<EntryId>> {
        let mut ids: Vec<_> = self.records.read()?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
