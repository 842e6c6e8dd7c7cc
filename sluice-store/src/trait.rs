use async_trait::async_trait;

use crate::{Entry, EntryId};

/// The persistent tier: a durable record store addressed by entry id.
///
/// Every record carries the full entry, so an entry can be rebuilt exactly
/// after a restart.
///
/// Implementations report I/O failures as [`crate::StoreError::Unavailable`]
/// and never swallow them.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Store `entry` under its id, overwriting any existing record.
    ///
    /// # Errors
    /// If the record cannot be made durable
    async fn put(&self, entry: &Entry) -> crate::Result<()>;

    /// Fetch the record stored under `id`.
    ///
    /// # Errors
    /// [`crate::StoreError::NotFound`] if there is no such record, or any
    /// storage failure
    async fn get(&self, id: EntryId) -> crate::Result<Entry>;

    /// Remove the record stored under `id`. Removing a missing record is not
    /// an error.
    ///
    /// # Errors
    /// If the record exists but cannot be removed
    async fn delete(&self, id: EntryId) -> crate::Result<()>;

    /// # Errors
    /// If the store cannot be queried
    async fn exists(&self, id: EntryId) -> crate::Result<bool> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// # Errors
    /// If the store cannot be queried
    async fn count(&self) -> crate::Result<usize> {
        Ok(self.list().await?.len())
    }

    /// All stored ids, in ascending order.
    ///
    /// # Errors
    /// If the store cannot be queried
    async fn list(&self) -> crate::Result<Vec<EntryId>>;
}
