use std::sync::Arc;

use serde::Deserialize;

use crate::{
    MessageQueue, StorageId, TieredStore,
    backends::{FileBackingStore, MemoryBackingStore},
    r#trait::BackingStore,
};

/// Where destinations keep their persistent tier
///
/// # Examples
///
/// File-backed store in RON config, one sub-directory per destination:
/// ```ron
/// store: (
///     backend: File((
///         path: "/var/lib/sluice/store",
///     )),
/// )
/// ```
///
/// Memory-backed store with a record limit per destination:
/// ```ron
/// store: (
///     backend: Memory((
///         capacity: Some(1000),
///     )),
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum BackendConfig {
    /// File-based records (production)
    File(FileBackingStore),
    /// Memory-based records (testing/development), lost on restart
    Memory(MemoryConfig),
}

/// Configuration for memory-backed storage
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MemoryConfig {
    /// Maximum number of records per destination (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::File(FileBackingStore::default())
    }
}

/// Storage settings shared by every destination
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    /// Bytes of entries each destination may keep in memory
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: usize,

    /// Entries larger than this are never kept in memory
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: usize,
}

const fn default_max_cache_bytes() -> usize {
    64 * 1024 * 1024
}

const fn default_max_entry_bytes() -> usize {
    1024 * 1024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            max_cache_bytes: default_max_cache_bytes(),
            max_entry_bytes: default_max_entry_bytes(),
        }
    }
}

impl StoreConfig {
    /// Open the persistent tier for one destination
    ///
    /// File-backed destinations live in their own sub-directory, which is
    /// created if needed.
    ///
    /// # Errors
    /// If the directory is invalid or cannot be initialised
    pub fn open_backing_store(&self, storage_id: &StorageId) -> crate::Result<Arc<dyn BackingStore>> {
        match &self.backend {
            BackendConfig::File(root) => {
                let store = FileBackingStore::builder()
                    .path(root.path().join(storage_id.as_str()))
                    .build()?;
                store.init()?;
                Ok(Arc::new(store))
            }
            BackendConfig::Memory(MemoryConfig {
                capacity: Some(capacity),
            }) => Ok(Arc::new(MemoryBackingStore::with_capacity(*capacity))),
            BackendConfig::Memory(MemoryConfig { capacity: None }) => {
                Ok(Arc::new(MemoryBackingStore::new()))
            }
        }
    }

    /// Open a destination's queue, recovering its persistent entries
    ///
    /// # Errors
    /// If the backing store cannot be opened or recovered
    pub async fn open_queue(&self, storage_id: StorageId) -> crate::Result<MessageQueue> {
        let backing = self.open_backing_store(&storage_id)?;
        let store = TieredStore::new(
            storage_id,
            backing,
            self.max_cache_bytes,
            self.max_entry_bytes,
        );
        MessageQueue::open(Arc::new(store)).await
    }
}
