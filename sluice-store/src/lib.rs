//! Tiered, priority-ordered message storage.
//!
//! Entries live in a bounded memory tier ([`TieredStore`]) backed by a
//! persistent tier ([`BackingStore`]), and are handed out in priority order
//! by a [`MessageQueue`].

pub mod backends;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod lru;
pub mod queue;
pub mod r#trait;

pub use backends::{FileBackingStore, MemoryBackingStore, TestBackingStore};
pub use cache::{CacheStatistics, RecoveredEntry, TieredStore};
pub use config::{BackendConfig, MemoryConfig, StoreConfig};
pub use entry::{BASE_OVERHEAD, Entry, EntryId, Priority, StorageId, now_ms};
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use lru::LruIndex;
pub use queue::{MessageQueue, Position};
pub use r#trait::BackingStore;
