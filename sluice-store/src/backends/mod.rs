//! Persistent tier implementations
//!
//! - `memory`: In-memory storage for tests and transient deployments
//! - `test`: Memory storage with write notification and fault injection
//! - `file`: One record file per entry, for production use

pub mod file;
pub mod memory;

pub use file::{FileBackingStore, FileBackingStoreBuilder};
pub use memory::MemoryBackingStore;
pub use test::TestBackingStore;
