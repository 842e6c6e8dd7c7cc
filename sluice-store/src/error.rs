//! Error types for the sluice-store crate.
//!
//! Storage failures, serialization problems, lookups that miss, and broken
//! accounting invariants are kept apart so callers can decide whether to
//! retry, fall back, or give up.

use std::io;

use thiserror::Error;

use crate::EntryId;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The persistent tier could not complete an operation (disk full,
    /// permissions, backend switched off).
    #[error("Storage unavailable: {0}")]
    Unavailable(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Entry not found in either tier.
    #[error("Entry not found: {0}")]
    NotFound(EntryId),

    /// Store directory or configuration validation failed.
    #[error("Store validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The entry cannot be stored here (wrong destination, bad priority).
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Capacity accounting diverged. The store refuses further work.
    #[error("Store invariant violated: {0}")]
    Invariant(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// Bincode serialization failed.
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Bincode deserialization failed.
    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The record decoded, but does not describe the entry it was stored under.
    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Store directory validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Store path is not a directory.
    #[error("Store path is not a directory: {0}")]
    NotDirectory(String),

    /// Store path contains a `..` component.
    #[error("Store path cannot contain '..' components: {0}")]
    ParentComponent(String),

    /// Store path is relative.
    #[error("Store path must be absolute: {0}")]
    NotAbsolute(String),

    /// Store path points into a system directory.
    #[error("Store path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: String, path: String },

    /// Invalid store configuration.
    #[error("Invalid store configuration: {0}")]
    InvalidConfiguration(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Unavailable(io::Error::other(format!("Lock poisoned: {e}")))
    }
}
