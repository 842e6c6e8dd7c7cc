//! The unit of work held by a queue.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Fixed bookkeeping cost charged to every entry on top of its payload.
///
/// Changing this changes the accounted size of every stored record, so it
/// must stay stable across restarts.
pub const BASE_OVERHEAD: usize = 64;

/// Identifier of an entry
///
/// Derived from the wall clock in nanoseconds and forced to be strictly
/// increasing within a process, so ids double as creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

static LAST_ID: AtomicU64 = AtomicU64::new(0);

impl EntryId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Generate a new id, strictly greater than every id generated before it
    /// in this process.
    #[must_use]
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));

        let mut last = LAST_ID.load(Ordering::Relaxed);
        loop {
            let next = now.max(last.saturating_add(1));
            match LAST_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(actual) => last = actual,
            }
        }
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Parse an id from a record filename like `1718035200000000000.bin`
    ///
    /// Anything that is not plain decimal digits followed by `.bin` is
    /// rejected, which rules out path separators and traversal patterns.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        let stem = filename.strip_suffix(".bin")?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        stem.parse().ok().map(Self)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry priority, 0 (lowest) to 9 (highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Self = Self(0);
    pub const NORM: Self = Self(5);
    pub const MAX: Self = Self(9);

    /// # Errors
    /// If `value` is above [`Priority::MAX`]
    pub fn new(value: u8) -> Result<Self, StoreError> {
        if value > Self::MAX.0 {
            return Err(StoreError::InvalidEntry(format!(
                "Priority {value} is out of range 0-9"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORM
    }
}

impl TryFrom<u8> for Priority {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the queue (destination) that owns an entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageId(Arc<str>);

impl StorageId {
    const MAX_LEN: usize = 128;

    /// # Errors
    /// If the name is empty, too long, does not start with an ASCII
    /// alphanumeric, or uses characters other than those, `-`, `_` and `.`
    pub fn new(name: impl Into<String>) -> Result<Self, StoreError> {
        let name = name.into();
        if name.is_empty() || name.len() > Self::MAX_LEN {
            return Err(StoreError::InvalidEntry(format!(
                "Storage id must be between 1 and {} characters",
                Self::MAX_LEN
            )));
        }

        // Doubles as a directory name, so it may not start with a dot
        if !name.starts_with(|c: char| c.is_ascii_alphanumeric())
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(StoreError::InvalidEntry(format!(
                "Storage id {name:?} contains invalid characters"
            )));
        }

        Ok(Self(Arc::from(name)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StorageId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StorageId> for String {
    fn from(id: StorageId) -> Self {
        id.0.to_string()
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch, as used by [`Entry::expires_at`].
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// One queued unit of work.
///
/// The payload is opaque. Two entries are equal when their ids are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    id: EntryId,
    priority: Priority,
    persistent: bool,
    size_in_bytes: usize,
    storage_id: StorageId,
    swapped: bool,
    expires_at: Option<u64>,
    payload: Arc<[u8]>,
}

impl Entry {
    /// Create a fresh entry with a newly generated id.
    #[must_use]
    pub fn new(
        storage_id: StorageId,
        priority: Priority,
        persistent: bool,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        let payload = payload.into();
        Self {
            id: EntryId::generate(),
            priority,
            persistent,
            size_in_bytes: BASE_OVERHEAD + payload.len() + storage_id.as_str().len(),
            storage_id,
            swapped: false,
            expires_at: None,
            payload,
        }
    }

    /// Rebuild an entry from persisted metadata, keeping its original id and
    /// accounted size.
    #[must_use]
    pub fn recovered(
        id: EntryId,
        size_in_bytes: usize,
        storage_id: StorageId,
        priority: Priority,
        persistent: bool,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            id,
            priority,
            persistent,
            size_in_bytes,
            storage_id,
            swapped: false,
            expires_at: None,
            payload: payload.into(),
        }
    }

    /// Expire the entry at `expires_at` milliseconds since the Unix epoch.
    #[must_use]
    pub const fn with_expiry(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub const fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub const fn is_persistent(&self) -> bool {
        self.persistent
    }

    #[must_use]
    pub const fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    #[must_use]
    pub const fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    #[must_use]
    pub const fn is_swapped(&self) -> bool {
        self.swapped
    }

    #[must_use]
    pub const fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }

    pub(crate) const fn set_swapped(&mut self, swapped: bool) {
        self.swapped = swapped;
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}
