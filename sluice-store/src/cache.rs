//! The tiered cache store: a bounded in-memory tier in front of a
//! [`BackingStore`].
//!
//! Resident entries are tracked by an [`LruIndex`]. When the resident bytes
//! exceed the configured cache size the least recently used entries are
//! evicted; non-persistent entries are swapped out to the backing store on
//! the way, persistent ones are already there. Entries larger than the
//! per-entry limit never become resident.
//!
//! All bookkeeping happens under a single async mutex, which is held across
//! backing store calls so that no two operations interleave on the same id.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use sluice_common::{
    internal,
    tracing::{self, debug, error, warn},
};
use tokio::sync::{Mutex, MutexGuard};

use crate::{Entry, EntryId, LruIndex, Priority, StorageId, StoreError, r#trait::BackingStore};

/// Point-in-time view of a store's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Entries held in memory
    pub resident_count: usize,
    /// Sum of `size_in_bytes` over resident entries
    pub resident_bytes: usize,
    /// Records held by the backing store
    pub durable_count: usize,
    /// Non-persistent entries currently swapped out to the backing store
    pub swap_count: usize,
}

/// What recovery found for one persistent record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveredEntry {
    pub id: EntryId,
    pub priority: Priority,
    pub size_in_bytes: usize,
}

#[derive(Debug)]
struct CacheState {
    resident: AHashMap<EntryId, Entry>,
    lru: LruIndex,
    resident_bytes: usize,
    swapped: AHashSet<EntryId>,
    max_cache_bytes: usize,
    max_entry_bytes: usize,
    /// Non-persistent entries whose swap-out failed, waiting to be reported
    dropped: Vec<Entry>,
    poisoned: Option<String>,
}

impl CacheState {
    /// Record a broken invariant. Every later operation on the store fails.
    fn violated(&mut self, reason: String) -> StoreError {
        error!(reason = %reason, "Tiered store invariant violated, refusing further operations");
        self.poisoned = Some(reason.clone());
        StoreError::Invariant(reason)
    }

    fn admit(&mut self, entry: Entry) -> crate::Result<()> {
        let id = entry.id();
        let Some(bytes) = self.resident_bytes.checked_add(entry.size_in_bytes()) else {
            return Err(self.violated(format!("resident bytes overflow admitting {id}")));
        };

        if self.resident.insert(id, entry).is_some() {
            return Err(self.violated(format!("entry {id} admitted twice")));
        }

        self.resident_bytes = bytes;
        self.lru.touch(id);
        Ok(())
    }

    fn evict_resident(&mut self, id: EntryId) -> crate::Result<Option<Entry>> {
        let Some(entry) = self.resident.remove(&id) else {
            if self.lru.contains(id) {
                return Err(self.violated(format!("{id} is in the LRU index but not resident")));
            }
            return Ok(None);
        };

        if !self.lru.remove(id) {
            return Err(self.violated(format!("{id} is resident but not in the LRU index")));
        }

        self.release(&entry)?;
        Ok(Some(entry))
    }

    /// Take an entry that just left memory off the resident byte count.
    fn release(&mut self, entry: &Entry) -> crate::Result<()> {
        let Some(bytes) = self.resident_bytes.checked_sub(entry.size_in_bytes()) else {
            return Err(self.violated(format!(
                "resident bytes underflow removing {} ({} < {})",
                entry.id(),
                self.resident_bytes,
                entry.size_in_bytes()
            )));
        };
        self.resident_bytes = bytes;
        Ok(())
    }
}

/// A bounded memory tier over a persistent tier, for one destination.
#[derive(Debug)]
pub struct TieredStore {
    storage_id: StorageId,
    backing: Arc<dyn BackingStore>,
    state: Mutex<CacheState>,
}

impl TieredStore {
    #[must_use]
    pub fn new(
        storage_id: StorageId,
        backing: Arc<dyn BackingStore>,
        max_cache_bytes: usize,
        max_entry_bytes: usize,
    ) -> Self {
        Self {
            storage_id,
            backing,
            state: Mutex::new(CacheState {
                resident: AHashMap::new(),
                lru: LruIndex::new(),
                resident_bytes: 0,
                swapped: AHashSet::new(),
                max_cache_bytes,
                max_entry_bytes,
                dropped: Vec::new(),
                poisoned: None,
            }),
        }
    }

    #[must_use]
    pub const fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    #[must_use]
    pub fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.backing
    }

    async fn lock(&self) -> crate::Result<MutexGuard<'_, CacheState>> {
        let state = self.state.lock().await;
        if let Some(reason) = &state.poisoned {
            return Err(StoreError::Invariant(reason.clone()));
        }
        Ok(state)
    }

    /// Store an entry.
    ///
    /// Persistent entries are written through before anything else happens;
    /// if that fails the entry is not stored at all. Oversized entries go to
    /// the backing store only. Everything else becomes resident, after which
    /// the least recently used entries are evicted until the cache fits.
    ///
    /// # Errors
    /// - [`StoreError::InvalidEntry`] if the entry belongs to another destination
    /// - [`StoreError::Unavailable`] if a required backing store write fails
    /// - [`StoreError::Invariant`] if the store is poisoned
    #[tracing::instrument(level = "debug", skip(self, entry), fields(storage = %self.storage_id, id = %entry.id()))]
    pub async fn write(&self, mut entry: Entry) -> crate::Result<()> {
        if entry.storage_id() != &self.storage_id {
            return Err(StoreError::InvalidEntry(format!(
                "entry {} belongs to {}, not {}",
                entry.id(),
                entry.storage_id(),
                self.storage_id
            )));
        }

        let mut state = self.lock().await?;
        let id = entry.id();

        if entry.is_persistent() {
            entry.set_swapped(false);
            self.backing.put(&entry).await?;
        }

        // A rewrite of an id we already hold replaces it
        state.evict_resident(id)?;

        if entry.size_in_bytes() > state.max_entry_bytes {
            if !entry.is_persistent() {
                entry.set_swapped(true);
                self.backing.put(&entry).await?;
            }
            state.swapped.remove(&id);
            debug!(
                size = entry.size_in_bytes(),
                max_entry_bytes = state.max_entry_bytes,
                "Entry too large for memory, stored durably only"
            );
            return Ok(());
        }

        // Only one tier may hold the entry
        if !entry.is_persistent() && state.swapped.contains(&id) {
            self.backing.delete(id).await?;
        }
        state.swapped.remove(&id);

        state.admit(entry)?;
        self.evict(&mut state).await
    }

    /// Evict least recently used entries until the resident bytes fit.
    async fn evict(&self, state: &mut CacheState) -> crate::Result<()> {
        while state.resident_bytes > state.max_cache_bytes {
            let Some(id) = state.lru.evict_oldest() else {
                return Err(state.violated(format!(
                    "{} resident bytes but nothing left to evict",
                    state.resident_bytes
                )));
            };

            let Some(mut entry) = state.resident.remove(&id) else {
                return Err(state.violated(format!("{id} is in the LRU index but not resident")));
            };
            state.release(&entry)?;

            if entry.is_persistent() {
                continue;
            }

            entry.set_swapped(true);
            match self.backing.put(&entry).await {
                Ok(()) => {
                    state.swapped.insert(id);
                    internal!(level = DEBUG, "Swapped out {id} ({} bytes)", entry.size_in_bytes());
                }
                Err(e) => {
                    warn!(
                        id = %id,
                        storage = %self.storage_id,
                        error = %e,
                        "Failed to swap out non-persistent entry, dropping it"
                    );
                    entry.set_swapped(false);
                    state.dropped.push(entry);
                }
            }
        }

        Ok(())
    }

    /// Look an entry up in either tier.
    ///
    /// A miss in memory falls through to the backing store. Entries found
    /// there are re-admitted unless they are oversized; a non-persistent
    /// entry coming back from swap has its swap copy removed.
    ///
    /// # Errors
    /// If the backing store fails, or the store is poisoned
    #[tracing::instrument(level = "debug", skip(self), fields(storage = %self.storage_id))]
    pub async fn read(&self, id: EntryId) -> crate::Result<Option<Entry>> {
        let mut state = self.lock().await?;

        if let Some(entry) = state.resident.get(&id).cloned() {
            state.lru.touch(id);
            return Ok(Some(entry));
        }

        let mut entry = match self.backing.get(id).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        if entry.size_in_bytes() > state.max_entry_bytes {
            return Ok(Some(entry));
        }

        if !entry.is_persistent() {
            self.backing.delete(id).await?;
            state.swapped.remove(&id);
        }

        entry.set_swapped(false);
        state.admit(entry.clone())?;
        self.evict(&mut state).await?;

        Ok(Some(entry))
    }

    /// Remove an entry from both tiers.
    ///
    /// Returns whether the entry existed anywhere. Removing an unknown id
    /// changes nothing.
    ///
    /// # Errors
    /// If the backing store fails, or the store is poisoned
    #[tracing::instrument(level = "debug", skip(self), fields(storage = %self.storage_id))]
    pub async fn delete(&self, id: EntryId) -> crate::Result<bool> {
        let mut state = self.lock().await?;

        // Backing store first, so a failure leaves memory untouched
        let durable = self.backing.exists(id).await?;
        if durable {
            self.backing.delete(id).await?;
        }
        state.swapped.remove(&id);

        let was_resident = state.evict_resident(id)?.is_some();

        Ok(was_resident || durable)
    }

    /// Take an entry out of the store entirely, returning it.
    ///
    /// Unlike [`TieredStore::read`], nothing is re-admitted.
    ///
    /// # Errors
    /// If the backing store fails, or the store is poisoned
    pub async fn remove(&self, id: EntryId) -> crate::Result<Option<Entry>> {
        self.detach(id, false).await
    }

    /// Take an entry out for delivery.
    ///
    /// Same as [`TieredStore::remove`], except that a persistent entry keeps
    /// its durable record until [`TieredStore::delete`] settles it. A crash
    /// while the entry is out therefore leaves it to be recovered. Swap
    /// copies of non-persistent entries are removed as usual.
    ///
    /// # Errors
    /// If the backing store fails, or the store is poisoned
    pub async fn checkout(&self, id: EntryId) -> crate::Result<Option<Entry>> {
        self.detach(id, true).await
    }

    async fn detach(&self, id: EntryId, keep_durable: bool) -> crate::Result<Option<Entry>> {
        let mut state = self.lock().await?;

        if let Some(persistent) = state.resident.get(&id).map(Entry::is_persistent) {
            // Durable copy first, so a failure leaves the entry where it was
            if persistent && !keep_durable {
                self.backing.delete(id).await?;
            }
            return state.evict_resident(id);
        }

        let mut entry = match self.backing.get(id).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        if !(entry.is_persistent() && keep_durable) {
            self.backing.delete(id).await?;
        }
        state.swapped.remove(&id);
        entry.set_swapped(false);

        Ok(Some(entry))
    }

    /// Rebuild the store from what the backing store holds.
    ///
    /// Non-persistent records are swap leftovers from an earlier process and
    /// are deleted. Persistent records are kept, loaded into memory oldest
    /// first while they fit, and returned so the caller can rebuild its
    /// ordering.
    ///
    /// # Errors
    /// If the backing store fails, or the store is poisoned
    pub async fn recover(&self) -> crate::Result<Vec<RecoveredEntry>> {
        let mut state = self.lock().await?;
        let mut recovered = Vec::new();
        let mut discarded = 0usize;

        for id in self.backing.list().await? {
            let mut entry = match self.backing.get(id).await {
                Ok(entry) => entry,
                Err(e) if e.is_not_found() => continue,
                Err(StoreError::Serialization(e)) => {
                    error!(id = %id, error = %e, "Skipping unreadable record during recovery");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if entry.storage_id() != &self.storage_id {
                warn!(
                    id = %id,
                    owner = %entry.storage_id(),
                    storage = %self.storage_id,
                    "Skipping record owned by another destination"
                );
                continue;
            }

            if !entry.is_persistent() {
                self.backing.delete(id).await?;
                discarded += 1;
                continue;
            }

            recovered.push(RecoveredEntry {
                id,
                priority: entry.priority(),
                size_in_bytes: entry.size_in_bytes(),
            });

            let size = entry.size_in_bytes();
            if size <= state.max_entry_bytes
                && state.resident_bytes.saturating_add(size) <= state.max_cache_bytes
                && !state.resident.contains_key(&id)
            {
                entry.set_swapped(false);
                state.admit(entry)?;
            }
        }

        internal!(
            level = INFO,
            "Recovered {} persistent entries for {}, discarded {discarded} swap leftovers",
            recovered.len(),
            self.storage_id
        );

        Ok(recovered)
    }

    /// # Errors
    /// If the backing store cannot be counted, or the store is poisoned
    pub async fn statistics(&self) -> crate::Result<CacheStatistics> {
        let state = self.lock().await?;
        let durable_count = self.backing.count().await?;

        Ok(CacheStatistics {
            resident_count: state.resident.len(),
            resident_bytes: state.resident_bytes,
            durable_count,
            swap_count: state.swapped.len(),
        })
    }

    /// Change the cache size. Applies from the next eviction check.
    pub async fn set_max_cache_bytes(&self, max_cache_bytes: usize) {
        self.state.lock().await.max_cache_bytes = max_cache_bytes;
    }

    /// Change the per-entry size limit. Applies to later writes and reads.
    pub async fn set_max_entry_bytes(&self, max_entry_bytes: usize) {
        self.state.lock().await.max_entry_bytes = max_entry_bytes;
    }

    /// Hand over the entries lost to failed swap-outs since the last call.
    pub async fn take_dropped(&self) -> Vec<Entry> {
        std::mem::take(&mut self.state.lock().await.dropped)
    }

    pub async fn is_resident(&self, id: EntryId) -> bool {
        self.state.lock().await.resident.contains_key(&id)
    }

    /// Release the memory tier.
    ///
    /// Persistent entries remain in the backing store. Non-persistent
    /// entries do not survive this, whether resident or swapped out, and are
    /// returned so the caller can report them. A swap copy that cannot be
    /// read back is left for [`TieredStore::recover`] to clean up.
    pub async fn clear_resident(&self) -> Vec<Entry> {
        let mut state = self.state.lock().await;

        let mut discarded: Vec<Entry> = state
            .resident
            .drain()
            .map(|(_, entry)| entry)
            .filter(|entry| !entry.is_persistent())
            .collect();
        state.lru.clear();
        state.resident_bytes = 0;

        for id in std::mem::take(&mut state.swapped) {
            let entry = match self.backing.get(id).await {
                Ok(entry) => entry,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(id = %id, storage = %self.storage_id, error = %e, "Cannot read back swapped entry");
                    continue;
                }
            };
            if let Err(e) = self.backing.delete(id).await {
                warn!(id = %id, storage = %self.storage_id, error = %e, "Cannot remove swap copy");
            }
            discarded.push(entry);
        }

        discarded
    }

    /// Check the accounting invariants: resident bytes match the resident
    /// entries and stay within the cache size, and the LRU index tracks
    /// exactly the resident ids.
    ///
    /// # Errors
    /// [`StoreError::Invariant`] describing the first violation found
    pub async fn verify(&self) -> crate::Result<()> {
        let state = self.lock().await?;

        let sum: usize = state.resident.values().map(Entry::size_in_bytes).sum();
        if sum != state.resident_bytes {
            return Err(StoreError::Invariant(format!(
                "resident bytes {} != sum of resident sizes {sum}",
                state.resident_bytes
            )));
        }

        if state.resident_bytes > state.max_cache_bytes {
            return Err(StoreError::Invariant(format!(
                "resident bytes {} exceed cache size {}",
                state.resident_bytes, state.max_cache_bytes
            )));
        }

        if state.lru.len() != state.resident.len()
            || state.lru.iter().any(|id| !state.resident.contains_key(&id))
        {
            return Err(StoreError::Invariant(
                "LRU index and resident map diverged".to_string(),
            ));
        }

        Ok(())
    }
}
