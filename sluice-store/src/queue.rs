//! Priority-ordered queue over a [`TieredStore`].
//!
//! The queue keeps its own index of `(priority, id)` keys, independent of
//! the store's recency order. Entries come out highest priority first and,
//! within a priority, oldest id first. Because a requeued entry keeps its
//! id, it sorts straight back to where it was.

use std::{
    cmp::Reverse,
    collections::BTreeSet,
    ops::Bound::{Excluded, Unbounded},
    sync::Arc,
};

use ahash::AHashMap;
use sluice_common::tracing::{self, error, warn};
use tokio::sync::{Mutex, Notify};

use crate::{Entry, EntryId, Priority, StorageId, StoreError, TieredStore};

/// Where an entry sits in queue order. Smaller positions are taken first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    priority: Reverse<Priority>,
    id: EntryId,
}

impl Position {
    #[must_use]
    pub const fn new(priority: Priority, id: EntryId) -> Self {
        Self {
            priority: Reverse(priority),
            id,
        }
    }

    #[must_use]
    pub const fn of(entry: &Entry) -> Self {
        Self::new(entry.priority(), entry.id())
    }
}

#[derive(Debug, Default)]
struct QueueIndex {
    positions: BTreeSet<Position>,
    sizes: AHashMap<EntryId, (Priority, usize)>,
    bytes: usize,
    /// Entries the store dropped that have been unlinked but not yet reported
    lost: Vec<Entry>,
}

impl QueueIndex {
    fn insert(&mut self, priority: Priority, id: EntryId, size: usize) {
        self.remove(id);
        self.positions.insert(Position::new(priority, id));
        self.sizes.insert(id, (priority, size));
        self.bytes += size;
    }

    fn remove(&mut self, id: EntryId) -> bool {
        let Some((priority, size)) = self.sizes.remove(&id) else {
            return false;
        };

        self.positions.remove(&Position::new(priority, id));
        self.bytes -= size;
        true
    }
}

/// A destination's queue.
#[derive(Debug)]
pub struct MessageQueue {
    store: Arc<TieredStore>,
    index: Mutex<QueueIndex>,
    notify: Arc<Notify>,
}

impl MessageQueue {
    /// Create an empty queue over `store`.
    #[must_use]
    pub fn new(store: Arc<TieredStore>) -> Self {
        Self {
            store,
            index: Mutex::new(QueueIndex::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Create a queue over `store`, recovering whatever persistent entries
    /// its backing store already holds.
    ///
    /// # Errors
    /// If recovery fails
    pub async fn open(store: Arc<TieredStore>) -> crate::Result<Self> {
        let recovered = store.recover().await?;
        let queue = Self::new(store);

        {
            let mut index = queue.index.lock().await;
            for entry in recovered {
                index.insert(entry.priority, entry.id, entry.size_in_bytes);
            }
        }

        Ok(queue)
    }

    #[must_use]
    pub fn storage_id(&self) -> &StorageId {
        self.store.storage_id()
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    /// Signalled once for every enqueued entry.
    #[must_use]
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Add an entry and wake whoever waits for work.
    ///
    /// # Errors
    /// If the store rejects the entry. Nothing is queued in that case.
    pub async fn enqueue(&self, entry: Entry) -> crate::Result<()> {
        self.insert(entry).await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Put an entry back after it was taken. It keeps its original position
    /// and does not wake the dispatcher.
    ///
    /// # Errors
    /// If the store rejects the entry
    pub async fn requeue(&self, entry: Entry) -> crate::Result<()> {
        self.insert(entry).await
    }

    #[tracing::instrument(level = "debug", skip(self, entry), fields(storage = %self.storage_id(), id = %entry.id()))]
    async fn insert(&self, entry: Entry) -> crate::Result<()> {
        if entry.storage_id() != self.store.storage_id() {
            return Err(StoreError::InvalidEntry(format!(
                "entry {} belongs to {}, not {}",
                entry.id(),
                entry.storage_id(),
                self.storage_id()
            )));
        }

        let mut index = self.index.lock().await;
        let (priority, id, size) = (entry.priority(), entry.id(), entry.size_in_bytes());

        self.store.write(entry).await?;
        index.insert(priority, id, size);
        self.reconcile(&mut index).await;

        Ok(())
    }

    /// Unlink entries the store had to drop.
    async fn reconcile(&self, index: &mut QueueIndex) {
        for entry in self.store.take_dropped().await {
            if index.remove(entry.id()) {
                index.lost.push(entry);
            }
        }
    }

    /// Up to `n` entries in queue order, without removing them.
    ///
    /// # Errors
    /// If the store fails to produce an entry
    pub async fn peek(&self, n: usize) -> crate::Result<Vec<Entry>> {
        let mut index = self.index.lock().await;
        let positions: Vec<_> = index.positions.iter().take(n).copied().collect();

        let mut entries = Vec::with_capacity(positions.len());
        for position in positions {
            match self.store.read(position.id).await? {
                Some(entry) => entries.push(entry),
                None => {
                    warn!(id = %position.id, "Queued entry is missing from the store");
                    index.remove(position.id);
                }
            }
        }

        self.reconcile(&mut index).await;
        Ok(entries)
    }

    /// Remove and return up to `n` entries in queue order.
    ///
    /// # Errors
    /// If the store fails. Entries already removed in this call are put
    /// back first.
    pub async fn take(&self, n: usize) -> crate::Result<Vec<Entry>> {
        self.take_after(None, n).await
    }

    /// Like [`MessageQueue::take`], but only considers entries positioned
    /// after `after`.
    ///
    /// # Errors
    /// If the store fails. Entries already removed in this call are put
    /// back first.
    #[tracing::instrument(level = "debug", skip(self), fields(storage = %self.storage_id()))]
    pub async fn take_after(&self, after: Option<Position>, n: usize) -> crate::Result<Vec<Entry>> {
        self.detach_after(after, n, false).await
    }

    /// Like [`MessageQueue::take_after`], but persistent entries keep their
    /// durable record while they are out. Once an entry has been delivered
    /// or destroyed, [`MessageQueue::settle`] removes the record; an entry
    /// put back with [`MessageQueue::requeue`] simply overwrites it.
    ///
    /// # Errors
    /// If the store fails. Entries already checked out in this call are put
    /// back first.
    #[tracing::instrument(level = "debug", skip(self), fields(storage = %self.storage_id()))]
    pub async fn checkout_after(
        &self,
        after: Option<Position>,
        n: usize,
    ) -> crate::Result<Vec<Entry>> {
        self.detach_after(after, n, true).await
    }

    /// Drop whatever durable record is left of a checked-out entry.
    ///
    /// # Errors
    /// If the backing store fails; the record stays and the entry will be
    /// recovered again after a restart
    pub async fn settle(&self, entry: &Entry) -> crate::Result<()> {
        if !entry.is_persistent() {
            return Ok(());
        }

        let _index = self.index.lock().await;
        self.store.delete(entry.id()).await?;
        Ok(())
    }

    async fn detach_after(
        &self,
        after: Option<Position>,
        n: usize,
        keep_durable: bool,
    ) -> crate::Result<Vec<Entry>> {
        let mut index = self.index.lock().await;

        let range = match after {
            Some(position) => index.positions.range((Excluded(position), Unbounded)),
            None => index.positions.range(..),
        };
        let positions: Vec<_> = range.take(n).copied().collect();

        let mut taken = Vec::with_capacity(positions.len());
        for position in positions {
            let detached = if keep_durable {
                self.store.checkout(position.id).await
            } else {
                self.store.remove(position.id).await
            };
            match detached {
                Ok(Some(entry)) => {
                    index.remove(position.id);
                    taken.push(entry);
                }
                Ok(None) => {
                    warn!(id = %position.id, "Queued entry is missing from the store");
                    index.remove(position.id);
                }
                Err(e) => {
                    self.restore(&mut index, taken).await;
                    return Err(e);
                }
            }
        }

        Ok(taken)
    }

    async fn restore(&self, index: &mut QueueIndex, entries: Vec<Entry>) {
        for entry in entries {
            let (priority, id, size) = (entry.priority(), entry.id(), entry.size_in_bytes());
            match self.store.write(entry.clone()).await {
                Ok(()) => index.insert(priority, id, size),
                Err(e) => {
                    error!(id = %id, error = %e, "Failed to restore taken entry");
                    index.lost.push(entry);
                }
            }
        }
        self.reconcile(index).await;
    }

    /// Remove one entry by id. Returns whether it was queued.
    ///
    /// # Errors
    /// If the store fails
    pub async fn remove(&self, id: EntryId) -> crate::Result<bool> {
        let mut index = self.index.lock().await;
        let stored = self.store.delete(id).await?;
        Ok(index.remove(id) || stored)
    }

    /// Number and total size of queued entries with `min <= priority <= max`.
    pub async fn size_by_priority_range(&self, min: Priority, max: Priority) -> (usize, usize) {
        if min > max {
            return (0, 0);
        }

        let index = self.index.lock().await;
        let from = Position::new(max, EntryId::new(0));
        let to = Position::new(min, EntryId::new(u64::MAX));

        index
            .positions
            .range(from..=to)
            .fold((0, 0), |(count, bytes), position| {
                let size = index.sizes.get(&position.id).map_or(0, |&(_, size)| size);
                (count + 1, bytes + size)
            })
    }

    /// Hand over entries the store lost since the last call, so they can be
    /// reported.
    pub async fn take_lost(&self) -> Vec<Entry> {
        let mut index = self.index.lock().await;
        self.reconcile(&mut index).await;
        std::mem::take(&mut index.lost)
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.sizes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.sizes.is_empty()
    }

    /// Total accounted size of queued entries.
    pub async fn bytes(&self) -> usize {
        self.index.lock().await.bytes
    }
}
