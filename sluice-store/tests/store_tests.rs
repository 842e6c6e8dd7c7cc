#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use pretty_assertions::assert_eq;
use sluice_store::{
    BASE_OVERHEAD, BackingStore, Entry, EntryId, FileBackingStore, MessageQueue, Priority,
    StorageId, TestBackingStore, TieredStore,
};

const NAME: &str = "orders";

fn storage() -> StorageId {
    StorageId::new(NAME).expect("valid storage id")
}

fn sized(size: usize, persistent: bool) -> Entry {
    Entry::new(
        storage(),
        Priority::NORM,
        persistent,
        vec![7u8; size - BASE_OVERHEAD - NAME.len()],
    )
}

fn file_store(dir: &tempfile::TempDir) -> Arc<dyn BackingStore> {
    let store = FileBackingStore::builder()
        .path(dir.path())
        .build()
        .expect("valid path");
    store.init().expect("init");
    Arc::new(store)
}

/// Small deterministic generator so the operation mix is reproducible
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) % bound
    }
}

#[tokio::test]
async fn test_capacity_invariant_holds_after_every_operation() {
    let backing = TestBackingStore::new();
    let store = TieredStore::new(storage(), Arc::new(backing.clone()), 1_000, 400);
    let mut rng = Lcg(0x5eed);
    let mut ids: Vec<EntryId> = Vec::new();

    for _ in 0..500 {
        match rng.next(3) {
            0 => {
                let size = 100 + usize::try_from(rng.next(400)).unwrap();
                let entry = sized(size, rng.next(2) == 0);
                ids.push(entry.id());
                store.write(entry).await.expect("write");
            }
            1 if !ids.is_empty() => {
                let id = ids[usize::try_from(rng.next(ids.len() as u64)).unwrap()];
                store.read(id).await.expect("read");
            }
            _ if !ids.is_empty() => {
                let id = ids.swap_remove(usize::try_from(rng.next(ids.len() as u64)).unwrap());
                store.delete(id).await.expect("delete");
            }
            _ => {}
        }

        store.verify().await.expect("accounting invariants");
    }

    // Nothing was lost: every live id is still readable from some tier
    for id in ids {
        assert!(store.read(id).await.expect("read").is_some(), "{id} lost");
    }
}

#[tokio::test]
async fn test_persistent_entry_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let entry = sized(200, true);

    {
        let store = TieredStore::new(storage(), file_store(&dir), 10_000, 1_000);
        store.write(entry.clone()).await.expect("write");
        // Simulated crash: the memory tier goes away with the process
        store.clear_resident().await;
    }

    let store = TieredStore::new(storage(), file_store(&dir), 10_000, 1_000);
    let read = store
        .read(entry.id())
        .await
        .expect("read")
        .expect("durable entry");

    assert_eq!(read.payload(), entry.payload());
    assert_eq!(read.size_in_bytes(), entry.size_in_bytes());
    assert_eq!(read.priority(), entry.priority());
}

#[tokio::test]
async fn test_oversized_entries_never_resident() {
    let backing = TestBackingStore::new();
    let store = TieredStore::new(storage(), Arc::new(backing.clone()), 10_000, 300);

    for persistent in [true, false] {
        let entry = sized(301, persistent);
        store.write(entry.clone()).await.expect("write");
        assert!(!store.is_resident(entry.id()).await);

        store.read(entry.id()).await.expect("read").expect("found");
        assert!(!store.is_resident(entry.id()).await);
        assert!(backing.exists(entry.id()).await.expect("exists"));
    }

    assert_eq!(store.statistics().await.expect("stats").resident_bytes, 0);
}

fn numbered(id: u64) -> Entry {
    Entry::recovered(
        EntryId::new(id),
        BASE_OVERHEAD,
        storage(),
        Priority::NORM,
        false,
        Vec::new(),
    )
}

#[tokio::test]
async fn test_requeue_preserves_order() {
    let backing = TestBackingStore::new();
    let store = TieredStore::new(storage(), Arc::new(backing), 10_000, 1_000);
    let queue = MessageQueue::new(Arc::new(store));

    for id in 1..=5 {
        queue.enqueue(numbered(id)).await.expect("enqueue");
    }

    let taken = queue.take(5).await.expect("take");
    assert_eq!(
        taken.iter().map(|e| e.id().get()).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );

    // Put back in a scrambled order; ids decide where they land
    for index in [2, 4, 0, 3, 1] {
        queue.requeue(taken[index].clone()).await.expect("requeue");
    }
    let peeked = queue.peek(5).await.expect("peek");
    assert_eq!(
        peeked.iter().map(|e| e.id().get()).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5]
    );

    // Only entry 3 goes back after a partial take
    let taken = queue.take(3).await.expect("take");
    queue.requeue(taken[2].clone()).await.expect("requeue");
    let peeked = queue.peek(5).await.expect("peek");
    assert_eq!(
        peeked.iter().map(|e| e.id().get()).collect::<Vec<_>>(),
        vec![3, 4, 5]
    );
}

#[tokio::test]
async fn test_delete_of_unknown_id_is_a_no_op() {
    let backing = TestBackingStore::new();
    let store = TieredStore::new(storage(), Arc::new(backing.clone()), 300, 1_000);
    for persistent in [true, false, false, false] {
        store.write(sized(100, persistent)).await.expect("write");
    }

    let before = store.statistics().await.expect("stats");
    assert!(!store.delete(EntryId::new(42)).await.expect("delete"));
    assert_eq!(store.statistics().await.expect("stats"), before);
    assert_eq!(backing.record_count(), before.durable_count);
}

#[tokio::test]
async fn test_unavailable_storage_is_reported() {
    let backing = TestBackingStore::new();
    let store = TieredStore::new(storage(), Arc::new(backing.clone()), 1_000, 150);

    backing.set_unavailable(true);

    // Persistent and oversized writes need the backing store
    assert!(
        store
            .write(sized(100, true))
            .await
            .expect_err("persistent")
            .is_unavailable()
    );
    assert!(
        store
            .write(sized(200, false))
            .await
            .expect_err("oversized")
            .is_unavailable()
    );

    // A small transient entry does not
    let transient = sized(100, false);
    store.write(transient.clone()).await.expect("memory only");

    // Misses and deletes still have to consult the backing store
    assert!(
        store
            .read(EntryId::new(1))
            .await
            .expect_err("miss")
            .is_unavailable()
    );
    assert!(
        store
            .delete(transient.id())
            .await
            .expect_err("delete")
            .is_unavailable()
    );

    backing.set_unavailable(false);
    let stats = store.statistics().await.expect("stats");
    assert_eq!(stats.durable_count, 0);
    store.verify().await.expect("invariants");
}

#[tokio::test]
async fn test_queue_recovers_after_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let persistent: Vec<_> = (0..4)
        .map(|p| {
            Entry::new(
                storage(),
                Priority::new(p * 3).expect("valid"),
                true,
                b"durable".as_slice(),
            )
        })
        .collect();

    {
        let store = TieredStore::new(storage(), file_store(&dir), 200, 1_000);
        let queue = MessageQueue::new(Arc::new(store));
        for entry in &persistent {
            queue.enqueue(entry.clone()).await.expect("enqueue");
        }
        for _ in 0..3 {
            queue
                .enqueue(sized(150, false))
                .await
                .expect("enqueue transient");
        }
    }

    let store = TieredStore::new(storage(), file_store(&dir), 200, 1_000);
    let queue = MessageQueue::open(Arc::new(store)).await.expect("open");

    assert_eq!(queue.len().await, 4);
    let order: Vec<_> = queue
        .take(10)
        .await
        .expect("take")
        .iter()
        .map(|e| e.priority().get())
        .collect();
    assert_eq!(order, vec![9, 6, 3, 0]);
}
