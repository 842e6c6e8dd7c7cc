//! Recency order of resident entries.
//!
//! A doubly-linked list threaded through a slab of nodes, with a hash map
//! from id to slot. Every operation is O(1). There is no locking here; the
//! owning store serialises access.

use ahash::AHashMap;

use crate::EntryId;

const NIL: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Node {
    id: EntryId,
    prev: usize,
    next: usize,
}

/// Oldest-first ordered set of entry ids.
#[derive(Debug)]
pub struct LruIndex {
    nodes: Vec<Node>,
    free: Vec<usize>,
    slots: AHashMap<EntryId, usize>,
    /// Least recently used
    head: usize,
    /// Most recently used
    tail: usize,
}

impl Default for LruIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl LruIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            slots: AHashMap::new(),
            head: NIL,
            tail: NIL,
        }
    }

    /// Mark `id` as most recently used, inserting it if it is not tracked yet.
    pub fn touch(&mut self, id: EntryId) {
        if let Some(&slot) = self.slots.get(&id) {
            if slot != self.tail {
                self.unlink(slot);
                self.push_back(slot);
            }
            return;
        }

        let node = Node {
            id,
            prev: NIL,
            next: NIL,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.nodes[slot] = node;
            slot
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        };

        self.slots.insert(id, slot);
        self.push_back(slot);
    }

    /// Remove and return the least recently used id.
    pub fn evict_oldest(&mut self) -> Option<EntryId> {
        if self.head == NIL {
            return None;
        }

        let id = self.nodes[self.head].id;
        self.remove(id);
        Some(id)
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn remove(&mut self, id: EntryId) -> bool {
        let Some(slot) = self.slots.remove(&id) else {
            return false;
        };

        self.unlink(slot);
        self.free.push(slot);
        true
    }

    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.slots.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.slots.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Ids from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        std::iter::successors((self.head != NIL).then_some(self.head), |&slot| {
            let next = self.nodes[slot].next;
            (next != NIL).then_some(next)
        })
        .map(|slot| self.nodes[slot].id)
    }

    fn unlink(&mut self, slot: usize) {
        let Node { prev, next, .. } = self.nodes[slot];

        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }

        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn push_back(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = NIL;

        if self.tail == NIL {
            self.head = slot;
        } else {
            self.nodes[self.tail].next = slot;
        }
        self.tail = slot;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ids(lru: &LruIndex) -> Vec<u64> {
        lru.iter().map(EntryId::get).collect()
    }

    #[test]
    fn test_touch_orders_oldest_first() {
        let mut lru = LruIndex::new();
        for id in 1..=4 {
            lru.touch(EntryId::new(id));
        }
        assert_eq!(ids(&lru), vec![1, 2, 3, 4]);

        lru.touch(EntryId::new(2));
        assert_eq!(ids(&lru), vec![1, 3, 4, 2]);

        // Touching the newest is a no-op
        lru.touch(EntryId::new(2));
        assert_eq!(ids(&lru), vec![1, 3, 4, 2]);
        assert_eq!(lru.len(), 4);
    }

    #[test]
    fn test_evict_oldest() {
        let mut lru = LruIndex::new();
        assert_eq!(lru.evict_oldest(), None);

        lru.touch(EntryId::new(1));
        lru.touch(EntryId::new(2));
        lru.touch(EntryId::new(1));

        assert_eq!(lru.evict_oldest(), Some(EntryId::new(2)));
        assert_eq!(lru.evict_oldest(), Some(EntryId::new(1)));
        assert_eq!(lru.evict_oldest(), None);
        assert!(lru.is_empty());
    }

    #[test]
    fn test_remove_from_middle_and_ends() {
        let mut lru = LruIndex::new();
        for id in 1..=5 {
            lru.touch(EntryId::new(id));
        }

        assert!(lru.remove(EntryId::new(3)));
        assert!(lru.remove(EntryId::new(1)));
        assert!(lru.remove(EntryId::new(5)));
        assert!(!lru.remove(EntryId::new(5)));

        assert_eq!(ids(&lru), vec![2, 4]);
        assert!(lru.contains(EntryId::new(4)));
        assert!(!lru.contains(EntryId::new(3)));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut lru = LruIndex::new();
        for id in 1..=3 {
            lru.touch(EntryId::new(id));
        }
        lru.remove(EntryId::new(2));
        lru.touch(EntryId::new(10));

        assert_eq!(lru.nodes.len(), 3);
        assert_eq!(ids(&lru), vec![1, 3, 10]);

        lru.clear();
        assert!(lru.is_empty());
        assert_eq!(lru.iter().count(), 0);
    }
}
