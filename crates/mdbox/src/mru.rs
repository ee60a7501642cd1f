//! A capacity-bounded cache ordered by recency of insertion.
//!
//! Entries live in a slab of nodes threaded onto a doubly linked list, most
//! recent first, with a hash map from key to slab slot.  Every mutating
//! operation keeps the two in step, so insert, lookup, and removal are all
//! O(1).
//!
//! [`MruList::insert`] moves a key to the front; [`MruList::find`] does not
//! touch the ordering, so readers on hot paths only hold the lock for the
//! duration of a hash lookup and a clone.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

struct Node<K, V> {
    key: K,
    value: V,

    /// Neighbour towards the most recent end.
    prev: Option<usize>,

    /// Neighbour towards the least recent end.
    next: Option<usize>,
}

struct MruInner<K, V> {
    slots: Vec<Option<Node<K, V>>>,

    /// Vacant entries in `slots`.
    vacant: Vec<usize>,

    /// Map from key to its slot in `slots`.
    index: HashMap<K, usize>,

    /// Most recently inserted.
    head: Option<usize>,

    /// Least recently inserted; the next eviction victim.
    tail: Option<usize>,

    capacity: usize,
}

impl<K, V> MruInner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity + 1),
            vacant: Vec::new(),
            index: HashMap::with_capacity(capacity + 1),
            head: None,
            tail: None,
            capacity,
        }
    }

    fn node(&self, slot: usize) -> &Node<K, V> {
        self.slots[slot].as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<K, V> {
        self.slots[slot].as_mut().expect("linked slot is occupied")
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(old_head) => self.node_mut(old_head).prev = Some(slot),
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    fn remove_slot(&mut self, slot: usize) -> (K, V) {
        self.unlink(slot);
        let node = self.slots[slot].take().expect("linked slot is occupied");
        self.vacant.push(slot);
        self.index.remove(&node.key);
        (node.key, node.value)
    }

    fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.index.get(&key) {
            self.node_mut(slot).value = value;
            self.unlink(slot);
            self.push_front(slot);
            return None;
        }

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.push_front(slot);

        if self.index.len() > self.capacity {
            let victim = self.tail.expect("over-full list has a tail");
            Some(self.remove_slot(victim))
        } else {
            None
        }
    }

    fn drain(&mut self) -> Vec<(K, V)> {
        let mut entries = Vec::with_capacity(self.index.len());
        while let Some(head) = self.head {
            entries.push(self.remove_slot(head));
        }
        self.slots.clear();
        self.vacant.clear();
        entries
    }
}

/// A most-recently-used list of at most `capacity` entries.
pub struct MruList<K, V> {
    inner: Mutex<MruInner<K, V>>,
}

impl<K, V> Debug for MruList<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MruList").finish()
    }
}

impl<K, V> MruList<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            inner: Mutex::new(MruInner::new(capacity.get())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Inserts `value` under `key` as the most recent entry.
    ///
    /// If `key` was already present, its value is replaced and it moves to
    /// the front; nothing is evicted.  Otherwise, if the list now exceeds its
    /// capacity, the least recent entry is removed and returned, and the
    /// caller becomes responsible for it.
    pub fn insert(&self, key: K, value: V) -> Option<(K, V)> {
        self.inner.lock().unwrap().insert(key, value)
    }

    /// Returns a copy of the value under `key`.  Does not change the
    /// recency order.
    pub fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let inner = self.inner.lock().unwrap();
        inner
            .index
            .get(key)
            .map(|&slot| inner.node(slot).value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().unwrap().index.contains_key(key)
    }

    /// Removes the entry under `key`, if any, and returns its value.
    pub fn delete_index(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.index.get(key).copied()?;
        Some(inner.remove_slot(slot).1)
    }

    /// Removes every entry and hands them back, most recent first.
    pub fn drain(&self) -> Vec<(K, V)> {
        self.inner.lock().unwrap().drain()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        drop(self.drain());
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Keys from most to least recent.
    pub fn keys(&self) -> Vec<K> {
        let inner = self.inner.lock().unwrap();
        let mut keys = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.head;
        while let Some(slot) = cursor {
            let node = inner.node(slot);
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }
}
