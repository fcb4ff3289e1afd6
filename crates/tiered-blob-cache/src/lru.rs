//! Intrusive LRU ordering shared by both cache tiers
//!
//! A hashmap from key to a slab index, where each slab slot is a
//! doubly-linked node holding `(key, size, payload)`. The list head is the
//! eviction candidate and the tail is the most recently used entry, giving
//! O(1) lookup, insert, touch, remove, and evict. Cumulative entry size is
//! tracked so tiers can enforce byte capacities.

use std::collections::HashMap;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<T> {
    key: String,
    size: u64,
    payload: T,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub struct LruList<T> {
    map: HashMap<String, usize>,
    slots: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    total_size: u64,
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            total_size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of entry sizes currently held.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &str) -> Option<&T> {
        let idx = *self.map.get(key)?;
        self.slots[idx].as_ref().map(|node| &node.payload)
    }

    /// Look up and mark the entry as most recently used.
    pub fn get(&mut self, key: &str) -> Option<&T> {
        let idx = *self.map.get(key)?;
        self.move_to_tail(idx);
        self.slots[idx].as_ref().map(|node| &node.payload)
    }

    /// Mark an entry as most recently used. Returns false if absent.
    pub fn touch(&mut self, key: &str) -> bool {
        match self.map.get(key) {
            Some(&idx) => {
                self.move_to_tail(idx);
                true
            }
            None => false,
        }
    }

    /// Insert or replace an entry, making it most recently used.
    ///
    /// Returns the displaced `(size, payload)` if the key was present.
    pub fn insert(&mut self, key: &str, size: u64, payload: T) -> Option<(u64, T)> {
        let displaced = self.remove(key);
        let node = Node {
            key: key.to_string(),
            size,
            payload,
            prev: self.tail,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        if self.tail != NIL {
            self.slot_mut(self.tail).next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.map.insert(key.to_string(), idx);
        self.total_size += size;
        displaced
    }

    /// Remove an entry, returning its `(size, payload)` if present.
    pub fn remove(&mut self, key: &str) -> Option<(u64, T)> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        let node = self.slots[idx].take().expect("mapped slot must be occupied");
        self.free.push(idx);
        self.total_size -= node.size;
        Some((node.size, node.payload))
    }

    /// Remove and return the least recently used entry.
    pub fn pop_oldest(&mut self) -> Option<(String, u64, T)> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        let key = self.slot(idx).key.clone();
        let (size, payload) = self.remove(&key)?;
        Some((key, size, payload))
    }

    /// Key of the least recently used entry.
    pub fn oldest_key(&self) -> Option<&str> {
        if self.head == NIL {
            return None;
        }
        Some(self.slot(self.head).key.as_str())
    }

    /// Iterate entries from least to most recently used.
    pub fn iter(&self) -> LruIter<'_, T> {
        LruIter { list: self, next: self.head }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.total_size = 0;
    }

    fn slot(&self, idx: usize) -> &Node<T> {
        self.slots[idx].as_ref().expect("linked slot must be occupied")
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Node<T> {
        self.slots[idx].as_mut().expect("linked slot must be occupied")
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slot(idx);
            (node.prev, node.next)
        };
        if prev != NIL {
            self.slot_mut(prev).next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slot_mut(next).prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn move_to_tail(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        let tail = self.tail;
        {
            let node = self.slot_mut(idx);
            node.prev = tail;
            node.next = NIL;
        }
        if tail != NIL {
            self.slot_mut(tail).next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }
}

pub struct LruIter<'a, T> {
    list: &'a LruList<T>,
    next: usize,
}

impl<'a, T> Iterator for LruIter<'a, T> {
    type Item = (&'a str, u64, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let node = self.list.slot(self.next);
        self.next = node.next;
        Some((node.key.as_str(), node.size, &node.payload))
    }
}
