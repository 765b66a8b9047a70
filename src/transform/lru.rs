//! Bounded LRU cache: hash map for O(1) lookup, index-linked list for O(1)
//! recency moves and tail eviction. Callers wrap it in their own lock; all
//! operations here take `&mut self`.

use ahash::AHashMap as HashMap;
use std::hash::Hash;

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Capacity must be nonzero; a zero-capacity cache has no useful meaning
    /// and callers disable caching instead.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be nonzero");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of live list nodes; equals `len()` at every quiescent point.
    pub fn list_len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while cursor != NIL {
            count += 1;
            cursor = self.nodes[cursor].as_ref().map(|n| n.next).unwrap_or(NIL);
        }
        count
    }

    /// Looks a key up and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.detach(index);
        self.push_front(index);
        self.nodes[index].as_ref().map(|n| &n.value)
    }

    /// Inserts or updates a key as most recently used, evicting the least
    /// recently used entry when over capacity.
    pub fn put(&mut self, key: K, value: V) {
        if let Some(&index) = self.map.get(&key) {
            if let Some(node) = self.nodes[index].as_mut() {
                node.value = value;
            }
            self.detach(index);
            self.push_front(index);
            return;
        }

        let node = Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
        };
        let index = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, index);
        self.push_front(index);

        if self.map.len() > self.capacity {
            self.evict_tail();
        }
    }

    fn evict_tail(&mut self) {
        let tail = self.tail;
        if tail == NIL {
            return;
        }
        self.detach(tail);
        if let Some(node) = self.nodes[tail].take() {
            self.map.remove(&node.key);
        }
        self.free.push(tail);
    }

    fn detach(&mut self, index: usize) {
        let (prev, next) = match self.nodes[index].as_ref() {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        if prev != NIL {
            if let Some(p) = self.nodes[prev].as_mut() {
                p.next = next;
            }
        } else if self.head == index {
            self.head = next;
        }
        if next != NIL {
            if let Some(n) = self.nodes[next].as_mut() {
                n.prev = prev;
            }
        } else if self.tail == index {
            self.tail = prev;
        }
        if let Some(node) = self.nodes[index].as_mut() {
            node.prev = NIL;
            node.next = NIL;
        }
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        if let Some(node) = self.nodes[index].as_mut() {
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            if let Some(h) = self.nodes[old_head].as_mut() {
                h.prev = index;
            }
        }
        self.head = index;
        if self.tail == NIL {
            self.tail = index;
        }
    }

    /// Key of the least recently used entry, for tests.
    #[cfg(test)]
    fn tail_key(&self) -> Option<&K> {
        if self.tail == NIL {
            return None;
        }
        self.nodes[self.tail].as_ref().map(|n| &n.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_never_exceeds_capacity() {
        let mut cache = LruCache::new(3);
        for i in 0..100 {
            cache.put(i, i * 2);
            assert!(cache.len() <= 3);
            assert_eq!(cache.list_len(), cache.len());
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&99).is_some());
        assert!(cache.get(&0).is_none());
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.tail_key(), Some(&"a"));
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.tail_key(), Some(&"b"));
        cache.put("c", 3);
        assert!(cache.get(&"b").is_none());
        assert_eq!(cache.get(&"a"), Some(&1));
    }

    #[test]
    fn put_updates_existing_value() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("a", 7);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(&7));
    }

    #[test]
    fn evicted_slots_are_reused() {
        let mut cache = LruCache::new(2);
        for i in 0..50 {
            cache.put(i, i);
        }
        // Backing storage stays bounded by capacity + 1 transient slot.
        assert!(cache.nodes.len() <= 3);
    }
}
