//! Size-bounded LRU store.
//!
//! The store keeps entries in a recency list: the front is the most
//! recently used entry, the back is the next eviction victim. Capacity is
//! accounted in bytes (`len(key) + value.len()` per entry), not entry
//! count, and eviction runs until the store fits its budget again.
//!
//! # Concurrency
//!
//! All public operations take a single exclusive lock covering the index,
//! the recency list, and the byte counter. The eviction callback runs while
//! that lock is held with the entry already detached; callbacks must not
//! call back into the same store.

use crate::types::ByteView;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Callback invoked with each evicted or deleted entry.
pub type EvictionCallback = Box<dyn Fn(&str, &ByteView) + Send + Sync>;

const NIL: usize = usize::MAX;

/// One entry in the recency list.
struct Slot {
    key: String,
    value: ByteView,
    prev: usize,
    next: usize,
}

/// List + index + accounting. Not thread-safe on its own; always behind
/// the store's mutex.
struct LruInner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,
    bytes_used: usize,
}

impl LruInner {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            bytes_used: 0,
        }
    }

    fn alloc(&mut self, slot: Slot) -> usize {
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(slot);
                id
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    /// Unlink `id` from the recency list without freeing the slot.
    fn unlink(&mut self, id: usize) {
        let (prev, next) = {
            let slot = self.slots[id].as_ref().expect("live slot");
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slots[prev].as_mut().expect("live slot").next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].as_mut().expect("live slot").prev = prev;
        } else {
            self.tail = prev;
        }
    }

    /// Link `id` at the front (most recently used).
    fn push_front(&mut self, id: usize) {
        {
            let slot = self.slots[id].as_mut().expect("live slot");
            slot.prev = NIL;
            slot.next = self.head;
        }
        if self.head != NIL {
            self.slots[self.head].as_mut().expect("live slot").prev = id;
        }
        self.head = id;
        if self.tail == NIL {
            self.tail = id;
        }
    }

    fn promote(&mut self, id: usize) {
        if self.head == id {
            return;
        }
        self.unlink(id);
        self.push_front(id);
    }

    /// Detach `id` entirely, returning the entry. Updates index and byte
    /// accounting; the caller decides whether to fire the callback.
    fn detach(&mut self, id: usize) -> (String, ByteView) {
        self.unlink(id);
        let slot = self.slots[id].take().expect("live slot");
        self.free.push(id);
        self.index.remove(&slot.key);
        self.bytes_used -= slot.key.len() + slot.value.len();
        (slot.key, slot.value)
    }
}

/// A byte-bounded key/value store with least-recently-used eviction.
///
/// `max_bytes == 0` disables the capacity limit.
///
/// # Example
///
/// ```
/// use meshcache::{ByteView, LruStore};
///
/// let store = LruStore::new(1024, None);
/// store.set("k", ByteView::from("v"));
/// assert_eq!(store.get("k"), Some(ByteView::from("v")));
/// ```
pub struct LruStore {
    max_bytes: usize,
    on_evict: Option<EvictionCallback>,
    inner: Mutex<LruInner>,
}

impl LruStore {
    /// Create a store with the given byte budget.
    ///
    /// `on_evict` is invoked once per evicted or deleted entry, in LRU
    /// order, while the store lock is held. The callback must not call
    /// back into this store.
    pub fn new(max_bytes: usize, on_evict: Option<EvictionCallback>) -> Self {
        Self {
            max_bytes,
            on_evict,
            inner: Mutex::new(LruInner::new()),
        }
    }

    /// Look up a key, promoting it to most-recently-used on a hit.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut inner = self.inner.lock();
        let id = *inner.index.get(key)?;
        inner.promote(id);
        Some(inner.slots[id].as_ref().expect("live slot").value.clone())
    }

    /// Insert or replace a value, then evict until the store fits its
    /// budget.
    pub fn set(&self, key: &str, value: ByteView) {
        let mut inner = self.inner.lock();
        match inner.index.get(key).copied() {
            Some(id) => {
                let old_len = inner.slots[id].as_ref().expect("live slot").value.len();
                inner.bytes_used = inner.bytes_used - old_len + value.len();
                inner.slots[id].as_mut().expect("live slot").value = value;
                inner.promote(id);
            }
            None => {
                inner.bytes_used += key.len() + value.len();
                let id = inner.alloc(Slot {
                    key: key.to_string(),
                    value,
                    prev: NIL,
                    next: NIL,
                });
                inner.push_front(id);
                inner.index.insert(key.to_string(), id);
            }
        }
        while self.max_bytes > 0 && inner.bytes_used > self.max_bytes && inner.tail != NIL {
            self.evict_oldest(&mut inner);
        }
    }

    /// Remove a key. No-op when absent. Fires the eviction callback for
    /// the removed entry.
    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        let Some(id) = inner.index.get(key).copied() else {
            return;
        };
        let (k, v) = inner.detach(id);
        if let Some(cb) = &self.on_evict {
            cb(&k, &v);
        }
    }

    /// Evict the least recently used entry, if any.
    pub fn remove_oldest(&self) {
        let mut inner = self.inner.lock();
        if inner.tail != NIL {
            self.evict_oldest(&mut inner);
        }
    }

    fn evict_oldest(&self, inner: &mut LruInner) {
        let victim = inner.tail;
        let (k, v) = inner.detach(victim);
        if let Some(cb) = &self.on_evict {
            cb(&k, &v);
        }
    }

    /// Bytes currently accounted to live entries.
    pub fn bytes_used(&self) -> usize {
        self.inner.lock().bytes_used
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a key without promoting it or counting a hit.
    pub fn peek(&self, key: &str) -> Option<ByteView> {
        let inner = self.inner.lock();
        let id = *inner.index.get(key)?;
        Some(inner.slots[id].as_ref().expect("live slot").value.clone())
    }
}
