//! LRU Engine
//!
//! A byte-budgeted, recency-ordered key/value store. The engine itself is
//! single-threaded; [`SharedCache`] wraps it behind a mutex for use inside a
//! [`Group`](super::group::Group).
//!
//! ## Mechanism
//! - **Recency order**: a `VecDeque` of keys, front = most recently used.
//! - **Budget**: `max_bytes` bounds `key.len() + value.len()` summed over
//!   all entries; `0` disables the bound. After every insert the cold end
//!   is evicted until the budget holds.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::types::ByteView;

/// Invoked once per evicted entry, after the entry has left the store.
pub type EvictionCallback = Box<dyn Fn(&str, &ByteView) + Send>;

/// Recency-ordered store with byte-budgeted eviction. Not thread-safe.
pub struct LruCache {
    max_bytes: usize,
    used_bytes: usize,
    /// Front = most recently used, back = next eviction candidate.
    order: VecDeque<String>,
    entries: HashMap<String, ByteView>,
    on_evicted: Option<EvictionCallback>,
}

impl LruCache {
    /// Creates an engine bounded to `max_bytes`. A bound of 0 means
    /// unbounded.
    pub fn new(max_bytes: usize) -> Self {
        Self::with_eviction_callback(max_bytes, None)
    }

    pub fn with_eviction_callback(
        max_bytes: usize,
        on_evicted: Option<EvictionCallback>,
    ) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
            order: VecDeque::new(),
            entries: HashMap::new(),
            on_evicted,
        }
    }

    /// Looks up a key and promotes it to most-recently-used.
    pub fn get(&mut self, key: &str) -> Option<ByteView> {
        let value = self.entries.get(key)?.clone();
        self.promote(key);
        Some(value)
    }

    /// Inserts or updates an entry, then evicts from the cold end until the
    /// byte budget is satisfied.
    pub fn insert(&mut self, key: &str, value: ByteView) {
        match self.entries.get_mut(key) {
            Some(existing) => {
                self.used_bytes = self.used_bytes + value.len() - existing.len();
                *existing = value;
                self.promote(key);
            }
            None => {
                self.used_bytes += key.len() + value.len();
                self.order.push_front(key.to_string());
                self.entries.insert(key.to_string(), value);
            }
        }

        while self.max_bytes > 0 && self.used_bytes > self.max_bytes {
            self.remove_oldest();
        }
    }

    /// Evicts the least recently used entry, if any.
    pub fn remove_oldest(&mut self) {
        let Some(key) = self.order.pop_back() else {
            return;
        };
        if let Some(value) = self.entries.remove(&key) {
            self.used_bytes -= key.len() + value.len();
            tracing::debug!("evicted cache entry {} ({} bytes)", key, value.len());
            if let Some(callback) = &self.on_evicted {
                callback(&key, &value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    fn promote(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_front(key.to_string());
    }
}

/// Thread-safe wrapper around [`LruCache`].
///
/// The inner engine is built lazily on the first insert, so an untouched
/// group costs nothing beyond the mutex.
pub struct SharedCache {
    max_bytes: usize,
    inner: Mutex<Option<LruCache>>,
}

impl SharedCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(None),
        }
    }

    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.as_mut()?.get(key)
    }

    pub fn insert(&self, key: &str, value: ByteView) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .get_or_insert_with(|| LruCache::new(self.max_bytes))
            .insert(key, value);
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner.as_ref().map(LruCache::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_get_promotes_entry() {
        let mut cache = LruCache::new(0);
        cache.insert("k1", ByteView::from("v1".to_string()));
        cache.insert("k2", ByteView::from("v2".to_string()));

        assert_eq!(cache.get("k1").unwrap().to_string(), "v1");
        assert!(cache.get("missing").is_none());

        // k2 is now the cold end.
        cache.remove_oldest();
        assert!(cache.get("k2").is_none());
        assert!(cache.get("k1").is_some());
    }

    #[test]
    fn test_eviction_respects_byte_budget() {
        let budget = "k1v1k2v2".len();
        let mut cache = LruCache::new(budget);
        cache.insert("k1", ByteView::from("v1".to_string()));
        cache.insert("k2", ByteView::from("v2".to_string()));
        cache.insert("k3", ByteView::from("v3".to_string()));

        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
        assert!(cache.get("k3").is_some());
        assert_eq!(cache.len(), 2);
        assert!(cache.used_bytes() <= budget);
    }

    #[test]
    fn test_update_adjusts_byte_count() {
        let mut cache = LruCache::new(0);
        cache.insert("key", ByteView::from("short".to_string()));
        let before = cache.used_bytes();

        cache.insert("key", ByteView::from("a much longer value".to_string()));
        assert_eq!(
            cache.used_bytes(),
            before - "short".len() + "a much longer value".len()
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_callback_fires_once_per_entry() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let mut cache = LruCache::with_eviction_callback(
            "k1v1".len(),
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        cache.insert("k1", ByteView::from("v1".to_string()));
        cache.insert("k2", ByteView::from("v2".to_string()));

        assert_eq!(evicted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_cache_lazy_init() {
        let cache = SharedCache::new(1024);
        assert!(cache.get("anything").is_none());
        assert_eq!(cache.len(), 0);

        cache.insert("key", ByteView::from("value".to_string()));
        assert_eq!(cache.get("key").unwrap().to_string(), "value");
    }
}
