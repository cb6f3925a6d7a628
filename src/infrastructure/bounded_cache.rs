//! Bounded Cache
//!
//! In-memory cache limited by the total byte size of its values, with strict
//! least-recently-used eviction.

use crate::domain::entities::{LookupKey, LookupResult};
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;

/// Default capacity: 1 GiB.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024 * 1024 * 1024;

/// Values that know how many bytes they account for in the cache.
pub trait ByteSize {
    fn byte_size(&self) -> usize;
}

impl ByteSize for Bytes {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl ByteSize for String {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl ByteSize for Vec<u8> {
    fn byte_size(&self) -> usize {
        self.len()
    }
}

impl ByteSize for LookupResult {
    fn byte_size(&self) -> usize {
        match self {
            LookupResult::Success(payload) => payload.len(),
            LookupResult::Failure(failure) => failure.message.len(),
        }
    }
}

/// Cache of resolved lookups shared between the batcher and the HTTP layer.
pub type LookupCache = BoundedCache<LookupKey, LookupResult>;

struct Inner<K: Hash + Eq, V> {
    /// Recency-ordered entries with their accounted size
    entries: LruCache<K, (V, usize)>,
    /// Sum of the sizes of all entries
    size: usize,
}

/// Byte-bounded LRU cache.
///
/// The recency list, the index and the size counter live behind a single
/// mutex so the size accounting is always exact. No operation performs I/O
/// while holding the lock.
pub struct BoundedCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq,
    V: ByteSize + Clone,
{
    /// Create a cache holding at most `capacity` bytes of values.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size: 0,
            }),
            capacity,
        }
    }

    /// Look up a value and mark it as most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        inner.entries.get(key).map(|(value, _)| value.clone())
    }

    /// Check for a key without touching its recency.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// Insert or overwrite a value.
    ///
    /// Evicts least-recently-used entries until the new value fits. A value
    /// larger than the whole capacity is not inserted and leaves the cache
    /// untouched.
    pub fn set(&self, key: K, value: V) {
        let size = value.byte_size();
        if size > self.capacity {
            tracing::debug!(
                "cache: skipping entry of {} bytes (capacity {})",
                size,
                self.capacity
            );
            return;
        }

        let mut inner = self.inner.lock();

        if let Some((_, old_size)) = inner.entries.pop(&key) {
            inner.size -= old_size;
        }

        let mut evicted = 0;
        while inner.size + size > self.capacity {
            match inner.entries.pop_lru() {
                Some((_, (_, entry_size))) => {
                    inner.size -= entry_size;
                    evicted += 1;
                }
                None => break,
            }
        }

        inner.entries.put(key, (value, size));
        inner.size += size;

        if evicted > 0 {
            tracing::debug!("cache: evicted {} entries, {} bytes in use", evicted, inner.size);
        }
    }

    /// Remove a value, returning it if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let (value, size) = inner.entries.pop(key)?;
        inner.size -= size;
        Some(value)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently accounted to entries.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for BoundedCache<K, V>
where
    K: Hash + Eq,
    V: ByteSize + Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
