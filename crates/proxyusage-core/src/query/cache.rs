//! Short-lived memo of query results
//!
//! Entries expire `ttl` after insertion. When full, the oldest inserted key is
//! evicted first.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CacheConfig;

struct Entry<V> {
    inserted_at: Instant,
    value: V,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    order: VecDeque<String>,
}

impl<V> Inner<V> {
    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

/// Bounded TTL cache keyed by canonical parameter strings
pub struct ResultCache<V> {
    ttl: Duration,
    max_entries: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> ResultCache<V> {
    /// Create a cache
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Create a cache from configuration
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl, config.max_entries)
    }

    /// Fresh value for `key`; expired entries are dropped on access
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let fresh = inner
            .entries
            .get(key)
            .map(|e| e.inserted_at.elapsed() < self.ttl)?;

        if fresh {
            inner.entries.get(key).map(|e| e.value.clone())
        } else {
            inner.remove(key);
            None
        }
    }

    /// Store `value`, evicting the oldest entries when full
    pub fn insert(&self, key: String, value: V) {
        let mut inner = self.inner.lock();
        inner.remove(&key);

        while inner.entries.len() >= self.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Entry {
                inserted_at: Instant::now(),
                value,
            },
        );
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}
