//! Embedding cache: LRU with lazy TTL expiry.
//!
//! Memoizes `text → vector` lookups so repeated passages and queries do not
//! hit the embedding provider again. Keys are the full SHA-256 digest of the
//! raw text; the cache never stores anything the caller did not `set`.
//!
//! ```rust
//! use std::time::Duration;
//! use recall_core::cache::EmbeddingCache;
//!
//! let cache = EmbeddingCache::new(2, Duration::from_secs(3600));
//! cache.set("rust", vec![0.1, 0.2]);
//! assert_eq!(cache.get("rust"), Some(vec![0.1, 0.2]));
//! assert_eq!(cache.get("python"), None);
//! assert_eq!(cache.stats().hits, 1);
//! ```

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// SHA-256 digest of the cached text.
type CacheKey = [u8; 32];

#[derive(Debug, Clone)]
struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

struct CacheInner {
    entries: LruCache<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub ttl_secs: u64,
}

/// Bounded LRU cache of embedding vectors with time-based expiry.
///
/// All operations take one short exclusive lock; none of them await.
pub struct EmbeddingCache {
    inner: Mutex<CacheInner>,
    max_size: NonZeroUsize,
    ttl: Duration,
}

impl EmbeddingCache {
    /// A `max_size` of zero is clamped to one.
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let max_size = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        debug!(max_size = max_size.get(), ttl_secs = ttl.as_secs(), "embedding cache initialized");
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(max_size),
                hits: 0,
                misses: 0,
            }),
            max_size,
            ttl,
        }
    }

    fn key(text: &str) -> CacheKey {
        Sha256::digest(text.as_bytes()).into()
    }

    /// Look up a vector. Expired entries are purged and reported as absent.
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::key(text);
        let mut inner = self.inner.lock();

        let Some(expired) = inner
            .entries
            .peek(&key)
            .map(|entry| entry.inserted_at.elapsed() >= self.ttl)
        else {
            inner.misses += 1;
            return None;
        };

        if expired {
            inner.entries.pop(&key);
            inner.misses += 1;
            debug!("expired embedding cache entry purged");
            return None;
        }

        let vector = inner.entries.get(&key).map(|e| e.vector.clone());
        inner.hits += 1;
        vector
    }

    /// Store a vector, evicting the least-recently-used entry when full.
    pub fn set(&self, text: &str, vector: Vec<f32>) {
        let key = Self::key(text);
        let entry = CacheEntry {
            vector,
            inserted_at: Instant::now(),
        };
        let mut inner = self.inner.lock();
        if let Some((evicted, _)) = inner.entries.push(key, entry) {
            if evicted != key {
                debug!("evicted least-recently-used embedding");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_rate(&self) -> f64 {
        let inner = self.inner.lock();
        ratio(inner.hits, inner.misses)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size.get(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: ratio(inner.hits, inner.misses),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Drop every entry and reset the hit/miss counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }
}

fn ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: usize) -> EmbeddingCache {
        EmbeddingCache::new(max, Duration::from_secs(60))
    }

    #[test]
    fn miss_then_hit() {
        let c = cache(4);
        assert_eq!(c.get("a"), None);
        c.set("a", vec![1.0]);
        assert_eq!(c.get("a"), Some(vec![1.0]));

        let stats = c.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn repeated_get_is_idempotent() {
        let c = cache(4);
        c.set("a", vec![1.0, 2.0]);
        let first = c.get("a");
        let second = c.get("a");
        assert_eq!(first, second);
        assert_eq!(c.stats().size, 1);

        assert_eq!(c.get("missing"), None);
        assert_eq!(c.get("missing"), None);
        assert_eq!(c.stats().size, 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let c = cache(2);
        c.set("a", vec![1.0]);
        c.set("b", vec![2.0]);
        // Touch "a" so "b" becomes the LRU entry.
        assert!(c.get("a").is_some());
        c.set("c", vec![3.0]);

        assert_eq!(c.len(), 2);
        assert!(c.get("b").is_none());
        assert!(c.get("a").is_some());
        assert!(c.get("c").is_some());
    }

    #[test]
    fn overwriting_existing_key_does_not_evict() {
        let c = cache(2);
        c.set("a", vec![1.0]);
        c.set("b", vec![2.0]);
        c.set("a", vec![9.0]);

        assert_eq!(c.len(), 2);
        assert_eq!(c.get("a"), Some(vec![9.0]));
        assert_eq!(c.get("b"), Some(vec![2.0]));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_purged_on_get() {
        let c = EmbeddingCache::new(4, Duration::from_secs(10));
        c.set("a", vec![1.0]);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(c.get("a").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(c.get("a"), None);
        assert!(c.is_empty());
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn clear_resets_entries_and_counters() {
        let c = cache(4);
        c.set("a", vec![1.0]);
        c.get("a");
        c.get("b");
        c.clear();

        let stats = c.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let c = cache(0);
        c.set("a", vec![1.0]);
        c.set("b", vec![2.0]);
        assert_eq!(c.len(), 1);
        assert_eq!(c.stats().max_size, 1);
    }

    #[test]
    fn distinct_texts_have_distinct_keys() {
        assert_ne!(EmbeddingCache::key("a"), EmbeddingCache::key("b"));
        assert_eq!(EmbeddingCache::key("a"), EmbeddingCache::key("a"));
    }
}
