//! Image embedding cache.
//!
//! Keyed by frame fingerprint and projector, so an unchanged camera view
//! skips the vision projector. Capacity is small (a handful of recent
//! views), so eviction scans for the least recently used entry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::FrameFingerprint;
use crate::inference::ImageEmbedding;

pub const DEFAULT_EMBEDDING_CACHE_ENTRIES: usize = 8;

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingKey {
    pub fingerprint: FrameFingerprint,
    pub projector: Option<PathBuf>,
}

struct Entry {
    embedding: Arc<ImageEmbedding>,
    last_used: u64,
}

pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<Inner>,
    pub stats: CacheStats,
}

struct Inner {
    entries: HashMap<EmbeddingKey, Entry>,
    tick: u64,
}

impl EmbeddingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                tick: 0,
            }),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &EmbeddingKey) -> Option<Arc<ImageEmbedding>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used = tick;
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.embedding))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: EmbeddingKey, embedding: Arc<ImageEmbedding>) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let lru = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                inner.entries.remove(&lru);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.entries.insert(
            key,
            Entry {
                embedding,
                last_used: tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_CACHE_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> EmbeddingKey {
        EmbeddingKey {
            fingerprint: FrameFingerprint(n),
            projector: Some(PathBuf::from("mmproj.bin")),
        }
    }

    fn emb(v: f32) -> Arc<ImageEmbedding> {
        Arc::new(ImageEmbedding {
            values: vec![v],
            positions: 1,
        })
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = EmbeddingCache::new(2);
        cache.insert(key(1), emb(1.0));
        cache.insert(key(2), emb(2.0));
        assert!(cache.get(&key(1)).is_some());
        cache.insert(key(3), emb(3.0));

        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(3)).is_some());
        assert_eq!(cache.stats.evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn projector_is_part_of_the_key() {
        let cache = EmbeddingCache::default();
        cache.insert(key(1), emb(1.0));
        let other = EmbeddingKey {
            projector: Some(PathBuf::from("other.bin")),
            ..key(1)
        };
        assert!(cache.get(&other).is_none());
        assert!((cache.stats.hit_rate() - 0.0).abs() < f64::EPSILON);
    }
}
