//! Bounded TTL + LRU cache for query embeddings.
//!
//! Keys are the SHA-256 of the normalized text, so "Hola  Mundo" and
//! "hola mundo" share an entry. Writes are never lost: an insert always lands,
//! evicting the least recently used entry if the cache is full.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Lowercase, trim and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cache key for a text: hex SHA-256 of its normalized form.
pub fn cache_key(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    format!("{:x}", hasher.finalize())
}

struct Entry {
    vector: Arc<Vec<f32>>,
    inserted_at: Instant,
    last_access: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    tick: u64,
}

pub struct EmbeddingCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl EmbeddingCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity.min(4096)),
                tick: 0,
            }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        let expired = match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                entry.last_access = tick;
                return Some(entry.vector.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: String, vector: Arc<Vec<f32>>) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let ttl = self.ttl;
            inner.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
            if inner.entries.len() >= self.capacity {
                let oldest = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    inner.entries.remove(&oldest);
                }
            }
        }

        inner.entries.insert(
            key,
            Entry {
                vector,
                inserted_at: Instant::now(),
                last_access: tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_case_and_spacing() {
        assert_eq!(normalize_text("  Hola   MUNDO\n"), "hola mundo");
        assert_eq!(cache_key("Hola  Mundo"), cache_key("hola mundo"));
        assert_ne!(cache_key("hola mundo"), cache_key("hola mundos"));
        assert_eq!(cache_key("x").len(), 64);
    }

    #[test]
    fn evicts_least_recently_used_at_capacity() {
        let cache = EmbeddingCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), Arc::new(vec![1.0]));
        cache.insert("b".into(), Arc::new(vec![2.0]));
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), Arc::new(vec![3.0]));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = EmbeddingCache::new(Duration::from_millis(0), 8);
        cache.insert("a".into(), Arc::new(vec![1.0]));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }
}
