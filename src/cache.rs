//! In-process LRU cache from content fingerprint to scan result.
//!
//! Process-local and never persisted. Bounded: once `max_size` entries
//! are held, the least recently used entry is evicted on insert. All
//! operations take an internal mutex, so the cache can be shared across
//! scan workers.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::ScanResult;

pub const DEFAULT_CACHE_SIZE: usize = 4096;

#[derive(Debug)]
pub struct HashCache {
    inner: Mutex<Inner>,
    max_size: usize,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, (ScanResult, u64)>,
    /// Monotonic access counter; higher = more recently used.
    tick: u64,
}

impl HashCache {
    pub fn new(max_size: usize) -> Self {
        HashCache {
            inner: Mutex::new(Inner::default()),
            max_size: max_size.max(1),
        }
    }

    /// Look up a fingerprint, refreshing its recency on hit.
    pub fn get(&self, sha256: &str) -> Option<ScanResult> {
        let mut inner = self.inner.lock().expect("cache mutex");
        inner.tick += 1;
        let tick = inner.tick;
        let (result, last_used) = inner.entries.get_mut(sha256)?;
        *last_used = tick;
        Some(result.clone())
    }

    /// Insert or refresh an entry, evicting the oldest when full.
    pub fn put(&self, sha256: &str, result: ScanResult) {
        let mut inner = self.inner.lock().expect("cache mutex");
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(sha256.to_string(), (result, tick));

        if inner.entries.len() > self.max_size {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, (_, used))| *used)
                .map(|(key, _)| key.clone())
            {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, sha256: &str) -> bool {
        self.inner
            .lock()
            .expect("cache mutex")
            .entries
            .contains_key(sha256)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("cache mutex").entries.clear();
    }
}

impl Default for HashCache {
    fn default() -> Self {
        HashCache::new(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;

    fn result(path: &str) -> ScanResult {
        ScanResult::clean(path, 0.0)
    }

    #[test]
    fn test_miss_returns_none() {
        let cache = HashCache::default();
        assert!(cache.get("deadbeef").is_none());
    }

    #[test]
    fn test_put_then_get() {
        let cache = HashCache::default();
        cache.put("abc", result("a.py"));
        let hit = cache.get("abc").unwrap();
        assert_eq!(hit.file_path, "a.py");
        assert!(cache.contains("abc"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_put_overwrites() {
        let cache = HashCache::default();
        cache.put("abc", result("a.py"));
        let mut updated = result("a.py");
        updated.risk_level = RiskLevel::High;
        cache.put("abc", updated);
        assert_eq!(cache.get("abc").unwrap().risk_level, RiskLevel::High);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bounded_eviction() {
        let cache = HashCache::new(3);
        for i in 0..5 {
            cache.put(&format!("hash{i}"), result("f"));
        }
        assert_eq!(cache.len(), 3);
        // Oldest entries were evicted
        assert!(cache.get("hash0").is_none());
        assert!(cache.get("hash1").is_none());
        assert!(cache.get("hash4").is_some());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = HashCache::new(2);
        cache.put("a", result("a"));
        cache.put("b", result("b"));
        // Touch "a" so "b" becomes the eviction candidate
        cache.get("a");
        cache.put("c", result("c"));
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_clear() {
        let cache = HashCache::default();
        cache.put("abc", result("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        let cache = Arc::new(HashCache::new(64));
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("t{t}-{i}");
                    cache.put(&key, ScanResult::clean("f", 0.0));
                    cache.get(&key);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.len() <= 64);
    }
}
