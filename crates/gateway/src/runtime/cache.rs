//! ResourceCache — TTL + LRU cache for read-only resource payloads.
//!
//! Keys are (resource URI, optional identity scope). Writes to a device
//! invalidate every entry whose key references that device. Cold misses are
//! coalesced per key so only one fill hits the device.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    last_used: Instant,
    ttl: Duration,
}

pub struct ResourceCache {
    max_entries: usize,
    default_ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Per-key fill locks for miss coalescing.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResourceCache {
    pub fn new(max_entries: usize, default_ttl_secs: u64) -> Self {
        Self {
            max_entries,
            default_ttl: Duration::from_secs(default_ttl_secs),
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Compose the cache key. Identity-scoped resources carry the identity
    /// so one user's view never serves another's.
    pub fn key(uri: &str, identity: Option<&str>) -> String {
        match identity {
            Some(id) => format!("{uri}#{id}"),
            None => uri.to_string(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        if entry.inserted_at.elapsed() >= entry.ttl {
            entries.remove(key);
            return None;
        }
        entry.last_used = Instant::now();
        Some(entry.value.clone())
    }

    pub fn put(&self, key: String, value: Value, ttl_secs: Option<u64>) {
        let ttl = ttl_secs.map(Duration::from_secs).unwrap_or(self.default_ttl);
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            // Evict the least-recently-used entry.
            if let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&lru_key);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                last_used: now,
                ttl,
            },
        );
    }

    /// Drop every entry whose key references the device (by id or name).
    pub fn invalidate_device(&self, device_ref: &str) {
        self.entries
            .lock()
            .retain(|key, _| !key.contains(device_ref));
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Acquire the fill lock for a key. Callers hold it across the re-check
    /// and fetch so concurrent cold reads collapse into one device call.
    pub fn flight_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inflight
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Release bookkeeping for a finished fill (keeps the map bounded).
    pub fn flight_done(&self, key: &str) {
        let mut inflight = self.inflight.lock();
        if let Some(lock) = inflight.get(key) {
            // Only drop when nobody else holds a clone.
            if Arc::strong_count(lock) == 1 {
                inflight.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_get_round_trip() {
        let cache = ResourceCache::new(10, 300);
        cache.put("device://r1/health".into(), json!({"ok": true}), None);
        assert_eq!(cache.get("device://r1/health").unwrap()["ok"], true);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = ResourceCache::new(10, 300);
        cache.put("k".into(), json!(1), Some(0));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = ResourceCache::new(2, 300);
        cache.put("a".into(), json!(1), None);
        cache.put("b".into(), json!(2), None);
        // Touch "a" so "b" is the LRU victim.
        cache.get("a");
        cache.put("c".into(), json!(3), None);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn device_write_invalidates_matching_keys() {
        let cache = ResourceCache::new(10, 300);
        cache.put("device://r1/health".into(), json!(1), None);
        cache.put("device://r1/config".into(), json!(2), None);
        cache.put("device://r2/health".into(), json!(3), None);

        cache.invalidate_device("r1");
        assert!(cache.get("device://r1/health").is_none());
        assert!(cache.get("device://r1/config").is_none());
        assert!(cache.get("device://r2/health").is_some());
    }

    #[test]
    fn identity_scoping_in_key() {
        assert_eq!(
            ResourceCache::key("plan://x", Some("alice")),
            "plan://x#alice"
        );
        assert_eq!(ResourceCache::key("plan://x", None), "plan://x");
    }

    #[tokio::test]
    async fn flight_lock_coalesces() {
        let cache = Arc::new(ResourceCache::new(10, 300));
        let key = "fleet://lab/summary";

        let lock = cache.flight_lock(key);
        let guard = lock.lock().await;

        // A second taker sees the same lock instance.
        let lock2 = cache.flight_lock(key);
        assert!(lock2.try_lock().is_err());

        drop(guard);
        cache.flight_done(key);
    }
}
