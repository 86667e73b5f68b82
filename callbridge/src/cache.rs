//! TTL result cache
//!
//! Keys are `plugin.method:fingerprint`, where the fingerprint is the
//! canonical JSON of the call arguments (object keys sorted). Capacity is
//! enforced on insertion: expired entries are purged first, then the
//! earliest inserted entry is evicted.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default maximum number of cached results
pub const DEFAULT_MAX_ENTRIES: usize = 200;

/// Deterministic serialization of call arguments
///
/// Object keys are sorted explicitly instead of relying on `serde_json`'s
/// default `BTreeMap` map: any crate in the build enabling `preserve_order`
/// would otherwise make the key depend on argument insertion order.
pub fn fingerprint(options: &Value) -> String {
    let mut out = String::new();
    write_canonical(options, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Cache key for a call
pub fn cache_key(plugin_id: &str, method_name: &str, options: &Value) -> String {
    format!("{}:{}", method_prefix(plugin_id, method_name), fingerprint(options))
}

/// Prefix matching every entry of a plugin
pub fn plugin_prefix(plugin_id: &str) -> String {
    format!("{}.", plugin_id)
}

/// Prefix matching every entry of one plugin method
pub fn method_prefix(plugin_id: &str, method_name: &str) -> String {
    format!("{}.{}", plugin_id, method_name)
}

struct CacheEntry {
    data: Value,
    expires_at: Instant,
    inserted: u64,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    max_entries: usize,
    next_insert: u64,
}

impl CacheInner {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.inserted)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            tracing::trace!(key = %key, "Evicted cache entry");
        }
    }
}

/// Shared TTL cache of prior call results
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<Mutex<CacheInner>>,
}

impl ResultCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                entries: HashMap::new(),
                max_entries,
                next_insert: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached data for `key` if unexpired; an expired entry is purged
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => return Some(entry.data.clone()),
            Some(_) => {}
            None => return None,
        }
        inner.entries.remove(key);
        None
    }

    /// Insert `data` under `key` for `ttl`
    pub fn put(&self, key: impl Into<String>, data: Value, ttl: Duration) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.lock();
        if inner.max_entries == 0 {
            return;
        }

        inner.purge_expired(now);
        if !inner.entries.contains_key(&key) && inner.entries.len() >= inner.max_entries {
            inner.evict_oldest();
        }

        let inserted = inner.next_insert;
        inner.next_insert += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                expires_at: now + ttl,
                inserted,
            },
        );
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - inner.entries.len();
        if removed > 0 {
            tracing::debug!(prefix = %prefix, removed, "Invalidated cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Change capacity; shrinking evicts the earliest inserted entries
    pub fn set_max_entries(&self, max_entries: usize) {
        let mut inner = self.lock();
        inner.max_entries = max_entries;
        inner.purge_expired(Instant::now());
        while inner.entries.len() > max_entries {
            inner.evict_oldest();
        }
    }

    /// Number of stored entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_fingerprint_sorts_keys() {
        let a = json!({"b": 1, "a": {"y": [1, {"d": 2, "c": 3}], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, {"c": 3, "d": 2}]}, "b": 1});
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&json!({"k": "v"})), r#"{"k":"v"}"#);
        assert_ne!(fingerprint(&json!([1, 2])), fingerprint(&json!([2, 1])));
    }

    #[test]
    fn test_key_layout() {
        let key = cache_key("Storage", "get", &json!({"key": "token"}));
        assert_eq!(key, r#"Storage.get:{"key":"token"}"#);
        assert!(key.starts_with(&plugin_prefix("Storage")));
        assert!(key.starts_with(&format!("{}:", method_prefix("Storage", "get"))));
    }

    #[test]
    fn test_get_put() {
        let cache = ResultCache::default();
        assert_eq!(cache.get("a"), None);
        cache.put("a", json!(1), TTL);
        assert_eq!(cache.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_expired_entries_are_purged_on_lookup() {
        let cache = ResultCache::default();
        cache.put("a", json!(1), Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest_inserted() {
        let cache = ResultCache::new(2);
        cache.put("a", json!(1), TTL);
        cache.put("b", json!(2), TTL);
        // Reading does not refresh insertion order
        assert!(cache.get("a").is_some());
        cache.put("c", json!(3), TTL);

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(json!(2)));
        assert_eq!(cache.get("c"), Some(json!(3)));
    }

    #[test]
    fn test_capacity_purges_expired_first() {
        let cache = ResultCache::new(2);
        cache.put("a", json!(1), TTL);
        cache.put("b", json!(2), Duration::from_millis(10));
        thread::sleep(Duration::from_millis(30));
        cache.put("c", json!(3), TTL);

        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replacing_key_does_not_evict() {
        let cache = ResultCache::new(2);
        cache.put("a", json!(1), TTL);
        cache.put("b", json!(2), TTL);
        cache.put("a", json!(10), TTL);
        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.get("b"), Some(json!(2)));
    }

    #[test]
    fn test_invalidate_by_prefix() {
        let cache = ResultCache::default();
        cache.put(cache_key("Preferences", "get", &json!({"key": "a"})), json!(1), TTL);
        cache.put(cache_key("Preferences", "keys", &json!({})), json!(2), TTL);
        cache.put(cache_key("PreferencesExtra", "get", &json!({})), json!(3), TTL);
        cache.put(cache_key("Storage", "get", &json!({})), json!(4), TTL);

        let removed = cache.invalidate(&format!("{}:", method_prefix("Preferences", "get")));
        assert_eq!(removed, 1);

        let removed = cache.invalidate(&plugin_prefix("Preferences"));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = ResultCache::new(0);
        cache.put("a", json!(1), TTL);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_shrink_capacity() {
        let cache = ResultCache::new(3);
        cache.put("a", json!(1), TTL);
        cache.put("b", json!(2), TTL);
        cache.put("c", json!(3), TTL);
        cache.set_max_entries(1);
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.len(), 1);
    }
}
