//! In-process cache backend. Entries live as long as the kernel.

use crate::cache::{CacheItem, Expire};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, CacheItem>>>,
    request_time: i64,
}

impl MemoryCache {
    pub fn new(request_time: i64) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            request_time,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheItem>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_multiple(&self, cids: &[String]) -> HashMap<String, CacheItem> {
        let entries = self.entries();
        cids.iter()
            .filter_map(|cid| entries.get(cid).map(|item| (cid.clone(), item.clone())))
            .collect()
    }

    pub fn set(&self, cid: &str, data: Value, expire: Expire) {
        self.entries().insert(
            cid.to_string(),
            CacheItem {
                cid: cid.to_string(),
                data,
                created: self.request_time,
                expire,
            },
        );
    }

    pub fn clear(&self, cid: Option<&str>, wildcard: bool) {
        let now = self.request_time;
        let mut entries = self.entries();
        match cid {
            None => entries.retain(|_, item| !item.expire.is_wipeable(now)),
            Some("*") if wildcard => entries.clear(),
            Some(prefix) if wildcard => entries.retain(|key, _| !key.starts_with(prefix)),
            Some(cid) => {
                entries.remove(cid);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clones_share_entries() {
        let a = MemoryCache::new(100);
        let b = a.clone();
        a.set("x", json!("v"), Expire::Permanent);
        let found = b.get_multiple(&["x".to_string()]);
        assert_eq!(found["x"].data, json!("v"));
        assert_eq!(found["x"].created, 100);
    }

    #[test]
    fn test_general_clear_keeps_permanent_and_future() {
        let cache = MemoryCache::new(100);
        cache.set("permanent", json!(1), Expire::Permanent);
        cache.set("temporary", json!(2), Expire::Temporary);
        cache.set("expired", json!(3), Expire::At(50));
        cache.set("future", json!(4), Expire::At(500));
        cache.clear(None, false);

        let cids: Vec<String> = ["permanent", "temporary", "expired", "future"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut found: Vec<String> = cache.get_multiple(&cids).into_keys().collect();
        found.sort();
        assert_eq!(found, vec!["future", "permanent"]);
    }

    #[test]
    fn test_wildcard_clear() {
        let cache = MemoryCache::new(0);
        cache.set("theme:a", json!(1), Expire::Permanent);
        cache.set("theme:b", json!(1), Expire::Permanent);
        cache.set("menu", json!(1), Expire::Permanent);
        cache.clear(Some("theme:"), true);
        assert_eq!(cache.get_multiple(&["menu".to_string()]).len(), 1);
        assert!(cache.get_multiple(&["theme:a".to_string()]).is_empty());

        cache.clear(Some("*"), true);
        assert!(cache.is_empty());
    }
}
