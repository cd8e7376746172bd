// In-process read cache private to a `TemplateStore` instance.
//
// Keyed by the same logical names as the backing store (`template.<id>`,
// `metadata.index`); invalidated synchronously on every write so it can
// never mask a record that has been deleted.

use dashmap::DashMap;
use serde_json::Value;

pub struct ReadCache {
    entries: DashMap<String, Value>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn put(&self, key: String, value: Value) {
        self.entries.insert(key, value);
    }

    /// Removes a single key. Called on every write/delete to that key so a
    /// stale cached value can never outlive the record it describes.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalidate_removes_only_that_key() {
        let cache = ReadCache::new();
        cache.put("template.1".to_string(), json!({"id": "1"}));
        cache.put("template.2".to_string(), json!({"id": "2"}));
        cache.invalidate("template.1");
        assert!(cache.get("template.1").is_none());
        assert!(cache.get("template.2").is_some());
    }

    #[test]
    fn cache_never_serves_a_value_after_invalidation() {
        let cache = ReadCache::new();
        cache.put("metadata.index".to_string(), json!({}));
        cache.invalidate("metadata.index");
        assert!(cache.get("metadata.index").is_none());
    }
}
