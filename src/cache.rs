//! Region-keyed result cache.

use std::collections::HashMap;
use std::sync::RwLock;

pub const RECENT_RESULTS_REGION: &str = "probe-results";
pub const TARGET_STATUS_REGION: &str = "target-status";

pub trait Cache: Send + Sync {
    fn evict(&self, region: &str, key: &str);
}

/// Process-local cache of serialized values.
#[derive(Default)]
pub struct InMemoryCache {
    regions: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, region: &str, key: &str, value: serde_json::Value) {
        if let Ok(mut regions) = self.regions.write() {
            regions
                .entry(region.to_string())
                .or_default()
                .insert(key.to_string(), value);
        }
    }

    pub fn get(&self, region: &str, key: &str) -> Option<serde_json::Value> {
        let regions = self.regions.read().ok()?;
        regions.get(region)?.get(key).cloned()
    }
}

impl Cache for InMemoryCache {
    fn evict(&self, region: &str, key: &str) {
        if let Ok(mut regions) = self.regions.write() {
            if let Some(entries) = regions.get_mut(region) {
                entries.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_evict_only_touches_region_and_key() {
        let cache = InMemoryCache::new();
        cache.put(RECENT_RESULTS_REGION, "a", json!([1]));
        cache.put(RECENT_RESULTS_REGION, "b", json!([2]));
        cache.put(TARGET_STATUS_REGION, "a", json!("UP"));

        cache.evict(RECENT_RESULTS_REGION, "a");
        assert!(cache.get(RECENT_RESULTS_REGION, "a").is_none());
        assert_eq!(cache.get(RECENT_RESULTS_REGION, "b"), Some(json!([2])));
        assert_eq!(cache.get(TARGET_STATUS_REGION, "a"), Some(json!("UP")));

        cache.evict("missing", "a");
    }
}
