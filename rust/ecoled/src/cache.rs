use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Owner + request identity of a cached report.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub user: String,
    pub method: String,
    pub params: String,
}

impl CacheKey {
    /// `params` is keyed by its serialized form; serde_json maps keep sorted
    /// keys so equal params give equal keys.
    pub fn new(user: &str, method: &str, params: &serde_json::Value) -> Self {
        Self {
            user: user.to_string(),
            method: method.to_string(),
            params: params.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedReport {
    stored_at: Instant,
    value: serde_json::Value,
}

/// Per-user report cache, expired by age only.
///
/// Score writes do not invalidate entries: a report read within the TTL after
/// a write may be stale.
#[derive(Debug)]
pub struct ReportCache {
    ttl: Duration,
    entries: HashMap<CacheKey, CachedReport>,
}

impl ReportCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn get(&mut self, key: &CacheKey, now: Instant) -> Option<serde_json::Value> {
        let fresh = match self.entries.get(key) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.stored_at) < self.ttl,
        };
        if fresh {
            self.entries.get(key).map(|e| e.value.clone())
        } else {
            self.entries.remove(key);
            None
        }
    }

    pub fn put(&mut self, key: CacheKey, value: serde_json::Value, now: Instant) {
        if self.ttl.is_zero() {
            return;
        }
        self.purge_expired(now);
        self.entries.insert(
            key,
            CachedReport {
                stored_at: now,
                value,
            },
        );
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.stored_at) < ttl);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serves_until_ttl_then_expires() {
        let mut cache = ReportCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        let key = CacheKey::new("u1", "reports.predefined", &json!({ "kind": "atRisk" }));
        cache.put(key.clone(), json!({ "rows": [1] }), t0);

        assert_eq!(
            cache.get(&key, t0 + Duration::from_secs(59)),
            Some(json!({ "rows": [1] }))
        );
        assert_eq!(cache.get(&key, t0 + Duration::from_secs(60)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_are_scoped_per_user() {
        let mut cache = ReportCache::new(Duration::from_secs(60));
        let now = Instant::now();
        let params = json!({ "kind": "topStudents", "limit": 5 });
        cache.put(CacheKey::new("u1", "m", &params), json!(1), now);
        assert_eq!(cache.get(&CacheKey::new("u2", "m", &params), now), None);
        assert_eq!(cache.get(&CacheKey::new("u1", "m", &params), now), Some(json!(1)));
    }

    #[test]
    fn key_ignores_param_field_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).expect("json");
        let b: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).expect("json");
        assert_eq!(CacheKey::new("u", "m", &a), CacheKey::new("u", "m", &b));
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let mut cache = ReportCache::new(Duration::ZERO);
        let now = Instant::now();
        cache.put(CacheKey::new("u", "m", &json!({})), json!(1), now);
        assert_eq!(cache.len(), 0);
    }
}
