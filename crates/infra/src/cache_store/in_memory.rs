//! Process-local cache with lazy TTL eviction.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{CacheError, CacheStore};
use crate::glob::glob_match;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a cache outage: every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .map(|m| m.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(CacheError::Unavailable("in-memory cache disabled".to_string()))
        } else {
            Ok(())
        }
    }
}

fn poisoned() -> CacheError {
    CacheError::Backend("lock poisoned".to_string())
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        {
            let entries = self.entries.read().map_err(|_| poisoned())?;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: evict.
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        Ok(keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .filter(|e| e.is_live(now))
            .count())
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .iter()
            .filter(|(k, e)| e.is_live(now) && glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_delete() {
        let cache = InMemoryCacheStore::new();
        cache.set("a", "1".into(), Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get("a").unwrap().as_deref(), Some("1"));

        assert_eq!(cache.delete(&["a".into(), "missing".into()]).unwrap(), 1);
        assert_eq!(cache.get("a").unwrap(), None);
    }

    #[test]
    fn expired_entries_are_invisible() {
        let cache = InMemoryCacheStore::new();
        cache.set("a", "1".into(), Duration::ZERO).unwrap();
        assert_eq!(cache.get("a").unwrap(), None);
        assert!(cache.scan("*").unwrap().is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn scan_matches_glob() {
        let cache = InMemoryCacheStore::new();
        let ttl = Duration::from_secs(60);
        cache.set("authz:decision:7:cms:alice:/docs/1:read", "x".into(), ttl).unwrap();
        cache.set("authz:decision:7:cms:bob:/docs/1:read", "x".into(), ttl).unwrap();
        cache.set("authz:decision:8:cms:alice:/docs/1:read", "x".into(), ttl).unwrap();

        let mut keys = cache.scan("authz:decision:7:*").unwrap();
        keys.sort();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].contains(":alice:"));
    }

    #[test]
    fn outage_surfaces_errors() {
        let cache = InMemoryCacheStore::new();
        cache.set_unavailable(true);
        assert!(matches!(cache.get("a"), Err(CacheError::Unavailable(_))));
    }
}
