//! Decision cache.
//!
//! Memoizes decisions per (tenant, service, subject, object, action) and
//! transitive role sets per (tenant, subject) on top of a [`CacheStore`].
//! Entries are never updated, only invalidated; a cache failure is logged and
//! treated as a miss.
//!
//! Key segments are percent-encoded (`%` and `:`), so `:` only ever appears as
//! the separator. An entry also carries the instant the evaluator that
//! produced it stops being exact; it is not served at or after that instant.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use halberd_core::{Clock, SystemClock, TenantId};
use halberd_infra::glob::escape;
use halberd_infra::{CacheError, CacheStore};

use crate::decision::{CheckRequest, Decision};

const DECISION_PREFIX: &str = "authz:decision";
const ROLES_PREFIX: &str = "authz:roles";

/// One key segment, with `%` and `:` percent-encoded.
pub fn encode_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['%', ':']) {
        return Cow::Borrowed(segment);
    }
    let mut encoded = String::with_capacity(segment.len() + 4);
    for c in segment.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            ':' => encoded.push_str("%3A"),
            other => encoded.push(other),
        }
    }
    Cow::Owned(encoded)
}

/// Encoded segment, glob-escaped for use in a scan pattern.
fn pattern_segment(segment: &str) -> String {
    escape(&encode_segment(segment))
}

pub fn decision_key(request: &CheckRequest) -> String {
    format!(
        "{DECISION_PREFIX}:{}:{}:{}:{}:{}",
        request.tenant_id,
        encode_segment(&request.service),
        encode_segment(&request.subject),
        encode_segment(&request.object),
        encode_segment(&request.action),
    )
}

pub fn roles_key(tenant_id: TenantId, subject: &str) -> String {
    format!("{ROLES_PREFIX}:{tenant_id}:{}", encode_segment(subject))
}

#[derive(Serialize, Deserialize)]
struct Entry<T> {
    value: T,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
}

pub struct DecisionCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    decision_ttl: Duration,
    role_ttl: Duration,
}

impl DecisionCache {
    pub fn new(store: Arc<dyn CacheStore>, decision_ttl: Duration, role_ttl: Duration) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            decision_ttl,
            role_ttl,
        }
    }

    /// Clock used to honor `valid_until`; the system clock by default.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Cached decision, marked `from_cache`.
    pub fn get(&self, request: &CheckRequest) -> Option<Decision> {
        let mut decision: Decision = self.read(&decision_key(request))?;
        decision.from_cache = true;
        Some(decision)
    }

    pub fn set(&self, request: &CheckRequest, decision: &Decision) {
        self.set_until(request, decision, None);
    }

    /// Cache a decision that stops being exact at `valid_until`.
    pub fn set_until(&self, request: &CheckRequest, decision: &Decision, valid_until: Option<DateTime<Utc>>) {
        let mut stored = decision.clone();
        stored.from_cache = false;
        self.write(&decision_key(request), stored, self.decision_ttl, valid_until);
    }

    pub fn get_roles(&self, tenant_id: TenantId, subject: &str) -> Option<Vec<String>> {
        self.read(&roles_key(tenant_id, subject))
    }

    pub fn set_roles(&self, tenant_id: TenantId, subject: &str, roles: &[String]) {
        self.set_roles_until(tenant_id, subject, roles, None);
    }

    pub fn set_roles_until(
        &self,
        tenant_id: TenantId,
        subject: &str,
        roles: &[String],
        valid_until: Option<DateTime<Utc>>,
    ) {
        self.write(&roles_key(tenant_id, subject), roles, self.role_ttl, valid_until);
    }

    fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.store.get(key).unwrap_or_else(|e| miss(key, e))?;
        match serde_json::from_str::<Entry<T>>(&raw) {
            Ok(entry) if entry.valid_until.is_some_and(|at| self.clock.now() >= at) => {
                let _ = self.store.delete(&[key.to_string()]);
                None
            }
            Ok(entry) => Some(entry.value),
            Err(e) => {
                warn!(key = %key, error = %e, "dropping undecodable cache entry");
                let _ = self.store.delete(&[key.to_string()]);
                None
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: T, ttl: Duration, valid_until: Option<DateTime<Utc>>) {
        let ttl = match valid_until {
            Some(at) => match (at - self.clock.now()).to_std() {
                Ok(left) if !left.is_zero() => ttl.min(left),
                _ => return,
            },
            None => ttl,
        };
        let raw = match serde_json::to_string(&Entry { value, valid_until }) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "cache value not serializable");
                return;
            }
        };
        if let Err(e) = self.store.set(key, raw, ttl) {
            warn!(key = %key, error = %e, "cache write failed");
        }
    }

    /// Drop the subject's role set and every decision cached for it.
    pub fn invalidate_subject(&self, tenant_id: TenantId, subject: &str) -> usize {
        let pattern = format!("{DECISION_PREFIX}:{tenant_id}:*:{}:*", pattern_segment(subject));
        let mut keys = self.scan(&pattern);
        keys.push(roles_key(tenant_id, subject));
        self.delete(keys)
    }

    pub fn invalidate_subjects<'a>(&self, tenant_id: TenantId, subjects: impl IntoIterator<Item = &'a str>) -> usize {
        subjects
            .into_iter()
            .map(|subject| self.invalidate_subject(tenant_id, subject))
            .sum()
    }

    /// Every decision of one service within a tenant (role sets are service-independent).
    pub fn invalidate_service(&self, tenant_id: TenantId, service: &str) -> usize {
        let keys = self.scan(&format!("{DECISION_PREFIX}:{tenant_id}:{}:*", pattern_segment(service)));
        self.delete(keys)
    }

    /// Every decision and role set of a tenant.
    pub fn invalidate_tenant(&self, tenant_id: TenantId) -> usize {
        let mut keys = self.scan(&format!("{DECISION_PREFIX}:{tenant_id}:*"));
        keys.extend(self.scan(&format!("{ROLES_PREFIX}:{tenant_id}:*")));
        self.delete(keys)
    }

    /// Every decision (optionally only for one service) and role set across tenants.
    pub fn invalidate_all(&self, service: Option<&str>) -> usize {
        match service {
            Some(service) => {
                let keys = self.scan(&format!("{DECISION_PREFIX}:*:{}:*", pattern_segment(service)));
                self.delete(keys)
            }
            None => {
                let mut keys = self.scan(&format!("{DECISION_PREFIX}:*"));
                keys.extend(self.scan(&format!("{ROLES_PREFIX}:*")));
                self.delete(keys)
            }
        }
    }

    fn scan(&self, pattern: &str) -> Vec<String> {
        self.store.scan(pattern).unwrap_or_else(|e| {
            warn!(pattern = %pattern, error = %e, "cache scan failed; invalidation incomplete");
            Vec::new()
        })
    }

    fn delete(&self, keys: Vec<String>) -> usize {
        if keys.is_empty() {
            return 0;
        }
        self.store.delete(&keys).unwrap_or_else(|e| {
            warn!(keys = keys.len(), error = %e, "cache delete failed; invalidation incomplete");
            0
        })
    }
}

fn miss<T>(key: &str, e: CacheError) -> Option<T> {
    warn!(key = %key, error = %e, "cache read failed; evaluating");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use halberd_core::ManualClock;
    use halberd_infra::InMemoryCacheStore;

    fn cache() -> (Arc<InMemoryCacheStore>, DecisionCache) {
        let store = Arc::new(InMemoryCacheStore::new());
        let cache = DecisionCache::new(store.clone(), Duration::from_secs(300), Duration::from_secs(600));
        (store, cache)
    }

    fn request(tenant: u64, subject: &str) -> CheckRequest {
        CheckRequest::new(TenantId::new(tenant), "cms", subject, "/docs/1", "read")
    }

    #[test]
    fn hit_is_marked_from_cache() {
        let (_store, cache) = cache();
        let req = request(7, "alice");
        assert!(cache.get(&req).is_none());

        cache.set(&req, &Decision::allow("matched"));
        let hit = cache.get(&req).unwrap();
        assert!(hit.allowed);
        assert!(hit.from_cache);
    }

    #[test]
    fn subject_invalidation_is_scoped() {
        let (store, cache) = cache();
        cache.set(&request(7, "alice"), &Decision::allow("x"));
        cache.set(&request(7, "bob"), &Decision::allow("x"));
        cache.set(&request(8, "alice"), &Decision::allow("x"));
        cache.set_roles(TenantId::new(7), "alice", &["editor".to_string()]);

        assert_eq!(cache.invalidate_subject(TenantId::new(7), "alice"), 2);
        assert!(cache.get(&request(7, "alice")).is_none());
        assert!(cache.get_roles(TenantId::new(7), "alice").is_none());
        assert!(cache.get(&request(7, "bob")).is_some());
        assert!(cache.get(&request(8, "alice")).is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn glob_characters_in_subjects_are_literal() {
        let (_store, cache) = cache();
        cache.set(&request(7, "alice"), &Decision::allow("x"));
        assert_eq!(cache.invalidate_subject(TenantId::new(7), "*"), 0);
        assert!(cache.get(&request(7, "alice")).is_some());
    }

    #[test]
    fn separators_inside_segments_do_not_collide() {
        let (_store, cache) = cache();
        let colon_object = CheckRequest::new(TenantId::new(7), "cms", "a", "b:c", "read");
        let colon_subject = CheckRequest::new(TenantId::new(7), "cms", "a:b", "c", "read");
        assert_ne!(decision_key(&colon_object), decision_key(&colon_subject));

        cache.set(&colon_object, &Decision::allow("x"));
        assert!(cache.get(&colon_subject).is_none());
        assert!(cache.get(&colon_object).is_some());

        // Invalidating "a:b" must not touch "a", and "a" must still reach its own entry.
        assert_eq!(cache.invalidate_subject(TenantId::new(7), "a:b"), 0);
        assert!(cache.get(&colon_object).is_some());
        assert_eq!(cache.invalidate_subject(TenantId::new(7), "a"), 1);
        assert!(cache.get(&colon_object).is_none());
    }

    #[test]
    fn encoded_segments_invalidate_by_service() {
        let (_store, cache) = cache();
        let req = CheckRequest::new(TenantId::new(7), "billing:eu", "100%", "/x", "read");
        cache.set(&req, &Decision::allow("x"));
        assert_eq!(encode_segment("100%:a"), "100%25%3Aa");
        assert_eq!(cache.invalidate_service(TenantId::new(7), "billing"), 0);
        assert_eq!(cache.invalidate_service(TenantId::new(7), "billing:eu"), 1);
    }

    #[test]
    fn entries_lapse_at_their_valid_until() {
        let store = Arc::new(InMemoryCacheStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = DecisionCache::new(store, Duration::from_secs(300), Duration::from_secs(600))
            .with_clock(clock.clone());
        let req = request(7, "alice");
        let horizon = clock.now() + chrono::Duration::minutes(1);

        cache.set_until(&req, &Decision::allow("x"), Some(horizon));
        cache.set_roles_until(TenantId::new(7), "alice", &["editor".to_string()], Some(horizon));
        assert!(cache.get(&req).is_some());
        assert!(cache.get_roles(TenantId::new(7), "alice").is_some());

        clock.advance(chrono::Duration::minutes(2));
        assert!(cache.get(&req).is_none());
        assert!(cache.get_roles(TenantId::new(7), "alice").is_none());

        // Already past its horizon: not written at all.
        cache.set_until(&req, &Decision::allow("x"), Some(horizon));
        assert!(cache.get(&req).is_none());
    }

    #[test]
    fn tenant_invalidation_counts_entries() {
        let (_store, cache) = cache();
        cache.set(&request(7, "alice"), &Decision::allow("x"));
        cache.set(&request(7, "bob"), &Decision::deny("x"));
        cache.set_roles(TenantId::new(7), "alice", &[]);
        cache.set(&request(8, "alice"), &Decision::allow("x"));

        assert_eq!(cache.invalidate_tenant(TenantId::new(7)), 3);
        assert_eq!(cache.invalidate_all(None), 1);
    }

    #[test]
    fn outage_degrades_to_miss() {
        let (store, cache) = cache();
        let req = request(7, "alice");
        cache.set(&req, &Decision::allow("x"));

        store.set_unavailable(true);
        assert!(cache.get(&req).is_none());
        cache.set(&req, &Decision::deny("x"));
        assert_eq!(cache.invalidate_tenant(TenantId::new(7)), 0);

        store.set_unavailable(false);
        assert!(cache.get(&req).unwrap().allowed);
    }
}
