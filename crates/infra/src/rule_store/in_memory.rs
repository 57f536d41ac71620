//! In-memory rule store for tests/dev.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use halberd_core::{RuleId, TenantId};
use halberd_policy::PolicyRule;

use super::{RuleFilter, RuleStore, RuleStoreError};

#[derive(Debug)]
pub struct InMemoryRuleStore {
    rules: RwLock<BTreeMap<RuleId, PolicyRule>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an unreachable database: every call fails until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rules.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), RuleStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(RuleStoreError::Storage("rule store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> RuleStoreError {
    RuleStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn insert(&self, mut rule: PolicyRule) -> Result<PolicyRule, RuleStoreError> {
        self.check_available()?;
        if rule.id.is_assigned() {
            return Err(RuleStoreError::AlreadyPersisted(rule.id));
        }

        let id = RuleId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        rule.id = id;

        let mut rules = self.rules.write().map_err(|_| poisoned())?;
        rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn get(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError> {
        self.check_available()?;
        let rules = self.rules.read().map_err(|_| poisoned())?;
        match rules.get(&id) {
            Some(rule) if rule.tenant_id == tenant_id => Ok(Some(rule.clone())),
            Some(_) => Err(RuleStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    async fn update(&self, rule: &PolicyRule) -> Result<(), RuleStoreError> {
        self.check_available()?;
        let mut rules = self.rules.write().map_err(|_| poisoned())?;
        match rules.get_mut(&rule.id) {
            Some(stored) if stored.tenant_id == rule.tenant_id => {
                *stored = rule.clone();
                Ok(())
            }
            Some(_) => Err(RuleStoreError::TenantIsolation),
            None => Err(RuleStoreError::NotFound(rule.id)),
        }
    }

    async fn delete(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError> {
        self.check_available()?;
        let mut rules = self.rules.write().map_err(|_| poisoned())?;
        match rules.get(&id) {
            Some(rule) if rule.tenant_id != tenant_id => Err(RuleStoreError::TenantIsolation),
            Some(_) => Ok(rules.remove(&id)),
            None => Ok(None),
        }
    }

    async fn find(&self, filter: &RuleFilter) -> Result<Vec<PolicyRule>, RuleStoreError> {
        self.check_available()?;
        let rules = self.rules.read().map_err(|_| poisoned())?;
        Ok(rules.values().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn record_usage(
        &self,
        tenant_id: TenantId,
        ids: &[RuleId],
        at: DateTime<Utc>,
    ) -> Result<(), RuleStoreError> {
        self.check_available()?;
        let mut rules = self.rules.write().map_err(|_| poisoned())?;
        for id in ids {
            if let Some(rule) = rules.get_mut(id) {
                if rule.tenant_id == tenant_id {
                    rule.usage_count += 1;
                    rule.last_used_at = Some(at);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use halberd_policy::{Effect, RuleStatus};

    fn tenant(n: u64) -> TenantId {
        TenantId::new(n)
    }

    fn rule(t: TenantId) -> PolicyRule {
        PolicyRule::permission(t, "cms", "editor", "/docs/*", "write", Effect::Allow)
    }

    #[tokio::test]
    async fn insert_assigns_sequential_ids() {
        let store = InMemoryRuleStore::new();
        let a = store.insert(rule(tenant(7))).await.unwrap();
        let b = store.insert(rule(tenant(7))).await.unwrap();
        assert_eq!(a.id, RuleId::new(1));
        assert_eq!(b.id, RuleId::new(2));

        let err = store.insert(a.clone()).await.unwrap_err();
        assert_eq!(err, RuleStoreError::AlreadyPersisted(a.id));
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let store = InMemoryRuleStore::new();
        let stored = store.insert(rule(tenant(7))).await.unwrap();

        assert_eq!(store.get(tenant(8), stored.id).await, Err(RuleStoreError::TenantIsolation));
        assert_eq!(store.delete(tenant(8), stored.id).await, Err(RuleStoreError::TenantIsolation));
        assert!(store.find(&RuleFilter::tenant(tenant(8))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn find_applies_gate_when_active_at_is_set() {
        let store = InMemoryRuleStore::new();
        let now = Utc::now();
        store.insert(rule(tenant(7))).await.unwrap();
        store.insert(rule(tenant(7)).with_status(RuleStatus::Disabled)).await.unwrap();
        store
            .insert(rule(tenant(7)).effective_between(Some(now + Duration::hours(1)), None))
            .await
            .unwrap();

        let all = store.find(&RuleFilter::tenant(tenant(7))).await.unwrap();
        let active = store.find(&RuleFilter::tenant(tenant(7)).active_at(now)).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, RuleId::new(1));
    }

    #[tokio::test]
    async fn usage_is_recorded_per_tenant() {
        let store = InMemoryRuleStore::new();
        let stored = store.insert(rule(tenant(7))).await.unwrap();
        let at = Utc::now();

        store.record_usage(tenant(7), &[stored.id], at).await.unwrap();
        store.record_usage(tenant(8), &[stored.id], at).await.unwrap();

        let reread = store.get(tenant(7), stored.id).await.unwrap().unwrap();
        assert_eq!(reread.usage_count, 1);
        assert_eq!(reread.last_used_at, Some(at));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryRuleStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.find(&RuleFilter::tenant(tenant(7))).await,
            Err(RuleStoreError::Storage(_))
        ));
        store.set_unavailable(false);
        assert!(store.find(&RuleFilter::tenant(tenant(7))).await.is_ok());
    }
}
