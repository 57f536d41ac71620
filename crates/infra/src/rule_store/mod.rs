//! Policy rule persistence.
//!
//! The engine treats the store as an ordered (by id), filterable collection of
//! [`PolicyRule`] rows. Every operation is tenant-scoped except [`RuleStore::find`]
//! with `tenant_id = None`, used by cross-tenant maintenance (expiry sweep).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use halberd_core::{RuleId, TenantId};
use halberd_policy::{PolicyRule, RuleStatus, gate};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryRuleStore;
pub use postgres::PostgresRuleStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleStoreError {
    #[error("rule not found: {0}")]
    NotFound(RuleId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("rule already persisted: {0}")]
    AlreadyPersisted(RuleId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Row filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleFilter {
    pub tenant_id: Option<TenantId>,
    pub service_name: Option<String>,
    pub ptype: Option<String>,
    /// `v0`: permission subject / grouping member.
    pub subject: Option<String>,
    /// `v1`: permission object / grouping group.
    pub object: Option<String>,
    /// `v2`: permission action.
    pub action: Option<String>,
    pub status: Option<RuleStatus>,
    /// Only rules passing the approval & temporal gate at this instant.
    pub active_at: Option<DateTime<Utc>>,
    pub temporary: Option<bool>,
}

impl RuleFilter {
    pub fn tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Self::default()
        }
    }

    /// Every tenant (maintenance only).
    pub fn all_tenants() -> Self {
        Self::default()
    }

    pub fn service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    pub fn ptype(mut self, ptype: impl Into<String>) -> Self {
        self.ptype = Some(ptype.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn scope(
        mut self,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        self.subject = Some(subject.into());
        self.object = Some(object.into());
        self.action = Some(action.into());
        self
    }

    pub fn status(mut self, status: RuleStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn active_at(mut self, now: DateTime<Utc>) -> Self {
        self.active_at = Some(now);
        self
    }

    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = Some(temporary);
        self
    }

    /// In-process evaluation of the filter (reference semantics for all stores).
    pub fn matches(&self, rule: &PolicyRule) -> bool {
        fn eq(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().is_none_or(|e| e == actual)
        }

        self.tenant_id.is_none_or(|t| t == rule.tenant_id)
            && eq(&self.service_name, &rule.service_name)
            && eq(&self.ptype, &rule.ptype)
            && eq(&self.subject, &rule.v0)
            && eq(&self.object, &rule.v1)
            && eq(&self.action, &rule.v2)
            && self.status.is_none_or(|s| s == rule.status)
            && self.temporary.is_none_or(|t| t == rule.is_temporary)
            && self.active_at.is_none_or(|now| gate::is_active(rule, now))
    }
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Persist a new rule; the store assigns its id.
    async fn insert(&self, rule: PolicyRule) -> Result<PolicyRule, RuleStoreError>;

    async fn get(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError>;

    /// Replace a stored rule (matched by tenant + id).
    async fn update(&self, rule: &PolicyRule) -> Result<(), RuleStoreError>;

    /// Delete a rule, returning the removed row (`None` if absent).
    async fn delete(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError>;

    /// Matching rows ordered by id.
    async fn find(&self, filter: &RuleFilter) -> Result<Vec<PolicyRule>, RuleStoreError>;

    /// Bump usage counters for rules that contributed to an allow decision.
    async fn record_usage(
        &self,
        tenant_id: TenantId,
        ids: &[RuleId],
        at: DateTime<Utc>,
    ) -> Result<(), RuleStoreError>;
}

#[async_trait]
impl<S> RuleStore for Arc<S>
where
    S: RuleStore + ?Sized,
{
    async fn insert(&self, rule: PolicyRule) -> Result<PolicyRule, RuleStoreError> {
        (**self).insert(rule).await
    }

    async fn get(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError> {
        (**self).get(tenant_id, id).await
    }

    async fn update(&self, rule: &PolicyRule) -> Result<(), RuleStoreError> {
        (**self).update(rule).await
    }

    async fn delete(&self, tenant_id: TenantId, id: RuleId) -> Result<Option<PolicyRule>, RuleStoreError> {
        (**self).delete(tenant_id, id).await
    }

    async fn find(&self, filter: &RuleFilter) -> Result<Vec<PolicyRule>, RuleStoreError> {
        (**self).find(filter).await
    }

    async fn record_usage(
        &self,
        tenant_id: TenantId,
        ids: &[RuleId],
        at: DateTime<Utc>,
    ) -> Result<(), RuleStoreError> {
        (**self).record_usage(tenant_id, ids, at).await
    }
}
