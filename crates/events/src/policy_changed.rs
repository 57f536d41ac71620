//! "Policies changed" notification exchanged between engine instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use halberd_core::TenantId;

/// Why a tenant's policy set changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ChangeReason {
    RuleCreated,
    RuleUpdated,
    RulesDeleted,
    RuleApproved,
    RuleRejected,
    RulesExpired,
    /// Operator-requested resync (`sync_rules` / `refresh_cache`).
    ForceSync,
    Other(String),
}

impl core::fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::RuleCreated => f.write_str("rule_created"),
            Self::RuleUpdated => f.write_str("rule_updated"),
            Self::RulesDeleted => f.write_str("rules_deleted"),
            Self::RuleApproved => f.write_str("rule_approved"),
            Self::RuleRejected => f.write_str("rule_rejected"),
            Self::RulesExpired => f.write_str("rules_expired"),
            Self::ForceSync => f.write_str("force_sync"),
            Self::Other(reason) => write!(f, "other:{reason}"),
        }
    }
}

/// Broadcast after a committed rule-store write.
///
/// `tenant_id = None` addresses every tenant (full resync).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChanged {
    pub event_id: Uuid,
    pub origin: Uuid,
    pub tenant_id: Option<TenantId>,
    pub reason: ChangeReason,
    pub occurred_at: DateTime<Utc>,
}

impl PolicyChanged {
    pub fn new(origin: Uuid, tenant_id: Option<TenantId>, reason: ChangeReason) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            origin,
            tenant_id,
            reason,
            occurred_at: Utc::now(),
        }
    }

    pub fn for_tenant(origin: Uuid, tenant_id: TenantId, reason: ChangeReason) -> Self {
        Self::new(origin, Some(tenant_id), reason)
    }

    pub fn all_tenants(origin: Uuid, reason: ChangeReason) -> Self {
        Self::new(origin, None, reason)
    }
}
