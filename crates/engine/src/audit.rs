//! Decision audit trail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use halberd_core::TenantId;

use crate::decision::{CheckRequest, Decision};

/// What was asked and what was answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tenant_id: TenantId,
    pub service: String,
    pub subject: String,
    pub object: String,
    pub action: String,
    pub allowed: bool,
    pub reason: String,
    pub applied_rules: Vec<String>,
    pub from_cache: bool,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(request: &CheckRequest, decision: &Decision, at: DateTime<Utc>) -> Self {
        Self {
            tenant_id: request.tenant_id,
            service: request.service.clone(),
            subject: request.subject.clone(),
            object: request.object.clone(),
            action: request.action.clone(),
            allowed: decision.allowed,
            reason: decision.reason.clone(),
            applied_rules: decision.applied_rules.clone(),
            from_cache: decision.from_cache,
            duration_ms: decision.duration_ms,
            at,
        }
    }
}

/// Receives audit records. Called off the request path; failures are the
/// sink's own concern.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord);
}

/// Emits each record as a structured `info` event on the `halberd::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) {
        info!(
            target: "halberd::audit",
            tenant_id = %record.tenant_id,
            service = %record.service,
            subject = %record.subject,
            object = %record.object,
            action = %record.action,
            allowed = record.allowed,
            reason = %record.reason,
            applied_rules = ?record.applied_rules,
            from_cache = record.from_cache,
            duration_ms = record.duration_ms,
            "permission decision"
        );
    }
}
