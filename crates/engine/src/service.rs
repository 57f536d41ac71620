//! `PolicyService`: the inbound surface of the engine.
//!
//! Write path for every rule mutation:
//!
//! ```text
//! validate → rule store (commit) → evaluator registry → change bus → decision cache
//! ```
//!
//! The store commit is the point of no return. Once it succeeds, failures in
//! the later steps are logged and repaired locally (the tenant's evaluator is
//! dropped and rebuilt from the store on next access) instead of failing the
//! call.
//!
//! Reads go through the [`PermissionChecker`] and are fail-closed: a check that
//! cannot be answered is a deny.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use halberd_core::{Clock, DomainError, RuleId, TenantId};
use halberd_events::ChangeReason;
use halberd_infra::{CacheStore, ChangeBus, RuleFilter, RuleStore};
use halberd_policy::{
    GroupingRelation, PolicyRule, RuleKind, RuleStatus, RuleValidator, ValidationReport, gate,
};

use crate::cache::DecisionCache;
use crate::checker::PermissionChecker;
use crate::config::EngineConfig;
use crate::context::{PrincipalContext, TenantContext};
use crate::decision::{CheckOptions, CheckRequest, Decision};
use crate::error::{EvaluatorError, PolicyServiceError};
use crate::evaluator::{EvaluatorRegistry, GROUPING_RELATIONS};
use crate::sync::{PolicySynchronizer, SynchronizerHandle};

fn default_true() -> bool {
    true
}

/// Inbound permission question. The tenant comes from the call's
/// [`TenantContext`], the caller's roles from its [`PrincipalContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPermissionRequest {
    pub service: String,
    pub subject: String,
    pub object: String,
    pub action: String,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enable_cache: bool,
    #[serde(default)]
    pub audit_log: bool,
    /// Retry a non-explicit deny as each of the subject's roles.
    #[serde(default)]
    pub expand_roles: bool,
}

impl CheckPermissionRequest {
    pub fn new(
        service: impl Into<String>,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            subject: subject.into(),
            object: object.into(),
            action: action.into(),
            context: HashMap::new(),
            enable_cache: true,
            audit_log: false,
            expand_roles: false,
        }
    }

    pub fn with_role_expansion(mut self) -> Self {
        self.expand_roles = true;
        self
    }

    pub fn uncached(mut self) -> Self {
        self.enable_cache = false;
        self
    }

    fn to_check(&self, tenant_id: TenantId, principal: &PrincipalContext) -> CheckRequest {
        CheckRequest {
            tenant_id,
            service: self.service.clone(),
            subject: self.subject.clone(),
            object: self.object.clone(),
            action: self.action.clone(),
            caller_roles: principal.roles().to_vec(),
            context: self.context.clone(),
        }
    }

    fn options(&self) -> CheckOptions {
        CheckOptions {
            enable_cache: self.enable_cache,
            audit_log: self.audit_log,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPermissionResponse {
    pub allowed: bool,
    pub reason: String,
    pub applied_rules: Vec<String>,
    pub data_filters: serde_json::Map<String, serde_json::Value>,
    pub field_masks: Vec<String>,
    pub duration_ms: u64,
    pub from_cache: bool,
}

impl From<Decision> for CheckPermissionResponse {
    fn from(d: Decision) -> Self {
        Self {
            allowed: d.allowed,
            reason: d.reason,
            applied_rules: d.applied_rules,
            data_filters: d.data_filters,
            field_masks: d.field_masks,
            duration_ms: d.duration_ms,
            from_cache: d.from_cache,
        }
    }
}

/// `success_count` counts allowed responses, `failed_count` denied ones
/// (including checks that errored and were denied).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCheckResponse {
    pub responses: Vec<CheckPermissionResponse>,
    pub success_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRulesResponse {
    pub synced_count: usize,
    pub synced_services: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionEntry {
    pub service: String,
    pub resource: String,
    pub actions: Vec<String>,
    pub effect: String,
    /// `"direct"` or the role the permission is inherited from.
    pub source: String,
    pub rule_id: RuleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSummary {
    pub permissions: Vec<PermissionEntry>,
    pub total_count: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Compiled evaluators.
    Rule,
    /// Memoized decisions and role sets.
    Decision,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshCacheResponse {
    pub success: bool,
    pub message: String,
    pub cleared_entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub expired_rule_ids: Vec<RuleId>,
    pub tenants: Vec<TenantId>,
}

pub struct PolicyService {
    store: Arc<dyn RuleStore>,
    registry: Arc<EvaluatorRegistry>,
    cache: Arc<DecisionCache>,
    checker: Arc<PermissionChecker>,
    synchronizer: Arc<PolicySynchronizer>,
    validator: RuleValidator,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    listener: Mutex<Option<SynchronizerHandle>>,
}

impl PolicyService {
    /// Wire the engine over its collaborators.
    ///
    /// Fails if the embedded evaluator model does not compile.
    pub async fn new(
        store: Arc<dyn RuleStore>,
        cache_store: Arc<dyn CacheStore>,
        bus: Arc<dyn ChangeBus>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, PolicyServiceError> {
        let registry = Arc::new(EvaluatorRegistry::new(store.clone(), clock.clone()).await?);
        let cache = Arc::new(DecisionCache::new(cache_store, config.decision_ttl, config.role_ttl).with_clock(clock.clone()));
        let checker = Arc::new(PermissionChecker::new(
            registry.clone(),
            cache.clone(),
            store.clone(),
            clock.clone(),
            &config,
        ));
        let synchronizer = Arc::new(PolicySynchronizer::new(
            bus,
            registry.clone(),
            cache.clone(),
            config.instance_id,
        ));

        info!(instance_id = %config.instance_id, "policy service ready");

        Ok(Self {
            store,
            registry,
            cache,
            checker,
            synchronizer,
            validator: RuleValidator::new(GROUPING_RELATIONS),
            clock,
            config,
            listener: Mutex::new(None),
        })
    }

    /// Replace the checker, e.g. to install an audit sink or enrichers.
    pub fn with_checker(mut self, configure: impl FnOnce(PermissionChecker) -> PermissionChecker) -> Self {
        let base = PermissionChecker::new(
            self.registry.clone(),
            self.cache.clone(),
            self.store.clone(),
            self.clock.clone(),
            &self.config,
        );
        self.checker = Arc::new(configure(base));
        self
    }

    pub fn registry(&self) -> &Arc<EvaluatorRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    pub fn checker(&self) -> &Arc<PermissionChecker> {
        &self.checker
    }

    pub fn synchronizer(&self) -> &Arc<PolicySynchronizer> {
        &self.synchronizer
    }

    /// Start applying remote changes. A second call is a no-op.
    pub async fn listen(&self) {
        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            *listener = Some(self.synchronizer.listen());
        }
    }

    /// Stop the listener and drop every compiled evaluator.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.shutdown().await;
        }
        let dropped = self.registry.clear_all();
        info!(evaluators = dropped, "policy service stopped");
    }

    // ---- decisions ----

    /// Fail-closed single check: any error becomes a deny carrying it as reason.
    pub async fn check_permission(
        &self,
        tenant: &TenantContext,
        principal: &PrincipalContext,
        request: CheckPermissionRequest,
    ) -> CheckPermissionResponse {
        let check = request.to_check(tenant.tenant_id(), principal);
        let opts = request.options();

        let result = if request.expand_roles {
            self.checker.check_with_role_expansion(&check, opts).await
        } else {
            self.checker.check(&check, opts).await
        };

        match result {
            Ok(decision) => decision.into(),
            Err(e) => {
                warn!(
                    tenant_id = %tenant.tenant_id(),
                    subject = %check.subject,
                    error = %e,
                    "permission check failed; denying"
                );
                Decision::deny(e.to_string()).into()
            }
        }
    }

    /// Check a batch concurrently, preserving order.
    ///
    /// Caching is used only if every request enables it; auditing if any
    /// request asks for it. Role expansion is not applied to batches.
    pub async fn batch_check_permission(
        &self,
        tenant: &TenantContext,
        principal: &PrincipalContext,
        requests: Vec<CheckPermissionRequest>,
        fail_fast: bool,
    ) -> Result<BatchCheckResponse, PolicyServiceError> {
        let opts = CheckOptions {
            enable_cache: requests.iter().all(|r| r.enable_cache),
            audit_log: requests.iter().any(|r| r.audit_log),
            deadline: None,
        };
        let checks = requests
            .iter()
            .map(|r| r.to_check(tenant.tenant_id(), principal))
            .collect();

        let decisions = self.checker.batch_check(checks, opts, fail_fast).await?;
        let success_count = decisions.iter().filter(|d| d.allowed).count();
        let failed_count = decisions.len() - success_count;

        Ok(BatchCheckResponse {
            responses: decisions.into_iter().map(Into::into).collect(),
            success_count,
            failed_count,
        })
    }

    // ---- rule writes ----

    /// Validate `rule` without storing it. With `check_conflicts`, the tenant's
    /// stored rules for the same service are scanned for duplicates and
    /// opposite-effect twins.
    pub async fn validate_rule(
        &self,
        tenant: &TenantContext,
        rule: &PolicyRule,
        check_conflicts: bool,
    ) -> Result<ValidationReport, PolicyServiceError> {
        let now = self.clock.now();
        if !check_conflicts {
            return Ok(self.validator.validate(rule, None, now));
        }

        let existing = self
            .store
            .find(&RuleFilter::tenant(tenant.tenant_id()).service(rule.service_name.clone()))
            .await?;
        Ok(self.validator.validate(rule, Some(&existing), now))
    }

    #[instrument(skip(self, tenant, rule), fields(tenant_id = %tenant.tenant_id(), ptype = %rule.ptype), err)]
    pub async fn create_rule(
        &self,
        tenant: &TenantContext,
        rule: PolicyRule,
    ) -> Result<PolicyRule, PolicyServiceError> {
        ensure_tenant(tenant, &rule)?;
        self.ensure_valid(tenant, &rule).await?;

        let now = self.clock.now();
        let mut rule = rule;
        rule.created_at = now;
        rule.updated_at = now;
        let stored = self.store.insert(rule).await?;

        if let Err(e) = self.registry.add_rule(&stored).await {
            self.repair(stored.tenant_id, stored.id, &e);
        }
        self.broadcast(stored.tenant_id, ChangeReason::RuleCreated);
        let cleared = self.invalidate_for(&stored).await;

        info!(rule_id = %stored.id, cleared, "rule created");
        Ok(stored)
    }

    /// Replace a stored rule. Usage counters and creation time are kept from
    /// the stored version.
    #[instrument(skip(self, tenant, rule), fields(tenant_id = %tenant.tenant_id(), rule_id = %rule.id), err)]
    pub async fn update_rule(
        &self,
        tenant: &TenantContext,
        rule: PolicyRule,
    ) -> Result<PolicyRule, PolicyServiceError> {
        ensure_tenant(tenant, &rule)?;
        let previous = self.load(tenant, rule.id).await?;
        self.ensure_valid(tenant, &rule).await?;

        let mut current = rule;
        current.created_at = previous.created_at;
        current.usage_count = previous.usage_count;
        current.last_used_at = previous.last_used_at;
        current.updated_at = self.clock.now();
        self.store.update(&current).await?;

        self.apply_replacement(&previous, &current, ChangeReason::RuleUpdated).await;
        info!("rule updated");
        Ok(current)
    }

    /// Delete rules by id; ids that do not exist are skipped. Returns the ids
    /// actually removed.
    ///
    /// Deletion stops at the first store error. Rules deleted before it are
    /// still broadcast and invalidated, then the error is returned.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.tenant_id()), err)]
    pub async fn delete_rules(
        &self,
        tenant: &TenantContext,
        ids: &[RuleId],
    ) -> Result<Vec<RuleId>, PolicyServiceError> {
        let tenant_id = tenant.tenant_id();
        let mut removed = Vec::new();
        let mut failure = None;
        for id in ids {
            match self.store.delete(tenant_id, *id).await {
                Ok(Some(rule)) => {
                    if let Err(e) = self.registry.remove_rule(&rule).await {
                        self.repair(tenant_id, rule.id, &e);
                    }
                    removed.push(rule);
                }
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if !removed.is_empty() {
            self.broadcast(tenant_id, ChangeReason::RulesDeleted);
            let mut cleared = 0;
            for rule in &removed {
                cleared += self.invalidate_for(rule).await;
            }
            info!(deleted = removed.len(), cleared, "rules deleted");
        }

        if let Some(e) = failure {
            return Err(e.into());
        }
        Ok(removed.iter().map(|r| r.id).collect())
    }

    /// Approve a rule awaiting approval; if otherwise eligible it becomes
    /// active immediately.
    #[instrument(skip(self, tenant, approver), fields(tenant_id = %tenant.tenant_id(), approver = %approver.principal_id()), err)]
    pub async fn approve_rule(
        &self,
        tenant: &TenantContext,
        id: RuleId,
        approver: &PrincipalContext,
    ) -> Result<PolicyRule, PolicyServiceError> {
        let previous = self.load(tenant, id).await?;
        if !previous.require_approval {
            return Err(DomainError::validation(format!("rule {id} does not require approval")).into());
        }

        let mut current = previous.clone();
        current.approve(approver.principal_id(), self.clock.now());
        self.store.update(&current).await?;

        self.apply_replacement(&previous, &current, ChangeReason::RuleApproved).await;
        info!(rule_id = %id, active = gate::is_active(&current, self.clock.now()), "rule approved");
        Ok(current)
    }

    #[instrument(skip(self, tenant, approver), fields(tenant_id = %tenant.tenant_id(), approver = %approver.principal_id()), err)]
    pub async fn reject_rule(
        &self,
        tenant: &TenantContext,
        id: RuleId,
        approver: &PrincipalContext,
    ) -> Result<PolicyRule, PolicyServiceError> {
        let previous = self.load(tenant, id).await?;
        if !previous.require_approval {
            return Err(DomainError::validation(format!("rule {id} does not require approval")).into());
        }

        let mut current = previous.clone();
        current.reject(approver.principal_id(), self.clock.now());
        self.store.update(&current).await?;

        self.apply_replacement(&previous, &current, ChangeReason::RuleRejected).await;
        info!(rule_id = %id, "rule rejected");
        Ok(current)
    }

    /// Disable every temporary rule whose window has closed, across tenants,
    /// then reload the tenants they belonged to.
    #[instrument(skip(self), err)]
    pub async fn expire_temporary(&self) -> Result<ExpiryReport, PolicyServiceError> {
        let now = self.clock.now();
        let candidates = self
            .store
            .find(&RuleFilter::all_tenants().temporary(true).status(RuleStatus::Enabled))
            .await?;
        let (expired, _) = gate::partition_expired(candidates, now);

        let mut report = ExpiryReport::default();
        let mut tenants = BTreeSet::new();
        for mut rule in expired {
            rule.status = RuleStatus::Disabled;
            rule.updated_at = now;
            match self.store.update(&rule).await {
                Ok(()) => {
                    report.expired_rule_ids.push(rule.id);
                    tenants.insert(rule.tenant_id);
                }
                Err(e) => warn!(rule_id = %rule.id, tenant_id = %rule.tenant_id, error = %e, "could not expire rule"),
            }
        }

        for tenant_id in &tenants {
            if let Err(e) = self.registry.reload_policy(*tenant_id).await {
                warn!(tenant_id = %tenant_id, error = %e, "reload after expiry failed; dropping evaluator");
                self.registry.clear_cache(*tenant_id);
            }
            self.broadcast(*tenant_id, ChangeReason::RulesExpired);
            self.cache.invalidate_tenant(*tenant_id);
        }

        report.tenants = tenants.into_iter().collect();
        if !report.expired_rule_ids.is_empty() {
            info!(expired = report.expired_rule_ids.len(), tenants = report.tenants.len(), "temporary rules expired");
        }
        Ok(report)
    }

    // ---- maintenance & queries ----

    /// Make sure the tenant's evaluator reflects the store. With
    /// `force_reload` a resident evaluator is rebuilt and other instances are
    /// told to do the same.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.tenant_id()), err)]
    pub async fn sync_rules(
        &self,
        tenant: &TenantContext,
        service: Option<&str>,
        force_reload: bool,
    ) -> Result<SyncRulesResponse, PolicyServiceError> {
        let started = Instant::now();
        let tenant_id = tenant.tenant_id();

        let reloaded = force_reload && self.registry.reload_policy(tenant_id).await?;
        if !reloaded {
            self.registry.evaluator(tenant_id).await?;
        }

        let mut filter = RuleFilter::tenant(tenant_id).active_at(self.clock.now());
        if let Some(service) = service {
            filter = filter.service(service);
        }
        let active = self.store.find(&filter).await?;
        let synced_services: BTreeSet<String> = active.iter().map(|r| r.service_name.clone()).collect();

        match service {
            Some(service) => self.cache.invalidate_service(tenant_id, service),
            None => self.cache.invalidate_tenant(tenant_id),
        };
        if force_reload {
            self.broadcast(tenant_id, ChangeReason::ForceSync);
        }

        Ok(SyncRulesResponse {
            synced_count: active.len(),
            synced_services: synced_services.into_iter().collect(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Permissions reachable by `user`, one entry per (service, resource,
    /// effect, source) with the actions merged.
    pub async fn user_permission_summary(
        &self,
        tenant: &TenantContext,
        user: &str,
        service: Option<&str>,
        include_inherited: bool,
    ) -> Result<PermissionSummary, PolicyServiceError> {
        let granted = self
            .registry
            .permissions_for(tenant.tenant_id(), user, service, include_inherited)
            .await?;

        let mut grouped: BTreeMap<(bool, String, String, String, String), PermissionEntry> = BTreeMap::new();
        for permission in granted {
            let rule_id = permission.rule_ids.first().copied().unwrap_or(RuleId::UNASSIGNED);
            let key = (
                permission.source != "direct",
                permission.source.clone(),
                permission.service.clone(),
                permission.object.clone(),
                permission.effect.as_str().to_string(),
            );
            let entry = grouped.entry(key).or_insert_with(|| PermissionEntry {
                service: permission.service.clone(),
                resource: permission.object.clone(),
                actions: Vec::new(),
                effect: permission.effect.as_str().to_string(),
                source: permission.source.clone(),
                rule_id,
            });
            if !entry.actions.contains(&permission.action) {
                entry.actions.push(permission.action);
            }
            if rule_id.is_assigned() && (!entry.rule_id.is_assigned() || rule_id < entry.rule_id) {
                entry.rule_id = rule_id;
            }
        }

        let permissions: Vec<PermissionEntry> = grouped
            .into_values()
            .map(|mut e| {
                e.actions.sort();
                e
            })
            .collect();
        Ok(PermissionSummary {
            total_count: permissions.len(),
            permissions,
        })
    }

    /// Drop compiled evaluators and/or memoized decisions for the tenant.
    /// A `service` narrows decision invalidation; evaluators are per tenant.
    pub async fn refresh_cache(
        &self,
        tenant: &TenantContext,
        cache_type: CacheType,
        service: Option<&str>,
    ) -> RefreshCacheResponse {
        let tenant_id = tenant.tenant_id();
        let mut cleared = 0;

        if matches!(cache_type, CacheType::Decision | CacheType::All) {
            cleared += match service {
                Some(service) => self.cache.invalidate_service(tenant_id, service),
                None => self.cache.invalidate_tenant(tenant_id),
            };
        }

        if matches!(cache_type, CacheType::Rule | CacheType::All) {
            match self.registry.reload_policy(tenant_id).await {
                Ok(true) => cleared += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "evaluator refresh failed");
                    return RefreshCacheResponse {
                        success: false,
                        message: format!("evaluator refresh failed: {e}"),
                        cleared_entries: cleared,
                    };
                }
            }
        }

        info!(tenant_id = %tenant_id, ?cache_type, cleared, "cache refreshed");
        RefreshCacheResponse {
            success: true,
            message: format!("{cache_type:?} cache refreshed").to_lowercase(),
            cleared_entries: cleared,
        }
    }

    // ---- internals ----

    async fn load(&self, tenant: &TenantContext, id: RuleId) -> Result<PolicyRule, PolicyServiceError> {
        self.store
            .get(tenant.tenant_id(), id)
            .await?
            .ok_or(PolicyServiceError::NotFound(id))
    }

    async fn ensure_valid(&self, tenant: &TenantContext, rule: &PolicyRule) -> Result<(), PolicyServiceError> {
        let report = self.validate_rule(tenant, rule, true).await?;
        if !report.valid {
            return Err(PolicyServiceError::Invalid(report.errors));
        }
        for warning in &report.warnings {
            warn!(tenant_id = %rule.tenant_id, rule_id = %rule.id, warning = %warning, "rule validation warning");
        }
        Ok(())
    }

    async fn apply_replacement(&self, previous: &PolicyRule, current: &PolicyRule, reason: ChangeReason) {
        if let Err(e) = self.registry.replace_rule(previous, current).await {
            self.repair(current.tenant_id, current.id, &e);
        }
        self.broadcast(current.tenant_id, reason);
        self.invalidate_for(previous).await;
        self.invalidate_for(current).await;
    }

    /// The evaluator may now disagree with the store: drop it so the next
    /// access rebuilds from committed rows.
    fn repair(&self, tenant_id: TenantId, rule_id: RuleId, e: &EvaluatorError) {
        error!(tenant_id = %tenant_id, rule_id = %rule_id, error = %e, "incremental evaluator update failed; dropping evaluator");
        self.registry.clear_cache(tenant_id);
    }

    fn broadcast(&self, tenant_id: TenantId, reason: ChangeReason) {
        if let Err(e) = self.synchronizer.notify(Some(tenant_id), reason) {
            warn!(tenant_id = %tenant_id, error = %e, "policy change not broadcast; other instances stay stale until their next reload");
        }
    }

    /// Clear cached decisions a change to `rule` can affect.
    ///
    /// Role groupings and permissions touch one subject and everyone inheriting
    /// from it; object groupings can touch anyone, so the tenant is cleared.
    async fn invalidate_for(&self, rule: &PolicyRule) -> usize {
        let subject = match rule.kind() {
            Ok(RuleKind::Permission(p)) => p.subject,
            Ok(RuleKind::Grouping(g)) if g.relation == GroupingRelation::Role => g.member,
            _ => return self.cache.invalidate_tenant(rule.tenant_id),
        };

        match self.registry.affected_subjects(rule.tenant_id, &subject).await {
            Ok(subjects) => self
                .cache
                .invalidate_subjects(rule.tenant_id, subjects.iter().map(String::as_str)),
            Err(e) => {
                warn!(tenant_id = %rule.tenant_id, error = %e, "could not resolve dependents; clearing tenant cache");
                self.cache.invalidate_tenant(rule.tenant_id)
            }
        }
    }
}

fn ensure_tenant(tenant: &TenantContext, rule: &PolicyRule) -> Result<(), DomainError> {
    if rule.tenant_id != tenant.tenant_id() {
        return Err(DomainError::TenantIsolation);
    }
    Ok(())
}
