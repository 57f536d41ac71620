//! Per-tenant evaluator pool.
//!
//! One evaluator per tenant, built lazily from the rule store on first access
//! and kept for the life of the registry. Each tenant has its own
//! readers-writer slot (many concurrent evaluations, exclusive mutation) and
//! its own construction lock, so building one tenant never blocks another.
//!
//! An evaluator is exact until its next temporal transition; the first access
//! at or after that instant rebuilds it from the store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use halberd_core::{Clock, TenantId};
use halberd_infra::{RuleFilter, RuleStore};
use halberd_policy::{PolicyRule, gate};

use super::compiled::{Evaluation, Evaluator, GrantedPermission, new_enforcer};
use crate::error::EvaluatorError;

type Slot = Arc<RwLock<Evaluator>>;

pub struct EvaluatorRegistry {
    store: Arc<dyn RuleStore>,
    clock: Arc<dyn Clock>,
    evaluators: DashMap<TenantId, Slot>,
    build_locks: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl EvaluatorRegistry {
    /// Fails if the embedded model does not compile.
    pub async fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>) -> Result<Self, EvaluatorError> {
        new_enforcer().await?;
        Ok(Self {
            store,
            clock,
            evaluators: DashMap::new(),
            build_locks: DashMap::new(),
        })
    }

    fn resident(&self, tenant_id: TenantId) -> Option<Slot> {
        self.evaluators.get(&tenant_id).map(|slot| slot.value().clone())
    }

    fn build_lock(&self, tenant_id: TenantId) -> Arc<Mutex<()>> {
        self.build_locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    async fn build(&self, tenant_id: TenantId) -> Result<Evaluator, EvaluatorError> {
        let now = self.clock.now();
        let rules = self.store.find(&RuleFilter::tenant(tenant_id)).await?;
        let evaluator = Evaluator::build(tenant_id, &rules, now).await?;
        debug!(tenant_id = %tenant_id, tuples = evaluator.len(), "evaluator built");
        Ok(evaluator)
    }

    /// The tenant's evaluator, building it on first access.
    pub async fn evaluator(&self, tenant_id: TenantId) -> Result<Slot, EvaluatorError> {
        if let Some(slot) = self.resident(tenant_id) {
            let stale = slot.read().await.is_stale(self.clock.now());
            if stale {
                self.refresh_stale(tenant_id, &slot).await;
            }
            return Ok(slot);
        }

        let lock = self.build_lock(tenant_id);
        let _guard = lock.lock().await;

        if let Some(slot) = self.resident(tenant_id) {
            return Ok(slot);
        }

        let slot = Arc::new(RwLock::new(self.build(tenant_id).await?));
        self.evaluators.insert(tenant_id, slot.clone());
        Ok(slot)
    }

    /// Rebuild after a temporal transition. On failure the old evaluator keeps
    /// serving and the next access retries.
    async fn refresh_stale(&self, tenant_id: TenantId, slot: &Slot) {
        let lock = self.build_lock(tenant_id);
        let _guard = lock.lock().await;

        if !slot.read().await.is_stale(self.clock.now()) {
            return;
        }

        match self.build(tenant_id).await {
            Ok(fresh) => {
                debug!(tenant_id = %tenant_id, "evaluator rebuilt after temporal transition");
                *slot.write().await = fresh;
            }
            Err(e) => warn!(tenant_id = %tenant_id, error = %e, "temporal rebuild failed; serving previous evaluator"),
        }
    }

    pub async fn enforce(
        &self,
        tenant_id: TenantId,
        subject: &str,
        service: &str,
        object: &str,
        action: &str,
    ) -> Result<Evaluation, EvaluatorError> {
        let slot = self.evaluator(tenant_id).await?;
        let evaluator = slot.read().await;
        evaluator.enforce(subject, service, object, action)
    }

    /// Compile a newly stored or newly activated rule into its tenant's
    /// evaluator, if resident. Returns whether the evaluator changed.
    ///
    /// A rule that is not active yet only moves the evaluator's next
    /// transition so it is picked up on time.
    pub async fn add_rule(&self, rule: &PolicyRule) -> Result<bool, EvaluatorError> {
        let lock = self.build_lock(rule.tenant_id);
        let _guard = lock.lock().await;

        let Some(slot) = self.resident(rule.tenant_id) else {
            return Ok(false);
        };

        let now = self.clock.now();
        let mut evaluator = slot.write().await;
        evaluator.track_transitions(rule, now);
        if !gate::is_active(rule, now) {
            return Ok(false);
        }
        evaluator.insert(rule).await
    }

    /// Remove a rule from its tenant's evaluator, if resident.
    pub async fn remove_rule(&self, rule: &PolicyRule) -> Result<bool, EvaluatorError> {
        let lock = self.build_lock(rule.tenant_id);
        let _guard = lock.lock().await;

        let Some(slot) = self.resident(rule.tenant_id) else {
            return Ok(false);
        };
        let mut evaluator = slot.write().await;
        evaluator.remove(rule).await
    }

    /// Replace `previous` with `current` (same id) in one exclusive section.
    pub async fn replace_rule(&self, previous: &PolicyRule, current: &PolicyRule) -> Result<bool, EvaluatorError> {
        let lock = self.build_lock(current.tenant_id);
        let _guard = lock.lock().await;

        let Some(slot) = self.resident(current.tenant_id) else {
            return Ok(false);
        };

        let now = self.clock.now();
        let mut evaluator = slot.write().await;
        let removed = evaluator.remove(previous).await?;
        evaluator.track_transitions(current, now);
        let added = if gate::is_active(current, now) {
            evaluator.insert(current).await?
        } else {
            false
        };
        Ok(removed || added)
    }

    /// Rebuild a resident evaluator from the store and swap it in atomically.
    ///
    /// Returns `false` when the tenant has no resident evaluator (it will be
    /// built from the store on first access anyway). On failure the previous
    /// evaluator stays in place.
    #[instrument(skip(self), err)]
    pub async fn reload_policy(&self, tenant_id: TenantId) -> Result<bool, EvaluatorError> {
        let lock = self.build_lock(tenant_id);
        let _guard = lock.lock().await;

        let Some(slot) = self.resident(tenant_id) else {
            return Ok(false);
        };

        let fresh = self.build(tenant_id).await?;
        *slot.write().await = fresh;
        info!(tenant_id = %tenant_id, "policy reloaded");
        Ok(true)
    }

    /// Reload every resident evaluator; returns the tenants reloaded.
    pub async fn reload_all(&self) -> Vec<TenantId> {
        let mut reloaded = Vec::new();
        for tenant_id in self.resident_tenants() {
            match self.reload_policy(tenant_id).await {
                Ok(true) => reloaded.push(tenant_id),
                Ok(false) => {}
                Err(e) => warn!(tenant_id = %tenant_id, error = %e, "reload failed; serving previous evaluator"),
            }
        }
        reloaded
    }

    /// Drop a tenant's evaluator; the next access rebuilds it.
    pub fn clear_cache(&self, tenant_id: TenantId) -> bool {
        self.evaluators.remove(&tenant_id).is_some()
    }

    pub fn clear_all(&self) -> usize {
        let count = self.evaluators.len();
        self.evaluators.clear();
        count
    }

    pub fn is_resident(&self, tenant_id: TenantId) -> bool {
        self.evaluators.contains_key(&tenant_id)
    }

    pub fn resident_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.evaluators.iter().map(|e| *e.key()).collect();
        tenants.sort();
        tenants
    }

    pub async fn roles_for(&self, tenant_id: TenantId, subject: &str) -> Result<Vec<String>, EvaluatorError> {
        let slot = self.evaluator(tenant_id).await?;
        let evaluator = slot.read().await;
        Ok(evaluator.roles_for(subject))
    }

    /// Role set plus the instant the evaluator stops being exact.
    pub async fn roles_until(
        &self,
        tenant_id: TenantId,
        subject: &str,
    ) -> Result<(Vec<String>, Option<DateTime<Utc>>), EvaluatorError> {
        let slot = self.evaluator(tenant_id).await?;
        let evaluator = slot.read().await;
        Ok((evaluator.roles_for(subject), evaluator.next_transition()))
    }

    /// `subject` plus everyone inheriting from it: the subjects whose decisions
    /// a change to `subject`'s rules can affect.
    pub async fn affected_subjects(&self, tenant_id: TenantId, subject: &str) -> Result<Vec<String>, EvaluatorError> {
        let slot = self.evaluator(tenant_id).await?;
        let evaluator = slot.read().await;
        let mut subjects = vec![subject.to_string()];
        subjects.extend(evaluator.dependents_of(subject));
        Ok(subjects)
    }

    pub async fn permissions_for(
        &self,
        tenant_id: TenantId,
        subject: &str,
        service: Option<&str>,
        include_inherited: bool,
    ) -> Result<Vec<GrantedPermission>, EvaluatorError> {
        let slot = self.evaluator(tenant_id).await?;
        let evaluator = slot.read().await;
        Ok(evaluator.permissions_for(subject, service, include_inherited))
    }
}
