//! Permission checker: the decision API.
//!
//! Order of evaluation for one request: request validation, superadmin bypass,
//! decision cache, tenant evaluator. Evaluator decisions are enriched, cached,
//! and (when allowed) counted against the contributing rules. Every failure
//! path ends in a deny.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use halberd_core::{Clock, RuleId, TenantId};
use halberd_infra::RuleStore;

use crate::audit::{AuditRecord, AuditSink, TracingAuditSink};
use crate::cache::DecisionCache;
use crate::config::EngineConfig;
use crate::decision::{CheckOptions, CheckRequest, Decision};
use crate::error::CheckError;
use crate::evaluator::{Evaluation, EvaluatorRegistry};

pub const REASON_ALLOWED: &str = "allowed by policy";
pub const REASON_DENIED: &str = "denied by policy";
pub const REASON_NO_MATCH: &str = "no matching policy";
pub const REASON_SUPERADMIN: &str = "superadmin bypass";
pub const REASON_DEADLINE: &str = "deadline exceeded";

/// Post-decision hook supplying row filters and field masks for a service.
///
/// Runs on fresh evaluator decisions only; its output is cached with them.
pub trait DecisionEnricher: Send + Sync {
    fn enrich(&self, request: &CheckRequest, decision: &mut Decision);
}

pub struct PermissionChecker {
    registry: Arc<EvaluatorRegistry>,
    cache: Arc<DecisionCache>,
    store: Arc<dyn RuleStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    enrichers: HashMap<String, Arc<dyn DecisionEnricher>>,
    superadmin_role: String,
    default_deadline: Option<Duration>,
    batch_concurrency: usize,
}

impl PermissionChecker {
    pub fn new(
        registry: Arc<EvaluatorRegistry>,
        cache: Arc<DecisionCache>,
        store: Arc<dyn RuleStore>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            store,
            clock,
            audit: Arc::new(TracingAuditSink),
            enrichers: HashMap::new(),
            superadmin_role: config.superadmin_role.clone(),
            default_deadline: config.check_timeout,
            batch_concurrency: config.batch_concurrency.max(1),
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn with_enricher(mut self, service: impl Into<String>, enricher: Arc<dyn DecisionEnricher>) -> Self {
        self.enrichers.insert(service.into(), enricher);
        self
    }

    /// Direct check.
    pub async fn check(&self, request: &CheckRequest, opts: CheckOptions) -> Result<Decision, CheckError> {
        self.run(request, opts, false).await
    }

    /// Direct check, then on a non-explicit deny retry as each of the
    /// subject's roles; the first role that is allowed grants and is named in
    /// `applied_rules`.
    pub async fn check_with_role_expansion(
        &self,
        request: &CheckRequest,
        opts: CheckOptions,
    ) -> Result<Decision, CheckError> {
        self.run(request, opts, true).await
    }

    /// Check many requests concurrently.
    ///
    /// The result has one decision per request, in request order. With
    /// `fail_fast` the first error aborts the remaining checks and is returned;
    /// otherwise a failed check becomes a deny carrying the error as reason.
    pub async fn batch_check(
        self: &Arc<Self>,
        requests: Vec<CheckRequest>,
        opts: CheckOptions,
        fail_fast: bool,
    ) -> Result<Vec<Decision>, CheckError> {
        let total = requests.len();
        let permits = Arc::new(Semaphore::new(self.batch_concurrency));
        let mut tasks = JoinSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            let checker = Arc::clone(self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, checker.check(&request, opts).await)
            });
        }

        let mut slots: Vec<Option<Decision>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(decision))) => slots[index] = Some(decision),
                Ok((index, Err(e))) => {
                    if fail_fast {
                        tasks.abort_all();
                        return Err(e);
                    }
                    slots[index] = Some(Decision::deny(e.to_string()));
                }
                Err(e) => {
                    if fail_fast {
                        tasks.abort_all();
                        return Err(CheckError::Task(e.to_string()));
                    }
                    warn!(error = %e, "batch check task failed");
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Decision::deny("check task failed")))
            .collect())
    }

    async fn run(&self, request: &CheckRequest, opts: CheckOptions, expand: bool) -> Result<Decision, CheckError> {
        let started = Instant::now();
        if let Some(field) = request.missing_field() {
            return Err(CheckError::InvalidRequest(format!("{field} must not be empty")));
        }

        let work = async {
            if expand {
                self.decide_expanded(request, opts.enable_cache).await
            } else {
                self.decide(request, opts.enable_cache).await
            }
        };

        let decision = match opts.deadline.or(self.default_deadline) {
            Some(deadline) => match tokio::time::timeout(deadline, work).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        tenant_id = %request.tenant_id,
                        subject = %request.subject,
                        deadline_ms = deadline.as_millis() as u64,
                        "check deadline exceeded; denying"
                    );
                    Decision::deny(REASON_DEADLINE)
                }
            },
            None => work.await?,
        }
        .with_duration(started.elapsed());

        if opts.audit_log {
            let record = AuditRecord::new(request, &decision, self.clock.now());
            let sink = Arc::clone(&self.audit);
            tokio::spawn(async move { sink.record(record).await });
        }

        Ok(decision)
    }

    fn is_superadmin(&self, request: &CheckRequest) -> bool {
        request.caller_roles.iter().any(|r| *r == self.superadmin_role)
    }

    async fn decide(&self, request: &CheckRequest, use_cache: bool) -> Result<Decision, CheckError> {
        if self.is_superadmin(request) {
            let mut decision = Decision::allow(REASON_SUPERADMIN);
            decision.applied_rules.push(self.superadmin_role.clone());
            return Ok(decision);
        }

        if use_cache {
            let key = request.clone();
            if let Some(hit) = self.off_thread(move |cache| cache.get(&key)).await.flatten() {
                return Ok(hit);
            }
        }

        let evaluation = self
            .registry
            .enforce(
                request.tenant_id,
                &request.subject,
                &request.service,
                &request.object,
                &request.action,
            )
            .await?;

        if evaluation.allowed && !evaluation.matched_rules.is_empty() {
            self.track_usage(request.tenant_id, evaluation.matched_rules.clone());
        }

        let valid_until = evaluation.valid_until;
        let mut decision = decision_from(evaluation);
        if let Some(enricher) = self.enrichers.get(&request.service) {
            enricher.enrich(request, &mut decision);
        }

        if use_cache {
            let (key, stored) = (request.clone(), decision.clone());
            self.off_thread(move |cache| cache.set_until(&key, &stored, valid_until)).await;
        }
        Ok(decision)
    }

    async fn decide_expanded(&self, request: &CheckRequest, use_cache: bool) -> Result<Decision, CheckError> {
        let mut direct = self.decide(request, use_cache).await?;

        if direct.allowed {
            if let Some(role) = direct.granted_via.clone() {
                if !direct.applied_rules.contains(&role) {
                    direct.applied_rules.push(role);
                }
            }
            return Ok(direct);
        }

        // An explicit deny is final: inheriting a grant cannot lift it.
        if direct.explicit_deny {
            return Ok(direct);
        }

        for role in self.roles(request.tenant_id, &request.subject, use_cache).await? {
            let mut via_role = self.decide(&request.as_subject(&role), use_cache).await?;
            if via_role.allowed {
                debug!(subject = %request.subject, role = %role, "granted through role");
                via_role.reason = format!("allowed via role {role}");
                via_role.applied_rules.push(role.clone());
                via_role.granted_via = Some(role);
                via_role.from_cache = false;
                return Ok(via_role);
            }
        }

        Ok(direct)
    }

    async fn roles(&self, tenant_id: TenantId, subject: &str, use_cache: bool) -> Result<Vec<String>, CheckError> {
        if use_cache {
            let who = subject.to_string();
            if let Some(roles) = self.off_thread(move |cache| cache.get_roles(tenant_id, &who)).await.flatten() {
                return Ok(roles);
            }
        }
        let (roles, valid_until) = self.registry.roles_until(tenant_id, subject).await?;
        if use_cache {
            let (who, stored) = (subject.to_string(), roles.clone());
            self.off_thread(move |cache| cache.set_roles_until(tenant_id, &who, &stored, valid_until))
                .await;
        }
        Ok(roles)
    }

    /// Run a cache call on the blocking pool so a stalled backend cannot hold
    /// the check past its deadline.
    async fn off_thread<T, F>(&self, call: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&DecisionCache) -> T + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || call(&cache)).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "cache task failed; treating as a miss");
                None
            }
        }
    }

    fn track_usage(&self, tenant_id: TenantId, ids: Vec<RuleId>) {
        let store = Arc::clone(&self.store);
        let at = self.clock.now();
        tokio::spawn(async move {
            if let Err(e) = store.record_usage(tenant_id, &ids, at).await {
                warn!(tenant_id = %tenant_id, error = %e, "usage tracking failed");
            }
        });
    }
}

fn decision_from(evaluation: Evaluation) -> Decision {
    let mut decision = if evaluation.allowed {
        Decision::allow(REASON_ALLOWED)
    } else if evaluation.explicit_deny {
        Decision::deny(REASON_DENIED)
    } else {
        Decision::deny(REASON_NO_MATCH)
    };
    decision.applied_rules = evaluation.matched_rules.iter().map(ToString::to_string).collect();
    decision.explicit_deny = evaluation.explicit_deny;
    decision.granted_via = evaluation.granted_via;
    decision
}
