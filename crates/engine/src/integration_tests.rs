//! End-to-end scenarios through `PolicyService`.
//!
//! Rule store → evaluator registry → checker → decision cache, with the
//! in-memory store, cache and change bus.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use halberd_core::{Clock, ManualClock, RuleId, TenantId};
use halberd_infra::{InMemoryCacheStore, InMemoryChangeBus, InMemoryRuleStore, RuleFilter, RuleStore};
use halberd_policy::{Effect, PolicyRule, RuleStatus};

use crate::checker::REASON_SUPERADMIN;
use crate::config::EngineConfig;
use crate::context::{PrincipalContext, TenantContext};
use crate::service::{CheckPermissionRequest, PolicyService};

const T: TenantId = TenantId::new(7);

struct Harness {
    store: Arc<InMemoryRuleStore>,
    clock: Arc<ManualClock>,
    service: PolicyService,
}

async fn harness() -> Harness {
    halberd_observability::init();
    let store = InMemoryRuleStore::arc();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let service = node(store.clone(), Arc::new(InMemoryChangeBus::new()), clock.clone()).await;
    Harness { store, clock, service }
}

async fn node(store: Arc<InMemoryRuleStore>, bus: Arc<InMemoryChangeBus>, clock: Arc<ManualClock>) -> PolicyService {
    PolicyService::new(
        store,
        Arc::new(InMemoryCacheStore::new()),
        bus,
        clock,
        EngineConfig::default(),
    )
    .await
    .unwrap()
}

fn tenant() -> TenantContext {
    TenantContext::new(T)
}

fn caller() -> PrincipalContext {
    PrincipalContext::new("svc-gateway", vec!["service".to_string()])
}

fn write_docs(subject: &str) -> CheckPermissionRequest {
    CheckPermissionRequest::new("cms", subject, "/docs/1", "write")
}

fn editor_write(effect: Effect) -> PolicyRule {
    PolicyRule::permission(T, "cms", "editor", "/docs/*", "write", effect)
}

#[tokio::test]
async fn approved_rule_allows_until_deleted() {
    let h = harness().await;
    let rule = h
        .service
        .create_rule(&tenant(), editor_write(Effect::Allow).requiring_approval())
        .await
        .unwrap();

    // Pending approval: inert.
    let pending = h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await;
    assert!(!pending.allowed);

    let approver = PrincipalContext::new("security-lead", vec!["admin".to_string()]);
    let approved = h.service.approve_rule(&tenant(), rule.id, &approver).await.unwrap();
    assert_eq!(approved.approved_by.as_deref(), Some("security-lead"));

    let allowed = h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await;
    assert!(allowed.allowed);
    assert!(!allowed.from_cache);
    assert_eq!(allowed.applied_rules, vec![rule.id.to_string()]);

    h.service.delete_rules(&tenant(), &[rule.id]).await.unwrap();
    let denied = h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await;
    assert!(!denied.allowed);
    assert!(!denied.from_cache);
}

#[tokio::test]
async fn rejected_rule_stays_inert() {
    let h = harness().await;
    let rule = h
        .service
        .create_rule(&tenant(), editor_write(Effect::Allow).requiring_approval())
        .await
        .unwrap();

    let reviewer = PrincipalContext::new("security-lead", vec![]);
    h.service.reject_rule(&tenant(), rule.id, &reviewer).await.unwrap();

    assert!(!h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);
}

#[tokio::test]
async fn role_expanded_check_names_the_granting_role() {
    let h = harness().await;
    h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();
    h.service
        .create_rule(&tenant(), PolicyRule::grouping(T, "cms", "alice", "editor"))
        .await
        .unwrap();

    let response = h
        .service
        .check_permission(&tenant(), &caller(), write_docs("alice").with_role_expansion())
        .await;
    assert!(response.allowed);
    assert!(response.applied_rules.contains(&"editor".to_string()));
}

#[tokio::test]
async fn cache_stays_coherent_across_writes() {
    let h = harness().await;
    h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();

    let first = h.service.check_permission(&tenant(), &caller(), write_docs("alice")).await;
    let second = h.service.check_permission(&tenant(), &caller(), write_docs("alice")).await;
    assert!(!first.allowed && !first.from_cache);
    assert!(!second.allowed && second.from_cache);

    // A grouping for alice must invalidate her cached deny.
    let membership = h
        .service
        .create_rule(&tenant(), PolicyRule::grouping(T, "cms", "alice", "editor"))
        .await
        .unwrap();
    let after_grant = h.service.check_permission(&tenant(), &caller(), write_docs("alice")).await;
    assert!(after_grant.allowed);
    assert!(!after_grant.from_cache);
    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("alice")).await.from_cache);

    // Revoking the role's permission reaches members through the dependents walk.
    let extra = h
        .service
        .create_rule(&tenant(), PolicyRule::permission(T, "cms", "editor", "/docs/*", "write", Effect::Deny))
        .await
        .unwrap();
    let after_deny = h.service.check_permission(&tenant(), &caller(), write_docs("alice")).await;
    assert!(!after_deny.allowed);
    assert!(!after_deny.from_cache);

    h.service.delete_rules(&tenant(), &[extra.id, membership.id]).await.unwrap();
    let after_revoke = h.service.check_permission(&tenant(), &caller(), write_docs("alice")).await;
    assert!(!after_revoke.allowed);
    assert!(!after_revoke.from_cache);
}

#[tokio::test]
async fn explicit_deny_blocks_inherited_grant() {
    let h = harness().await;
    h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();
    h.service
        .create_rule(&tenant(), PolicyRule::grouping(T, "cms", "alice", "editor"))
        .await
        .unwrap();
    h.service
        .create_rule(&tenant(), PolicyRule::permission(T, "cms", "alice", "/docs/*", "write", Effect::Deny))
        .await
        .unwrap();

    let response = h
        .service
        .check_permission(&tenant(), &caller(), write_docs("alice").with_role_expansion())
        .await;
    assert!(!response.allowed);
}

#[tokio::test]
async fn superadmin_bypasses_explicit_deny() {
    let h = harness().await;
    h.service.create_rule(&tenant(), editor_write(Effect::Deny)).await.unwrap();

    let root = PrincipalContext::new("root", vec!["superadmin".to_string()]);
    let response = h.service.check_permission(&tenant(), &root, write_docs("editor")).await;
    assert!(response.allowed);
    assert_eq!(response.reason, REASON_SUPERADMIN);

    assert!(!h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);
}

#[tokio::test]
async fn future_rule_activates_when_its_window_opens() {
    let h = harness().await;
    let start = h.clock.now();
    h.service
        .create_rule(
            &tenant(),
            editor_write(Effect::Allow).effective_between(Some(start + Duration::hours(1)), None),
        )
        .await
        .unwrap();

    assert!(!h.service.check_permission(&tenant(), &caller(), write_docs("editor").uncached()).await.allowed);

    h.clock.advance(Duration::hours(2));
    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor").uncached()).await.allowed);
}

#[tokio::test]
async fn temporary_rule_lapses_and_is_swept() {
    let h = harness().await;
    let start = h.clock.now();
    let temporary = h
        .service
        .create_rule(&tenant(), editor_write(Effect::Allow).temporary_until(start + Duration::hours(1)))
        .await
        .unwrap();

    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor").uncached()).await.allowed);

    h.clock.advance(Duration::hours(2));
    assert!(!h.service.check_permission(&tenant(), &caller(), write_docs("editor").uncached()).await.allowed);

    let report = h.service.expire_temporary().await.unwrap();
    assert_eq!(report.expired_rule_ids, vec![temporary.id]);
    assert_eq!(report.tenants, vec![T]);

    let stored = h.store.get(T, temporary.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RuleStatus::Disabled);
    assert!(h.service.expire_temporary().await.unwrap().expired_rule_ids.is_empty());
}

#[tokio::test]
async fn cached_allow_ends_with_the_rule_window() {
    let h = harness().await;
    let start = h.clock.now();
    h.service
        .create_rule(
            &tenant(),
            editor_write(Effect::Allow).effective_between(None, Some(start + Duration::minutes(1))),
        )
        .await
        .unwrap();

    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);
    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.from_cache);

    h.clock.advance(Duration::minutes(2));
    let after = h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await;
    assert!(!after.allowed);
    assert!(!after.from_cache);
}

#[tokio::test]
async fn cached_deny_ends_when_a_rule_activates() {
    let h = harness().await;
    let start = h.clock.now();
    h.service
        .create_rule(
            &tenant(),
            editor_write(Effect::Allow).effective_between(Some(start + Duration::minutes(1)), None),
        )
        .await
        .unwrap();

    assert!(!h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);
    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.from_cache);

    h.clock.advance(Duration::minutes(2));
    let after = h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await;
    assert!(after.allowed);
    assert!(!after.from_cache);
}

#[tokio::test]
async fn colon_in_names_never_shares_a_cache_slot() {
    let h = harness().await;
    h.service
        .create_rule(&tenant(), PolicyRule::permission(T, "cms", "a", "b:c", "read", Effect::Allow))
        .await
        .unwrap();

    let owner = CheckPermissionRequest::new("cms", "a", "b:c", "read");
    assert!(h.service.check_permission(&tenant(), &caller(), owner).await.allowed);

    let other = CheckPermissionRequest::new("cms", "a:b", "c", "read");
    let response = h.service.check_permission(&tenant(), &caller(), other).await;
    assert!(!response.allowed);
    assert!(!response.from_cache);
}

#[tokio::test]
async fn failed_delete_still_invalidates_what_it_removed() {
    let h = harness().await;
    let own = h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();
    let other = TenantContext::new(TenantId::new(8));
    let foreign = h
        .service
        .create_rule(&other, PolicyRule::permission(TenantId::new(8), "cms", "editor", "/docs/*", "write", Effect::Allow))
        .await
        .unwrap();

    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);
    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.from_cache);

    assert!(h.service.delete_rules(&tenant(), &[own.id, foreign.id]).await.is_err());
    assert!(h.store.get(T, own.id).await.unwrap().is_none());

    let after = h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await;
    assert!(!after.allowed);
    assert!(!after.from_cache);
}

#[tokio::test]
async fn writes_are_idempotent_at_the_evaluator() {
    let h = harness().await;
    let a = h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();
    let b = h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();

    // Same tuple from two rules: removing one keeps the grant.
    h.service.delete_rules(&tenant(), &[a.id]).await.unwrap();
    assert!(h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);

    assert!(h.service.delete_rules(&tenant(), &[a.id]).await.unwrap().is_empty());
    assert_eq!(h.service.delete_rules(&tenant(), &[b.id]).await.unwrap(), vec![b.id]);
    assert!(!h.service.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);
}

#[tokio::test]
async fn tenants_never_see_each_other() {
    let h = harness().await;
    h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();

    let other = TenantContext::new(TenantId::new(8));
    assert!(!h.service.check_permission(&other, &caller(), write_docs("editor")).await.allowed);

    let foreign_ids: Vec<RuleId> = h.store.find(&RuleFilter::tenant(T)).await.unwrap().iter().map(|r| r.id).collect();
    assert!(h.service.delete_rules(&other, &foreign_ids).await.is_err());
}

#[tokio::test]
async fn usage_is_tracked_on_allow() {
    let h = harness().await;
    let rule = h.service.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();
    h.service.check_permission(&tenant(), &caller(), write_docs("editor").uncached()).await;

    let mut usage = 0;
    for _ in 0..100 {
        usage = h.store.get(T, rule.id).await.unwrap().unwrap().usage_count;
        if usage > 0 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert_eq!(usage, 1);
}

#[tokio::test]
async fn writes_on_one_instance_reach_another() {
    let store = InMemoryRuleStore::arc();
    let bus = Arc::new(InMemoryChangeBus::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let writer = node(store.clone(), bus.clone(), clock.clone()).await;
    let reader = node(store, bus, clock).await;
    reader.listen().await;

    // Reader holds a compiled evaluator and a cached deny.
    assert!(!reader.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed);
    assert!(reader.check_permission(&tenant(), &caller(), write_docs("editor")).await.from_cache);

    writer.create_rule(&tenant(), editor_write(Effect::Allow)).await.unwrap();

    let mut allowed = false;
    for _ in 0..100 {
        allowed = reader.check_permission(&tenant(), &caller(), write_docs("editor")).await.allowed;
        if allowed {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    assert!(allowed);

    reader.shutdown().await;
}
