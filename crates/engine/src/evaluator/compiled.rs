//! One tenant's compiled evaluator.
//!
//! Wraps a casbin [`Enforcer`] built from the embedded model and keeps, next to
//! it, which stored rules produced each casbin tuple. Several rules may compile
//! to the same tuple; the tuple leaves the enforcer only when the last of them
//! is removed, which makes add/remove idempotent per rule id.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use casbin::function_map::key_match2;
use casbin::{CoreApi, DefaultModel, Enforcer, MemoryAdapter, MgmtApi};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use halberd_core::{RuleId, TenantId};
use halberd_policy::{Effect, GroupingRelation, PolicyRule, RuleKind, gate, object_pattern_error};

use super::MODEL;
use crate::error::EvaluatorError;

/// Grouping relations the model defines.
pub const GROUPING_RELATIONS: [&str; 2] = ["g", "g2"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PermissionTuple {
    subject: String,
    service: String,
    object: String,
    action: String,
    effect: Effect,
}

impl PermissionTuple {
    fn to_policy(&self) -> Vec<String> {
        vec![
            self.subject.clone(),
            self.service.clone(),
            self.object.clone(),
            self.action.clone(),
            self.effect.as_str().to_string(),
        ]
    }

    fn matches(&self, subjects: &HashSet<String>, service: &str, objects: &HashSet<String>, object: &str, action: &str) -> bool {
        subjects.contains(&self.subject)
            && (self.service == service || self.service == "*")
            && (self.object == "*" || key_match2(object, &self.object) || objects.contains(&self.object))
            && (self.action == action || self.action == "*")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupingTuple {
    relation: String,
    member: String,
    group: String,
}

/// Outcome of one evaluation, with the rules that decided it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Evaluation {
    pub allowed: bool,
    pub explicit_deny: bool,
    /// Deny rules when denied by one, otherwise the matching allow rules.
    pub matched_rules: Vec<RuleId>,
    /// Role through which the allow matched, when not granted directly.
    pub granted_via: Option<String>,
    /// When the evaluator stops being exact (next temporal transition).
    pub valid_until: Option<DateTime<Utc>>,
}

/// A permission reachable by a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantedPermission {
    pub service: String,
    pub object: String,
    pub action: String,
    pub effect: Effect,
    /// `"direct"` or the role it is inherited from.
    pub source: String,
    pub rule_ids: Vec<RuleId>,
}

pub struct Evaluator {
    tenant_id: TenantId,
    enforcer: Enforcer,
    permissions: HashMap<PermissionTuple, BTreeSet<RuleId>>,
    groupings: HashMap<GroupingTuple, BTreeSet<RuleId>>,
    next_transition: Option<DateTime<Utc>>,
    built_at: DateTime<Utc>,
}

impl core::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Evaluator")
            .field("tenant_id", &self.tenant_id)
            .field("permissions", &self.permissions.len())
            .field("groupings", &self.groupings.len())
            .field("next_transition", &self.next_transition)
            .field("built_at", &self.built_at)
            .finish()
    }
}

pub(crate) async fn new_enforcer() -> Result<Enforcer, EvaluatorError> {
    let model = DefaultModel::from_str(MODEL)
        .await
        .map_err(|e| EvaluatorError::Model(e.to_string()))?;
    Enforcer::new(model, MemoryAdapter::default())
        .await
        .map_err(|e| EvaluatorError::Model(e.to_string()))
}

impl Evaluator {
    /// Compile `rules` (every stored rule of the tenant) as of `now`.
    ///
    /// Inactive rules are left out but still determine [`Self::next_transition`].
    /// Rules the evaluator cannot compile are skipped and logged.
    pub async fn build(tenant_id: TenantId, rules: &[PolicyRule], now: DateTime<Utc>) -> Result<Self, EvaluatorError> {
        let mut evaluator = Self {
            tenant_id,
            enforcer: new_enforcer().await?,
            permissions: HashMap::new(),
            groupings: HashMap::new(),
            next_transition: gate::next_transition(rules, now),
            built_at: now,
        };

        for rule in rules.iter().filter(|r| r.tenant_id == tenant_id && gate::is_active(r, now)) {
            if let Err(e) = evaluator.insert(rule).await {
                warn!(tenant_id = %tenant_id, rule_id = %rule.id, error = %e, "skipping rule");
            }
        }

        Ok(evaluator)
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn next_transition(&self) -> Option<DateTime<Utc>> {
        self.next_transition
    }

    /// Some rule's activity has flipped since the build.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.next_transition.is_some_and(|at| now >= at)
    }

    /// Account for a rule whose activity will flip later (e.g. one inserted
    /// before its `effective_from`).
    pub fn track_transitions(&mut self, rule: &PolicyRule, now: DateTime<Utc>) {
        if let Some(at) = gate::next_transition(std::slice::from_ref(rule), now) {
            self.next_transition = Some(self.next_transition.map_or(at, |current| current.min(at)));
        }
    }

    /// Number of distinct compiled tuples.
    pub fn len(&self) -> usize {
        self.permissions.len() + self.groupings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a rule. Returns `false` if this rule id was already compiled.
    pub async fn insert(&mut self, rule: &PolicyRule) -> Result<bool, EvaluatorError> {
        let invalid = |reason: String| EvaluatorError::InvalidRule { id: rule.id, reason };

        match rule.kind().map_err(|e| invalid(e.to_string()))? {
            RuleKind::Permission(p) => {
                if let Some(problem) = object_pattern_error(&p.object) {
                    return Err(invalid(problem));
                }
                let tuple = PermissionTuple {
                    subject: p.subject,
                    service: rule.service_name.clone(),
                    object: p.object,
                    action: p.action,
                    effect: p.effect,
                };
                if !self.permissions.contains_key(&tuple) {
                    self.enforcer
                        .add_policy(tuple.to_policy())
                        .await
                        .map_err(EvaluatorError::backend)?;
                }
                Ok(self.permissions.entry(tuple).or_default().insert(rule.id))
            }
            RuleKind::Grouping(g) => {
                let relation = g.relation.as_str().to_string();
                if !GROUPING_RELATIONS.contains(&relation.as_str()) {
                    return Err(invalid(format!("grouping relation \"{relation}\" is not defined")));
                }
                let tuple = GroupingTuple {
                    relation,
                    member: g.member,
                    group: g.group,
                };
                if !self.groupings.contains_key(&tuple) {
                    let pair = vec![tuple.member.clone(), tuple.group.clone()];
                    let added = match g.relation {
                        GroupingRelation::Role => self.enforcer.add_grouping_policy(pair).await,
                        GroupingRelation::Named(ref name) => {
                            self.enforcer.add_named_grouping_policy(name, pair).await
                        }
                    };
                    added.map_err(EvaluatorError::backend)?;
                }
                Ok(self.groupings.entry(tuple).or_default().insert(rule.id))
            }
        }
    }

    /// Remove a rule. Returns `false` if it was not compiled.
    pub async fn remove(&mut self, rule: &PolicyRule) -> Result<bool, EvaluatorError> {
        let Some(removed_tuple) = self.forget(rule) else {
            return Ok(false);
        };

        match removed_tuple {
            Removed::Still => {}
            Removed::Permission(tuple) => {
                self.enforcer
                    .remove_policy(tuple.to_policy())
                    .await
                    .map_err(EvaluatorError::backend)?;
            }
            Removed::Grouping(tuple) => {
                let pair = vec![tuple.member, tuple.group];
                let removed = if tuple.relation == "g" {
                    self.enforcer.remove_grouping_policy(pair).await
                } else {
                    self.enforcer.remove_named_grouping_policy(&tuple.relation, pair).await
                };
                removed.map_err(EvaluatorError::backend)?;
            }
        }
        Ok(true)
    }

    /// Drop `rule.id` from the tuple bookkeeping; report a tuple that lost its last rule.
    fn forget(&mut self, rule: &PolicyRule) -> Option<Removed> {
        let id = rule.id;
        if let Some(tuple) = self.permissions.iter().find(|(_, ids)| ids.contains(&id)).map(|(t, _)| t.clone()) {
            let ids = self.permissions.get_mut(&tuple)?;
            ids.remove(&id);
            if ids.is_empty() {
                self.permissions.remove(&tuple);
                return Some(Removed::Permission(tuple));
            }
            return Some(Removed::Still);
        }

        if let Some(tuple) = self.groupings.iter().find(|(_, ids)| ids.contains(&id)).map(|(t, _)| t.clone()) {
            let ids = self.groupings.get_mut(&tuple)?;
            ids.remove(&id);
            if ids.is_empty() {
                self.groupings.remove(&tuple);
                return Some(Removed::Grouping(tuple));
            }
            return Some(Removed::Still);
        }

        None
    }

    pub fn contains(&self, id: RuleId) -> bool {
        self.permissions.values().any(|ids| ids.contains(&id))
            || self.groupings.values().any(|ids| ids.contains(&id))
    }

    /// Deny-overrides decision for one request.
    ///
    /// The decision follows the full role hierarchy, however deep. casbin's
    /// role manager stops at a fixed depth, so its verdict is only compared
    /// and logged.
    pub fn enforce(&self, subject: &str, service: &str, object: &str, action: &str) -> Result<Evaluation, EvaluatorError> {
        let mut subjects: HashSet<String> = self.closure("g", subject).into_iter().collect();
        subjects.insert(subject.to_string());
        let objects: HashSet<String> = self.closure("g2", object).into_iter().collect();

        let mut denies = BTreeSet::new();
        let mut allows = BTreeSet::new();
        let mut direct = false;
        let mut granted_via = None;
        for (tuple, ids) in &self.permissions {
            if !tuple.matches(&subjects, service, &objects, object, action) {
                continue;
            }
            match tuple.effect {
                Effect::Deny => denies.extend(ids.iter().copied()),
                Effect::Allow => {
                    allows.extend(ids.iter().copied());
                    if tuple.subject == subject {
                        direct = true;
                    } else if granted_via.as_ref().is_none_or(|r: &String| tuple.subject < *r) {
                        granted_via = Some(tuple.subject.clone());
                    }
                }
            }
        }

        let explicit_deny = !denies.is_empty();
        let allowed = !allows.is_empty() && !explicit_deny;

        let enforced = self
            .enforcer
            .enforce((subject, service, object, action))
            .map_err(EvaluatorError::backend)?;
        if enforced != allowed {
            debug!(
                tenant_id = %self.tenant_id,
                subject = %subject,
                allowed,
                enforced,
                "enforcer verdict differs from the full hierarchy walk"
            );
        }

        let valid_until = self.next_transition;
        if allowed {
            // A direct grant takes precedence over naming a role.
            Ok(Evaluation {
                allowed,
                explicit_deny: false,
                matched_rules: allows.into_iter().collect(),
                granted_via: if direct { None } else { granted_via },
                valid_until,
            })
        } else {
            Ok(Evaluation {
                allowed,
                explicit_deny,
                matched_rules: denies.into_iter().collect(),
                granted_via: None,
                valid_until,
            })
        }
    }

    /// Transitive groups of `member` in `relation`, sorted, excluding `member`.
    fn closure(&self, relation: &str, member: &str) -> Vec<String> {
        self.walk(relation, member, |t| (&t.member, &t.group))
    }

    /// Transitive members of `group` in `relation`, sorted, excluding `group`.
    fn reverse_closure(&self, relation: &str, group: &str) -> Vec<String> {
        self.walk(relation, group, |t| (&t.group, &t.member))
    }

    fn walk<'a>(&'a self, relation: &str, start: &str, edge: impl Fn(&'a GroupingTuple) -> (&'a String, &'a String)) -> Vec<String> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(current) = queue.pop_front() {
            for tuple in self.groupings.keys().filter(|t| t.relation == relation) {
                let (from, to) = edge(tuple);
                if *from == current && to != start && seen.insert(to.clone()) {
                    queue.push_back(to.clone());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Transitive role set of `subject`.
    pub fn roles_for(&self, subject: &str) -> Vec<String> {
        self.closure("g", subject)
    }

    /// Subjects inheriting from `subject`, directly or transitively.
    pub fn dependents_of(&self, subject: &str) -> Vec<String> {
        self.reverse_closure("g", subject)
    }

    /// Permissions granted to `subject` directly and, optionally, through roles.
    pub fn permissions_for(&self, subject: &str, service: Option<&str>, include_inherited: bool) -> Vec<GrantedPermission> {
        let mut sources = vec![(subject.to_string(), "direct".to_string())];
        if include_inherited {
            sources.extend(self.roles_for(subject).into_iter().map(|role| (role.clone(), role)));
        }

        let mut granted: Vec<GrantedPermission> = Vec::new();
        for (holder, source) in sources {
            for (tuple, ids) in &self.permissions {
                if tuple.subject != holder {
                    continue;
                }
                if service.is_some_and(|s| tuple.service != s && tuple.service != "*") {
                    continue;
                }
                granted.push(GrantedPermission {
                    service: tuple.service.clone(),
                    object: tuple.object.clone(),
                    action: tuple.action.clone(),
                    effect: tuple.effect,
                    source: source.clone(),
                    rule_ids: ids.iter().copied().collect(),
                });
            }
        }

        granted.sort_by(|a, b| {
            (a.source != "direct", &a.source, &a.service, &a.object, &a.action)
                .cmp(&(b.source != "direct", &b.source, &b.service, &b.object, &b.action))
        });
        granted
    }
}

enum Removed {
    /// Other rules still produce the tuple.
    Still,
    Permission(PermissionTuple),
    Grouping(GroupingTuple),
}
