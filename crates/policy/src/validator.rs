//! Rule validation and conflict detection.
//!
//! Validation never fails with an error: problems are collected into a
//! [`ValidationReport`]. Conflicts are advisory and do not make a rule invalid.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use halberd_core::RuleId;

use crate::gate;
use crate::rule::{ApprovalStatus, PolicyRule, RuleKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub conflicting_rule_ids: Vec<RuleId>,
}

impl ValidationReport {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicting_rule_ids.is_empty()
    }
}

/// Structural/semantic checks for policy rules.
#[derive(Debug, Clone)]
pub struct RuleValidator {
    grouping_relations: BTreeSet<String>,
}

impl Default for RuleValidator {
    fn default() -> Self {
        Self::new(["g", "g2"])
    }
}

impl RuleValidator {
    /// `grouping_relations` lists the grouping `ptype`s the evaluator model defines.
    pub fn new<I, T>(grouping_relations: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            grouping_relations: grouping_relations.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate `rule`.
    ///
    /// When `existing` is `Some`, the rule is also checked for conflicts against
    /// those rules. Only rules active at `now` in the same tenant and service can
    /// conflict, and the rule never conflicts with its own stored version.
    pub fn validate(
        &self,
        rule: &PolicyRule,
        existing: Option<&[PolicyRule]>,
        now: DateTime<Utc>,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        if rule.service_name.trim().is_empty() {
            report.errors.push("service scope must not be empty".to_string());
        }

        // Effect is checked on the raw field so a bad value is reported as such
        // rather than as an unparseable rule.
        let is_permission = matches!(rule.ptype.as_str(), "p" | "permission");
        let effect_invalid =
            is_permission && !rule.v3.is_empty() && rule.v3 != "allow" && rule.v3 != "deny";
        if effect_invalid {
            report
                .errors
                .push(format!("effect must be \"allow\" or \"deny\", got \"{}\"", rule.v3));
        }

        let kind = if effect_invalid {
            None
        } else {
            match rule.kind() {
                Ok(kind) => Some(kind),
                Err(_) => {
                    report.errors.push(format!("unknown rule kind \"{}\"", rule.ptype));
                    None
                }
            }
        };

        match &kind {
            Some(RuleKind::Permission(p)) => {
                for (field, value) in [("subject", &p.subject), ("object", &p.object), ("action", &p.action)] {
                    if value.trim().is_empty() {
                        report.errors.push(format!("permission {field} must not be empty"));
                    }
                }
                if let Some(problem) = object_pattern_error(&p.object) {
                    report.errors.push(problem);
                }
            }
            Some(RuleKind::Grouping(g)) => {
                if !self.grouping_relations.contains(g.relation.as_str()) {
                    report
                        .errors
                        .push(format!("grouping relation \"{}\" is not defined", g.relation.as_str()));
                }
                if g.member.trim().is_empty() || g.group.trim().is_empty() {
                    report.errors.push("grouping member and group must not be empty".to_string());
                } else if g.member == g.group {
                    report.errors.push("a subject cannot be a member of itself".to_string());
                }
            }
            None => {}
        }

        if let (Some(from), Some(to)) = (rule.effective_from, rule.effective_to) {
            if from >= to {
                report
                    .errors
                    .push("effective_from must be earlier than effective_to".to_string());
            }
        }

        if rule.approval_status == ApprovalStatus::Approved && rule.approved_by.is_none() {
            report.warnings.push("rule is approved but has no approver".to_string());
        }

        if rule.effective_to.is_some_and(|to| to < now) {
            report.warnings.push("rule is already expired".to_string());
        }

        if rule.is_temporary && rule.effective_to.is_none() {
            report
                .warnings
                .push("temporary rule has no effective_to and will never expire".to_string());
        }

        if let (Some(kind), Some(existing)) = (&kind, existing) {
            self.detect_conflicts(rule, kind, existing, now, &mut report);
        }

        report.valid = report.errors.is_empty();
        report
    }

    fn detect_conflicts(
        &self,
        rule: &PolicyRule,
        kind: &RuleKind,
        existing: &[PolicyRule],
        now: DateTime<Utc>,
        report: &mut ValidationReport,
    ) {
        for other in existing {
            if rule.id.is_assigned() && other.id == rule.id {
                continue;
            }
            if other.tenant_id != rule.tenant_id || other.service_name != rule.service_name {
                continue;
            }
            if !gate::is_active(other, now) {
                continue;
            }
            let Ok(other_kind) = other.kind() else {
                continue;
            };

            let message = match (kind, &other_kind) {
                (RuleKind::Permission(mine), RuleKind::Permission(theirs))
                    if mine.subject == theirs.subject
                        && mine.object == theirs.object
                        && mine.action == theirs.action =>
                {
                    if mine.effect == theirs.effect {
                        format!("duplicates rule {}", other.id)
                    } else {
                        format!(
                            "conflicts with rule {} ({} vs {})",
                            other.id, mine.effect, theirs.effect
                        )
                    }
                }
                (RuleKind::Grouping(mine), RuleKind::Grouping(theirs)) if mine == theirs => {
                    format!("duplicates rule {}", other.id)
                }
                _ => continue,
            };

            report.warnings.push(message);
            report.conflicting_rule_ids.push(other.id);
        }
    }
}

/// Object patterns are paths with `*` wildcards (`/docs/*`, `*`) and `:name`
/// segment parameters. Anything else the matcher would have to treat as a
/// regular expression is rejected.
pub fn object_pattern_error(pattern: &str) -> Option<String> {
    const RESERVED: &[char] = &['[', ']', '(', ')', '{', '}', '\\', '^', '$', '|', '+', '?'];

    if let Some(c) = pattern.chars().find(|c| RESERVED.contains(c)) {
        return Some(format!("object pattern \"{pattern}\" contains unsupported character '{c}'"));
    }
    if pattern.contains("**") {
        return Some(format!("object pattern \"{pattern}\" contains \"**\""));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use halberd_core::TenantId;

    use crate::rule::{Effect, RuleStatus};

    fn tenant() -> TenantId {
        TenantId::new(7)
    }

    fn editor_write(effect: Effect) -> PolicyRule {
        PolicyRule::permission(tenant(), "cms", "editor", "/docs/*", "write", effect)
    }

    #[test]
    fn well_formed_permission_is_valid() {
        let report = RuleValidator::default().validate(&editor_write(Effect::Allow), None, Utc::now());
        assert!(report.valid, "{report:?}");
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn unknown_kind_and_empty_service_are_errors() {
        let mut rule = editor_write(Effect::Allow);
        rule.ptype = "x".into();
        rule.service_name = "  ".into();

        let report = RuleValidator::default().validate(&rule, None, Utc::now());
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn effect_must_be_exact() {
        let mut rule = editor_write(Effect::Allow);
        rule.v3 = "ALLOW".into();

        let report = RuleValidator::default().validate(&rule, None, Utc::now());
        assert!(!report.valid);
        assert!(report.errors[0].contains("ALLOW"));
    }

    #[test]
    fn object_patterns_are_restricted() {
        let mut rule = editor_write(Effect::Allow);
        rule.v1 = "/docs/[a-z]+".into();
        assert!(!RuleValidator::default().validate(&rule, None, Utc::now()).valid);

        rule.v1 = "/docs/:id/comments/*".into();
        assert!(RuleValidator::default().validate(&rule, None, Utc::now()).valid);
        assert!(object_pattern_error("*").is_none());
        assert!(object_pattern_error("/a/**").is_some());
    }

    #[test]
    fn temporal_bounds_must_be_ordered() {
        let now = Utc::now();
        let rule = editor_write(Effect::Allow).effective_between(Some(now + Duration::hours(2)), Some(now + Duration::hours(1)));

        let report = RuleValidator::default().validate(&rule, None, now);
        assert!(!report.valid);
    }

    #[test]
    fn approved_without_approver_is_a_warning() {
        let mut rule = editor_write(Effect::Allow).requiring_approval();
        rule.approval_status = ApprovalStatus::Approved;

        let report = RuleValidator::default().validate(&rule, None, Utc::now());
        assert!(report.valid);
        assert_eq!(report.warnings, vec!["rule is approved but has no approver".to_string()]);
    }

    #[test]
    fn undefined_grouping_relation_is_an_error() {
        let rule = PolicyRule::named_grouping(tenant(), "cms", "g5", "alice", "editor");
        let report = RuleValidator::default().validate(&rule, None, Utc::now());
        assert!(!report.valid);

        let self_member = PolicyRule::grouping(tenant(), "cms", "alice", "alice");
        assert!(!RuleValidator::default().validate(&self_member, None, Utc::now()).valid);
    }

    #[test]
    fn opposite_effect_and_duplicates_conflict() {
        let now = Utc::now();
        let existing = vec![
            editor_write(Effect::Deny).with_id(RuleId::new(1)),
            editor_write(Effect::Allow).with_id(RuleId::new(2)),
            // Different action: no conflict.
            PolicyRule::permission(tenant(), "cms", "editor", "/docs/*", "read", Effect::Deny).with_id(RuleId::new(3)),
            // Inactive rules cannot conflict.
            editor_write(Effect::Deny).with_id(RuleId::new(4)).with_status(RuleStatus::Disabled),
            // Other service.
            PolicyRule::permission(tenant(), "billing", "editor", "/docs/*", "write", Effect::Deny).with_id(RuleId::new(5)),
        ];

        let report = RuleValidator::default().validate(&editor_write(Effect::Allow), Some(&existing), now);
        assert!(report.valid, "conflicts are advisory");
        assert_eq!(report.conflicting_rule_ids, vec![RuleId::new(1), RuleId::new(2)]);
    }

    #[test]
    fn rule_does_not_conflict_with_itself_on_update() {
        let stored = editor_write(Effect::Allow).with_id(RuleId::new(9));
        let report = RuleValidator::default().validate(&stored, Some(std::slice::from_ref(&stored)), Utc::now());
        assert!(!report.has_conflicts());
    }
}
