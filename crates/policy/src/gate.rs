//! Approval & temporal gate.
//!
//! A rule is *active* (eligible for the evaluator and for conflict detection)
//! iff it is enabled, approved when approval is required, and `now` lies in
//! `[effective_from, effective_to]` (a missing bound is unbounded).

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::rule::{ApprovalStatus, PolicyRule, RuleStatus};

/// Why a stored rule is currently excluded from evaluation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactiveReason {
    Disabled,
    AwaitingApproval,
    Rejected,
    NotYetEffective,
    Expired,
}

pub fn inactive_reason(rule: &PolicyRule, now: DateTime<Utc>) -> Option<InactiveReason> {
    if rule.status == RuleStatus::Disabled {
        return Some(InactiveReason::Disabled);
    }

    if rule.require_approval {
        match rule.approval_status {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Pending => return Some(InactiveReason::AwaitingApproval),
            ApprovalStatus::Rejected => return Some(InactiveReason::Rejected),
        }
    }

    if let Some(from) = rule.effective_from {
        if now < from {
            return Some(InactiveReason::NotYetEffective);
        }
    }

    if let Some(to) = rule.effective_to {
        if now > to {
            return Some(InactiveReason::Expired);
        }
    }

    None
}

pub fn is_active(rule: &PolicyRule, now: DateTime<Utc>) -> bool {
    inactive_reason(rule, now).is_none()
}

/// Keep only the rules that are active at `now`, preserving order.
pub fn filter_active(rules: Vec<PolicyRule>, now: DateTime<Utc>) -> Vec<PolicyRule> {
    rules.into_iter().filter(|r| is_active(r, now)).collect()
}

/// Split out temporary rules whose window has closed.
///
/// Returns `(expired_temporary, rest)`.
pub fn partition_expired(
    rules: Vec<PolicyRule>,
    now: DateTime<Utc>,
) -> (Vec<PolicyRule>, Vec<PolicyRule>) {
    rules.into_iter().partition(|r| {
        r.is_temporary
            && r.status == RuleStatus::Enabled
            && r.effective_to.is_some_and(|to| now > to)
    })
}

/// Earliest instant after `now` at which any rule's activity flips.
///
/// An evaluator built at `now` from `rules` is exact until this instant.
/// Disabled and unapproved rules never flip on their own (a write must happen
/// first), so they do not contribute.
pub fn next_transition(rules: &[PolicyRule], now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    rules
        .iter()
        .filter(|r| r.status == RuleStatus::Enabled)
        .filter(|r| !r.require_approval || r.approval_status == ApprovalStatus::Approved)
        .flat_map(|r| {
            let activation = r.effective_from.filter(|from| *from > now);
            // The window is inclusive, so the rule turns off just after `to`.
            let deactivation = r
                .effective_to
                .map(|to| to + Duration::nanoseconds(1))
                .filter(|off| *off > now);
            [activation, deactivation]
        })
        .flatten()
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use halberd_core::TenantId;
    use proptest::prelude::*;

    use crate::rule::Effect;

    fn rule() -> PolicyRule {
        PolicyRule::permission(TenantId::new(7), "cms", "editor", "/docs/*", "write", Effect::Allow)
    }

    #[test]
    fn enabled_unbounded_rule_is_active() {
        assert!(is_active(&rule(), Utc::now()));
    }

    #[test]
    fn disabled_rule_is_inactive() {
        let r = rule().with_status(RuleStatus::Disabled);
        assert_eq!(inactive_reason(&r, Utc::now()), Some(InactiveReason::Disabled));
    }

    #[test]
    fn approval_gates_activation() {
        let now = Utc::now();
        let mut r = rule().requiring_approval();
        assert_eq!(inactive_reason(&r, now), Some(InactiveReason::AwaitingApproval));

        r.reject("root", now);
        assert_eq!(inactive_reason(&r, now), Some(InactiveReason::Rejected));

        r.approve("root", now);
        assert!(is_active(&r, now));
    }

    #[test]
    fn approval_status_is_ignored_when_not_required() {
        let mut r = rule();
        r.approval_status = ApprovalStatus::Rejected;
        assert!(is_active(&r, Utc::now()));
    }

    #[test]
    fn temporal_window_is_inclusive() {
        let now = Utc::now();
        let from = now + Duration::hours(1);
        let to = now + Duration::hours(2);
        let r = rule().effective_between(Some(from), Some(to));

        assert_eq!(inactive_reason(&r, now), Some(InactiveReason::NotYetEffective));
        assert!(is_active(&r, from));
        assert!(is_active(&r, to));
        assert_eq!(
            inactive_reason(&r, to + Duration::seconds(1)),
            Some(InactiveReason::Expired)
        );
    }

    #[test]
    fn partition_picks_only_lapsed_temporary_rules() {
        let now = Utc::now();
        let lapsed = rule().temporary_until(now - Duration::minutes(1));
        let running = rule().temporary_until(now + Duration::minutes(1));
        let permanent_expired = rule().effective_between(None, Some(now - Duration::minutes(1)));

        let (expired, rest) = partition_expired(vec![lapsed.clone(), running, permanent_expired], now);
        assert_eq!(expired, vec![lapsed]);
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn next_transition_is_earliest_future_bound() {
        let now = Utc::now();
        let soon = now + Duration::minutes(5);
        let later = now + Duration::minutes(30);
        let rules = vec![
            rule().effective_between(Some(later), None),
            rule().effective_between(None, Some(soon)),
            rule().effective_between(Some(now - Duration::minutes(1)), None),
            // Pending approval never flips by itself.
            rule().requiring_approval().effective_between(Some(now + Duration::minutes(1)), None),
        ];

        assert_eq!(next_transition(&rules, now), Some(soon + Duration::nanoseconds(1)));
        assert_eq!(next_transition(&[rule()], now), None);
    }

    proptest! {
        /// Property: with both bounds set, activity is exactly `from <= now <= to`.
        #[test]
        fn window_membership(from_offset in -1000i64..1000, len in 0i64..1000, at in -2000i64..2000) {
            let base = Utc::now();
            let from = base + Duration::seconds(from_offset);
            let to = from + Duration::seconds(len);
            let now = base + Duration::seconds(at);

            let r = rule().effective_between(Some(from), Some(to));
            prop_assert_eq!(is_active(&r, now), from <= now && now <= to);
        }
    }
}
