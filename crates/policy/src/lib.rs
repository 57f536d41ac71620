//! `halberd-policy`: the policy rule model and the pure checks applied to it.
//!
//! No IO: the approval/temporal gate and the validator operate on rules handed
//! to them by the caller.

pub mod gate;
pub mod rule;
pub mod validator;

pub use gate::{InactiveReason, filter_active, inactive_reason, is_active, next_transition, partition_expired};
pub use rule::{
    ApprovalStatus, Effect, GroupingRelation, GroupingRule, PermissionRule, PolicyRule, RuleKind,
    RuleStatus,
};
pub use validator::{RuleValidator, ValidationReport, object_pattern_error};
