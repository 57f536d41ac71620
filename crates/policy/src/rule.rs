//! Stored policy rule and its typed interpretation.
//!
//! A [`PolicyRule`] mirrors the persisted row: a `ptype` plus positional fields
//! `v0..v5`. Everything downstream of the store works with [`RuleKind`], the
//! typed reading of those fields, so the string-keyed `ptype` dispatch happens
//! in exactly one place ([`PolicyRule::kind`]).

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use halberd_core::{DomainError, RuleId, TenantId};

/// Permission effect.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl FromStr for Effect {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(DomainError::validation(format!(
                "effect must be \"allow\" or \"deny\", got \"{other}\""
            ))),
        }
    }
}

impl core::fmt::Display for Effect {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Enabled,
    Disabled,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl FromStr for RuleStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            other => Err(DomainError::validation(format!("unknown rule status \"{other}\""))),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(DomainError::validation(format!("unknown approval status \"{other}\""))),
        }
    }
}

/// Which grouping relation a grouping rule belongs to.
///
/// `g` is the subject → role hierarchy. `g2` groups objects (resource groups).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupingRelation {
    Role,
    Named(String),
}

impl GroupingRelation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Role => "g",
            Self::Named(name) => name,
        }
    }

    fn parse(ptype: &str) -> Option<Self> {
        match ptype {
            "g" | "grouping" => Some(Self::Role),
            other => {
                let suffix = other.strip_prefix('g')?;
                if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                    Some(Self::Named(other.to_string()))
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionRule {
    pub subject: String,
    pub object: String,
    pub action: String,
    pub effect: Effect,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupingRule {
    pub relation: GroupingRelation,
    pub member: String,
    pub group: String,
}

/// Typed interpretation of a rule's `ptype` and positional fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Permission(PermissionRule),
    Grouping(GroupingRule),
}

impl RuleKind {
    /// Subjects whose decisions change when this rule changes.
    ///
    /// For a grouping rule that is the member: its inherited rights move.
    pub fn affected_subject(&self) -> &str {
        match self {
            Self::Permission(p) => &p.subject,
            Self::Grouping(g) => &g.member,
        }
    }
}

/// A tenant-scoped authorization fact as persisted in the rule store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub service_name: String,

    pub ptype: String,
    pub v0: String,
    pub v1: String,
    pub v2: String,
    pub v3: String,
    pub v4: String,
    pub v5: String,

    pub status: RuleStatus,
    pub category: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub usage_count: u64,
    pub last_used_at: Option<DateTime<Utc>>,

    pub require_approval: bool,
    pub approval_status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,

    pub effective_from: Option<DateTime<Utc>>,
    pub effective_to: Option<DateTime<Utc>>,
    pub is_temporary: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyRule {
    fn blank(tenant_id: TenantId, service_name: impl Into<String>, ptype: &str) -> Self {
        let now = Utc::now();
        Self {
            id: RuleId::UNASSIGNED,
            tenant_id,
            service_name: service_name.into(),
            ptype: ptype.to_string(),
            v0: String::new(),
            v1: String::new(),
            v2: String::new(),
            v3: String::new(),
            v4: String::new(),
            v5: String::new(),
            status: RuleStatus::Enabled,
            category: None,
            description: None,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
            usage_count: 0,
            last_used_at: None,
            require_approval: false,
            approval_status: ApprovalStatus::Pending,
            approved_by: None,
            approved_at: None,
            effective_from: None,
            effective_to: None,
            is_temporary: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// New (unpersisted) permission rule.
    pub fn permission(
        tenant_id: TenantId,
        service_name: impl Into<String>,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
        effect: Effect,
    ) -> Self {
        let mut rule = Self::blank(tenant_id, service_name, "p");
        rule.v0 = subject.into();
        rule.v1 = object.into();
        rule.v2 = action.into();
        rule.v3 = effect.as_str().to_string();
        rule
    }

    /// New (unpersisted) subject → role membership.
    pub fn grouping(
        tenant_id: TenantId,
        service_name: impl Into<String>,
        member: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self::named_grouping(tenant_id, service_name, "g", member, group)
    }

    /// New (unpersisted) membership in a named grouping relation (`g2`, ...).
    pub fn named_grouping(
        tenant_id: TenantId,
        service_name: impl Into<String>,
        relation: &str,
        member: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        let mut rule = Self::blank(tenant_id, service_name, relation);
        rule.v0 = member.into();
        rule.v1 = group.into();
        rule
    }

    pub fn with_id(mut self, id: RuleId) -> Self {
        self.id = id;
        self
    }

    pub fn with_status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the rule as inert until approved.
    pub fn requiring_approval(mut self) -> Self {
        self.require_approval = true;
        self.approval_status = ApprovalStatus::Pending;
        self
    }

    pub fn approve(&mut self, approver: impl Into<String>, at: DateTime<Utc>) {
        self.approval_status = ApprovalStatus::Approved;
        self.approved_by = Some(approver.into());
        self.approved_at = Some(at);
        self.updated_at = at;
    }

    pub fn reject(&mut self, approver: impl Into<String>, at: DateTime<Utc>) {
        self.approval_status = ApprovalStatus::Rejected;
        self.approved_by = Some(approver.into());
        self.approved_at = Some(at);
        self.updated_at = at;
    }

    pub fn effective_between(
        mut self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Self {
        self.effective_from = from;
        self.effective_to = to;
        self
    }

    /// Temporary rules are disabled by the expiry sweep once `effective_to` passes.
    pub fn temporary_until(mut self, to: DateTime<Utc>) -> Self {
        self.is_temporary = true;
        self.effective_to = Some(to);
        self
    }

    /// Typed reading of `ptype` + positional fields.
    pub fn kind(&self) -> Result<RuleKind, DomainError> {
        match self.ptype.as_str() {
            "p" | "permission" => {
                let effect = if self.v3.is_empty() {
                    Effect::Allow
                } else {
                    self.v3.parse()?
                };
                Ok(RuleKind::Permission(PermissionRule {
                    subject: self.v0.clone(),
                    object: self.v1.clone(),
                    action: self.v2.clone(),
                    effect,
                }))
            }
            other => match GroupingRelation::parse(other) {
                Some(relation) => Ok(RuleKind::Grouping(GroupingRule {
                    relation,
                    member: self.v0.clone(),
                    group: self.v1.clone(),
                })),
                None => Err(DomainError::validation(format!("unknown rule kind \"{other}\""))),
            },
        }
    }

    pub fn is_permission(&self) -> bool {
        matches!(self.kind(), Ok(RuleKind::Permission(_)))
    }
}
