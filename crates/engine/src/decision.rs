//! Check requests, options and decisions.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use halberd_core::TenantId;

/// One "may `subject` do `action` on `object`" question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub tenant_id: TenantId,
    pub service: String,
    pub subject: String,
    pub object: String,
    pub action: String,
    /// Roles asserted by the caller's credentials (not the stored groupings).
    ///
    /// Only these trigger the superadmin bypass: it is decided before the
    /// evaluator and the cache are consulted, so a stored `g` grouping of the
    /// subject to the superadmin role is evaluated like any other role and an
    /// explicit deny still applies to it.
    #[serde(default)]
    pub caller_roles: Vec<String>,
    /// Free-form request attributes, handed to decision enrichers.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl CheckRequest {
    pub fn new(
        tenant_id: TenantId,
        service: impl Into<String>,
        subject: impl Into<String>,
        object: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            service: service.into(),
            subject: subject.into(),
            object: object.into(),
            action: action.into(),
            caller_roles: Vec::new(),
            context: HashMap::new(),
        }
    }

    pub fn with_caller_roles<I, T>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.caller_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Same question asked on behalf of another subject (role expansion).
    pub(crate) fn as_subject(&self, subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            caller_roles: Vec::new(),
            ..self.clone()
        }
    }

    pub(crate) fn missing_field(&self) -> Option<&'static str> {
        [
            ("service", &self.service),
            ("subject", &self.subject),
            ("object", &self.object),
            ("action", &self.action),
        ]
        .into_iter()
        .find(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CheckOptions {
    pub enable_cache: bool,
    pub audit_log: bool,
    /// Fail closed once elapsed.
    pub deadline: Option<Duration>,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            enable_cache: true,
            audit_log: false,
            deadline: None,
        }
    }
}

impl CheckOptions {
    pub fn uncached() -> Self {
        Self {
            enable_cache: false,
            ..Self::default()
        }
    }

    pub fn with_audit(mut self) -> Self {
        self.audit_log = true;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    /// Contributing rule ids, plus the granting role for role-expanded grants.
    pub applied_rules: Vec<String>,
    pub data_filters: serde_json::Map<String, serde_json::Value>,
    pub field_masks: Vec<String>,
    pub duration_ms: u64,
    pub from_cache: bool,
    /// Denied by a matching deny rule (as opposed to no matching allow).
    #[serde(default)]
    pub explicit_deny: bool,
    /// Role through which an inherited allow matched.
    #[serde(default)]
    pub granted_via: Option<String>,
}

impl Decision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self::new(true, reason)
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::new(false, reason)
    }

    fn new(allowed: bool, reason: impl Into<String>) -> Self {
        Self {
            allowed,
            reason: reason.into(),
            applied_rules: Vec::new(),
            data_filters: serde_json::Map::new(),
            field_masks: Vec::new(),
            duration_ms: 0,
            from_cache: false,
            explicit_deny: false,
            granted_via: None,
        }
    }

    pub(crate) fn with_duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
