use halberd_core::TenantId;

/// Tenant context for a call.
///
/// Immutable; every rule and decision operation is scoped by it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: TenantId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId) -> Self {
        Self { tenant_id }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

/// The authenticated caller (identity + roles), used for approvals and the
/// superadmin bypass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal_id: String,
    roles: Vec<String>,
}

impl PrincipalContext {
    pub fn new(principal_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            roles,
        }
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}
