//! Strongly-typed numeric identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of a tenant (the authorization domain / isolation boundary).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(u64);

/// Identifier of a stored policy rule.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(u64);

macro_rules! impl_numeric_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<u64> for $t {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for u64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

impl_numeric_newtype!(TenantId, "TenantId");
impl_numeric_newtype!(RuleId, "RuleId");

impl RuleId {
    /// Placeholder id carried by rules that have not been persisted yet.
    pub const UNASSIGNED: RuleId = RuleId(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let tenant: TenantId = " 7 ".parse().unwrap();
        assert_eq!(tenant, TenantId::new(7));
        assert_eq!(tenant.to_string(), "7");
    }

    #[test]
    fn rejects_non_numeric() {
        let err = "abc".parse::<RuleId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(msg) if msg.starts_with("RuleId")));
    }

    #[test]
    fn unassigned_rule_id() {
        assert!(!RuleId::UNASSIGNED.is_assigned());
        assert!(RuleId::new(3).is_assigned());
    }
}
