//! `halberd-core`: foundation types shared by every layer of the policy engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{RuleId, TenantId};
