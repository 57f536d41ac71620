//! `halberd-engine`: the multi-tenant policy decision engine.
//!
//! - [`evaluator`]: per-tenant compiled evaluators and their registry
//! - [`cache`]: decision / role-set memoization
//! - [`checker`]: single, role-expanded and batch checks
//! - [`sync`]: cross-instance change propagation
//! - [`service`]: the `PolicyService` facade tying them together

pub mod audit;
pub mod cache;
pub mod checker;
pub mod config;
pub mod context;
pub mod decision;
pub mod error;
pub mod evaluator;
pub mod service;
pub mod sync;

#[cfg(test)]
mod integration_tests;

pub use audit::{AuditRecord, AuditSink, TracingAuditSink};
pub use cache::DecisionCache;
pub use checker::{DecisionEnricher, PermissionChecker};
pub use config::EngineConfig;
pub use context::{PrincipalContext, TenantContext};
pub use decision::{CheckOptions, CheckRequest, Decision};
pub use error::{CheckError, EvaluatorError, PolicyServiceError};
pub use evaluator::{Evaluation, Evaluator, EvaluatorRegistry, GrantedPermission};
pub use service::{
    BatchCheckResponse, CacheType, CheckPermissionRequest, CheckPermissionResponse, ExpiryReport,
    PermissionEntry, PermissionSummary, PolicyService, RefreshCacheResponse, SyncRulesResponse,
};
pub use sync::{PolicySynchronizer, SynchronizerHandle};
