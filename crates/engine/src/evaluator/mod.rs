//! Compiled evaluators and the per-tenant registry that owns them.

mod compiled;
mod registry;

pub use compiled::{Evaluation, Evaluator, GROUPING_RELATIONS, GrantedPermission};
pub use registry::EvaluatorRegistry;

/// The casbin model every tenant evaluator is compiled against.
///
/// Requests carry the service so one evaluator serves all services of a tenant.
/// Role (`g`) and object (`g2`) groupings are tenant-wide.
pub const MODEL: &str = include_str!("model.conf");
