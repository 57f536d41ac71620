//! Engine error types.

use thiserror::Error;

use halberd_core::{DomainError, RuleId};
use halberd_events::BusError;
use halberd_infra::RuleStoreError;

/// Failures building or mutating a compiled evaluator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaluatorError {
    /// The embedded model did not parse. Fatal at startup.
    #[error("policy model error: {0}")]
    Model(String),

    #[error("evaluator backend error: {0}")]
    Backend(String),

    /// A single rule could not be compiled; other rules are unaffected.
    #[error("rule {id} rejected by evaluator: {reason}")]
    InvalidRule { id: RuleId, reason: String },

    #[error(transparent)]
    Store(#[from] RuleStoreError),
}

impl EvaluatorError {
    pub(crate) fn backend(e: casbin::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckError {
    #[error("invalid check request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error("check task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum PolicyServiceError {
    /// Rule failed validation; carries every reported error.
    #[error("rule is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("rule not found: {0}")]
    NotFound(RuleId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] RuleStoreError),

    #[error(transparent)]
    Evaluator(#[from] EvaluatorError),

    #[error(transparent)]
    Check(#[from] CheckError),

    #[error(transparent)]
    Bus(#[from] BusError),
}
