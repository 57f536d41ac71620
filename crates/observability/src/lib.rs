//! Process-wide tracing setup for services embedding the policy engine.

/// Subscriber construction and installation.
pub mod tracing;

pub use crate::tracing::{LogFormat, init_with};

/// Install the default subscriber: JSON lines, `RUST_LOG` filter, `info` when unset.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init_with("info", LogFormat::Json);
}
