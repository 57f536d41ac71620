//! `halberd-events`: cross-instance change notification mechanics.
//!
//! The bus abstraction is transport-agnostic; infrastructure-backed buses
//! (Redis pub/sub) live in `halberd-infra`.

pub mod bus;
pub mod in_memory_bus;
pub mod policy_changed;

pub use bus::{BusError, EventBus, Subscription};
pub use in_memory_bus::InMemoryEventBus;
pub use policy_changed::{ChangeReason, PolicyChanged};
