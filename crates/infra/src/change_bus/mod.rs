//! Transports for [`PolicyChanged`] notifications.

use halberd_events::{EventBus, InMemoryEventBus, PolicyChanged};

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisChangeBus;

/// Default Redis channel for policy change notifications.
pub const DEFAULT_CHANNEL: &str = "halberd:policy:changed";

/// A bus carrying policy change notifications.
pub trait ChangeBus: EventBus<PolicyChanged> {}

impl<B> ChangeBus for B where B: EventBus<PolicyChanged> + ?Sized {}

/// Single-process change bus.
pub type InMemoryChangeBus = InMemoryEventBus<PolicyChanged>;
