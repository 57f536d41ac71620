//! Infrastructure layer: rule persistence, cache backends, pub/sub transports.
//!
//! Redis adapters are compiled only with the `redis` feature.

pub mod cache_store;
pub mod change_bus;
pub mod glob;
pub mod rule_store;

pub use cache_store::{CacheError, CacheStore, InMemoryCacheStore};
pub use change_bus::{ChangeBus, DEFAULT_CHANNEL, InMemoryChangeBus};
pub use rule_store::{InMemoryRuleStore, PostgresRuleStore, RuleFilter, RuleStore, RuleStoreError};

#[cfg(feature = "redis")]
pub use cache_store::RedisCacheStore;
#[cfg(feature = "redis")]
pub use change_bus::RedisChangeBus;
