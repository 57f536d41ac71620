//! Key/value cache backends for the decision cache.
//!
//! Values are opaque strings (the engine stores JSON). Keys are flat strings;
//! [`CacheStore::scan`] takes a Redis-style glob (see [`crate::glob`]).
//! The trait is synchronous, like the other infra stores: the in-memory backend
//! never blocks and the Redis backend holds one short connection per call.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use in_memory::InMemoryCacheStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCacheStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key`, expiring after `ttl`.
    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Remove keys, returning how many existed.
    fn delete(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// Live keys matching a glob pattern.
    fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError>;
}

impl<S> CacheStore for Arc<S>
where
    S: CacheStore + ?Sized,
{
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        (**self).set(key, value, ttl)
    }

    fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        (**self).delete(keys)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        (**self).scan(pattern)
    }
}
