//! Redis-backed cache (optional, feature `redis`).
//!
//! Shared by every engine instance, so a decision cached by one instance is
//! visible to all of them. Invalidation still goes through pub/sub so that the
//! in-process evaluators are reloaded too.

use std::time::Duration;

use super::{CacheError, CacheStore};

const SCAN_BATCH: usize = 500;

/// Default bound on connecting and on each command round-trip.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct RedisCacheStore {
    client: redis::Client,
    io_timeout: Duration,
}

impl RedisCacheStore {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            io_timeout: DEFAULT_IO_TIMEOUT,
        })
    }

    /// A stalled server then fails the call instead of blocking it.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn connection(&self) -> Result<redis::Connection, CacheError> {
        let unavailable = |e: redis::RedisError| CacheError::Unavailable(e.to_string());
        let conn = self
            .client
            .get_connection_with_timeout(self.io_timeout)
            .map_err(unavailable)?;
        conn.set_read_timeout(Some(self.io_timeout)).map_err(unavailable)?;
        conn.set_write_timeout(Some(self.io_timeout)).map_err(unavailable)?;
        Ok(conn)
    }
}

fn backend(e: redis::RedisError) -> CacheError {
    CacheError::Backend(e.to_string())
}

impl CacheStore for RedisCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection()?;
        redis::cmd("GET").arg(key).query(&mut conn).map_err(backend)
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection()?;
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis)
            .query::<()>(&mut conn)
            .map_err(backend)
    }

    fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection()?;
        redis::cmd("DEL").arg(keys).query(&mut conn).map_err(backend)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection()?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query(&mut conn)
                .map_err(backend)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
