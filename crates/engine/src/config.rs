//! Engine configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use halberd_infra::{CacheStore, ChangeBus, DEFAULT_CHANNEL, InMemoryCacheStore, InMemoryChangeBus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub decision_ttl: Duration,
    pub role_ttl: Duration,
    /// Callers holding this role bypass evaluation.
    pub superadmin_role: String,
    /// Default per-check deadline; `None` waits indefinitely.
    pub check_timeout: Option<Duration>,
    /// Upper bound on concurrently evaluated requests within one batch.
    pub batch_concurrency: usize,
    /// Pub/sub channel of the Redis change bus.
    pub sync_channel: String,
    /// Shared Redis for the change bus and decision cache; in-process
    /// transports when unset or when built without the `redis` feature.
    pub redis_url: Option<String>,
    /// Identifies this process on the change bus.
    pub instance_id: Uuid,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            decision_ttl: Duration::from_secs(5 * 60),
            role_ttl: Duration::from_secs(10 * 60),
            superadmin_role: "superadmin".to_string(),
            check_timeout: None,
            batch_concurrency: 64,
            sync_channel: DEFAULT_CHANNEL.to_string(),
            redis_url: None,
            instance_id: Uuid::now_v7(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `HALBERD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        let secs = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|v| v.trim().parse::<u64>().with_context(|| format!("{key} must be an integer")))
                .transpose()
        };

        if let Some(s) = secs("HALBERD_DECISION_TTL_SECS")? {
            config.decision_ttl = Duration::from_secs(s);
        }
        if let Some(s) = secs("HALBERD_ROLE_TTL_SECS")? {
            config.role_ttl = Duration::from_secs(s);
        }
        if let Some(ms) = secs("HALBERD_CHECK_TIMEOUT_MS")? {
            config.check_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(n) = secs("HALBERD_BATCH_CONCURRENCY")? {
            anyhow::ensure!(n > 0, "HALBERD_BATCH_CONCURRENCY must be positive");
            config.batch_concurrency = usize::try_from(n).context("HALBERD_BATCH_CONCURRENCY is too large")?;
        }
        if let Some(role) = lookup("HALBERD_SUPERADMIN_ROLE") {
            anyhow::ensure!(!role.trim().is_empty(), "HALBERD_SUPERADMIN_ROLE must not be empty");
            config.superadmin_role = role.trim().to_string();
        }
        if let Some(channel) = lookup("HALBERD_SYNC_CHANNEL") {
            anyhow::ensure!(!channel.trim().is_empty(), "HALBERD_SYNC_CHANNEL must not be empty");
            config.sync_channel = channel.trim().to_string();
        }
        if let Some(url) = lookup("HALBERD_REDIS_URL") {
            config.redis_url = Some(url.trim().to_string()).filter(|u| !u.is_empty());
        }

        Ok(config)
    }

    pub fn with_decision_ttl(mut self, ttl: Duration) -> Self {
        self.decision_ttl = ttl;
        self
    }

    pub fn with_role_ttl(mut self, ttl: Duration) -> Self {
        self.role_ttl = ttl;
        self
    }

    pub fn with_superadmin_role(mut self, role: impl Into<String>) -> Self {
        self.superadmin_role = role.into();
        self
    }

    pub fn with_check_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub fn with_batch_concurrency(mut self, limit: usize) -> Self {
        self.batch_concurrency = limit.max(1);
        self
    }

    pub fn with_sync_channel(mut self, channel: impl Into<String>) -> Self {
        self.sync_channel = channel.into();
        self
    }

    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// The change bus this configuration selects: Redis pub/sub on
    /// `sync_channel` when a Redis URL is set, otherwise in-process.
    pub fn change_bus(&self) -> Result<Arc<dyn ChangeBus>> {
        match self.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(url) => {
                let bus = halberd_infra::RedisChangeBus::new(url, self.sync_channel.clone())
                    .context("connecting the change bus")?;
                Ok(Arc::new(bus))
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => anyhow::bail!("HALBERD_REDIS_URL is set but the `redis` feature is disabled"),
            None => Ok(Arc::new(InMemoryChangeBus::new())),
        }
    }

    /// The decision cache backend this configuration selects.
    pub fn cache_store(&self) -> Result<Arc<dyn CacheStore>> {
        match self.redis_url.as_deref() {
            #[cfg(feature = "redis")]
            Some(url) => {
                let store = halberd_infra::RedisCacheStore::new(url).context("connecting the decision cache")?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis"))]
            Some(_) => anyhow::bail!("HALBERD_REDIS_URL is set but the `redis` feature is disabled"),
            None => Ok(Arc::new(InMemoryCacheStore::new())),
        }
    }
}
