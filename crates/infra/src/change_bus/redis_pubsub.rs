//! Redis pub/sub change bus (optional, feature `redis`).
//!
//! Redis pub/sub is not durable: an instance that is disconnected while a
//! change is published misses it and serves its previous evaluator until the
//! next change, a force-sync, or a temporal transition triggers a reload.

use std::thread;
use std::time::Duration;

use redis::Commands;
use tracing::{debug, warn};

use halberd_events::{BusError, EventBus, PolicyChanged, Subscription};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RedisChangeBus {
    client: redis::Client,
    channel: String,
}

impl RedisChangeBus {
    pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, BusError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl EventBus<PolicyChanged> for RedisChangeBus {
    fn publish(&self, message: PolicyChanged) -> Result<(), BusError> {
        let payload =
            serde_json::to_string(&message).map_err(|e| BusError::Serialization(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| BusError::Transport(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<PolicyChanged> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let client = self.client.clone();
        let channel = self.channel.clone();

        // Blocking reader thread; exits when the subscription is dropped.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "change bus: redis connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(&channel) {
                warn!(error = %e, channel = %channel, "change bus: subscribe failed");
                return;
            }
            if pubsub.set_read_timeout(Some(POLL_INTERVAL)).is_err() {
                return;
            }

            while !tx.is_closed() {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => {
                        warn!(error = %e, "change bus: redis receive failed");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: PolicyChanged = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        debug!(error = %e, "change bus: skipping malformed payload");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
