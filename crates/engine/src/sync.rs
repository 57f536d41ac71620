//! Cross-instance policy synchronization.
//!
//! After a committed write an instance publishes a [`PolicyChanged`] event.
//! Every other instance listening on the same bus reloads the named tenant
//! wholesale from the rule store and drops that tenant's cached decisions.
//! Events carrying this instance's own origin are skipped: the write path has
//! already applied them locally.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use halberd_core::TenantId;
use halberd_events::{BusError, ChangeReason, PolicyChanged};
use halberd_infra::ChangeBus;

use crate::cache::DecisionCache;
use crate::evaluator::EvaluatorRegistry;

pub struct PolicySynchronizer {
    bus: Arc<dyn ChangeBus>,
    registry: Arc<EvaluatorRegistry>,
    cache: Arc<DecisionCache>,
    origin: Uuid,
}

impl PolicySynchronizer {
    pub fn new(
        bus: Arc<dyn ChangeBus>,
        registry: Arc<EvaluatorRegistry>,
        cache: Arc<DecisionCache>,
        origin: Uuid,
    ) -> Self {
        Self {
            bus,
            registry,
            cache,
            origin,
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Broadcast a change. `tenant_id = None` asks every instance to resync
    /// every tenant.
    pub fn notify(&self, tenant_id: Option<TenantId>, reason: ChangeReason) -> Result<(), BusError> {
        let event = PolicyChanged::new(self.origin, tenant_id, reason);
        debug!(event_id = %event.event_id, tenant_id = ?tenant_id, reason = %event.reason, "publishing policy change");
        self.bus.publish(event)
    }

    /// Apply one remote change. Returns whether it was applied (own events are
    /// skipped).
    pub async fn apply(&self, event: &PolicyChanged) -> bool {
        if event.origin == self.origin {
            return false;
        }

        match event.tenant_id {
            Some(tenant_id) => {
                if let Err(e) = self.registry.reload_policy(tenant_id).await {
                    warn!(tenant_id = %tenant_id, error = %e, "remote change: reload failed; serving previous evaluator");
                }
                let cleared = self.cache.invalidate_tenant(tenant_id);
                info!(tenant_id = %tenant_id, reason = %event.reason, cleared, "applied remote policy change");
            }
            None => {
                let reloaded = self.registry.reload_all().await;
                let cleared = self.cache.invalidate_all(None);
                info!(tenants = reloaded.len(), reason = %event.reason, cleared, "applied remote full resync");
            }
        }
        true
    }

    /// Subscribe and apply changes in a background task until shut down.
    pub fn listen(self: &Arc<Self>) -> SynchronizerHandle {
        let mut subscription = self.bus.subscribe();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let synchronizer = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    next = subscription.recv() => match next {
                        Some(event) => {
                            synchronizer.apply(&event).await;
                        }
                        None => {
                            warn!("change bus closed; synchronizer stopping");
                            break;
                        }
                    },
                }
            }
            debug!("synchronizer stopped");
        });

        SynchronizerHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }
}

/// Running listener. Dropping the handle also stops the task.
pub struct SynchronizerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SynchronizerHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            warn!(error = %e, "synchronizer task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use halberd_core::{Clock, SystemClock};
    use halberd_infra::{InMemoryCacheStore, InMemoryChangeBus, InMemoryRuleStore, RuleStore};
    use halberd_policy::{Effect, PolicyRule};

    use crate::decision::{CheckRequest, Decision};

    const T: TenantId = TenantId::new(7);

    struct Instance {
        registry: Arc<EvaluatorRegistry>,
        cache: Arc<DecisionCache>,
        sync: Arc<PolicySynchronizer>,
    }

    async fn instance(store: Arc<InMemoryRuleStore>, bus: Arc<InMemoryChangeBus>) -> Instance {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Arc::new(EvaluatorRegistry::new(store, clock).await.unwrap());
        let cache = Arc::new(DecisionCache::new(
            Arc::new(InMemoryCacheStore::new()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        let sync = Arc::new(PolicySynchronizer::new(bus, registry.clone(), cache.clone(), Uuid::now_v7()));
        Instance { registry, cache, sync }
    }

    #[tokio::test]
    async fn remote_change_reloads_and_invalidates() {
        let store = InMemoryRuleStore::arc();
        let bus = Arc::new(InMemoryChangeBus::new());
        let writer = instance(store.clone(), bus.clone()).await;
        let reader = instance(store.clone(), bus.clone()).await;
        let handle = reader.sync.listen();

        // Reader has an evaluator and a cached deny.
        assert!(!reader.registry.enforce(T, "editor", "cms", "/docs/1", "write").await.unwrap().allowed);
        let req = CheckRequest::new(T, "cms", "editor", "/docs/1", "write");
        reader.cache.set(&req, &Decision::deny("no matching policy"));

        store
            .insert(PolicyRule::permission(T, "cms", "editor", "/docs/*", "write", Effect::Allow))
            .await
            .unwrap();
        writer.sync.notify(Some(T), ChangeReason::RuleCreated).unwrap();

        let mut applied = false;
        for _ in 0..100 {
            let allowed = reader.registry.enforce(T, "editor", "cms", "/docs/1", "write").await.unwrap().allowed;
            applied = allowed && reader.cache.get(&req).is_none();
            if applied {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(applied);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn own_events_are_skipped() {
        let store = InMemoryRuleStore::arc();
        let bus = Arc::new(InMemoryChangeBus::new());
        let node = instance(store, bus).await;

        let own = PolicyChanged::for_tenant(node.sync.origin(), T, ChangeReason::RuleUpdated);
        assert!(!node.sync.apply(&own).await);

        let remote = PolicyChanged::all_tenants(Uuid::now_v7(), ChangeReason::ForceSync);
        assert!(node.sync.apply(&remote).await);
    }

    #[tokio::test]
    async fn shutdown_stops_the_listener() {
        let bus = Arc::new(InMemoryChangeBus::new());
        let node = instance(InMemoryRuleStore::arc(), bus.clone()).await;

        let handle = node.sync.listen();
        assert_eq!(bus.subscriber_count(), 1);
        assert!(!handle.is_finished());
        handle.shutdown().await;

        // The dead subscription is pruned on the next publish.
        node.sync.notify(None, ChangeReason::ForceSync).unwrap();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
