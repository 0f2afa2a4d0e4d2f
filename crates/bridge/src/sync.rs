//! Subscription Synchronizer

use crate::{
    BridgeError, ConnectionKey, ConnectionPool, ConvergeReport, Credentials, EntityDirectory, EntityRouter,
    ReadingPipeline, TopicIndex,
};
use metrics::gauge;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use storage::{ConfigStore, EntitySubscription};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of one synchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Entities in the desired set
    pub entities: usize,
    /// Entities omitted because their broker or topic cannot be used
    pub skipped: usize,
    pub connections: ConvergeReport,
    pub subscribed: usize,
    pub unsubscribed: usize,
    pub subscribe_failures: usize,
}

/// Desired state computed from one configuration query
#[derive(Default)]
struct Plan {
    credentials: HashMap<ConnectionKey, Credentials>,
    indexes: HashMap<ConnectionKey, TopicIndex>,
    entities: HashMap<String, Arc<EntitySubscription>>,
    skipped: usize,
}

fn valid_topic(topic: &str) -> Result<(), BridgeError> {
    if topic.trim().is_empty() || topic.contains(['+', '#']) {
        return Err(BridgeError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

impl Plan {
    fn build(subscriptions: Vec<EntitySubscription>) -> Self {
        let mut plan = Plan::default();

        for entity in subscriptions {
            if !entity.is_relevant() {
                continue;
            }
            if plan.entities.contains_key(&entity.entity_id) {
                warn!(entity = %entity.entity_id, "Duplicate entity in configuration, keeping the first");
                continue;
            }

            let resolved = valid_topic(&entity.topic).and_then(|_| ConnectionKey::for_subscription(&entity));
            let (key, credentials) = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(entity = %entity.entity_id, "Skipping entity: {}", e);
                    plan.skipped += 1;
                    continue;
                }
            };

            plan.indexes
                .entry(key.clone())
                .or_default()
                .insert(entity.topic.clone(), entity.entity_id.clone());
            plan.credentials.insert(key, credentials);
            plan.entities.insert(entity.entity_id.clone(), Arc::new(entity));
        }

        plan
    }
}

/// Reconciles live subscriptions against the configuration store
pub struct Synchronizer {
    config_store: Arc<dyn ConfigStore>,
    pool: Arc<ConnectionPool>,
    directory: Arc<EntityDirectory>,
    router: Arc<EntityRouter>,
    pipeline: Arc<ReadingPipeline>,
    /// Held for the whole pass; concurrent triggers queue behind it
    running: Mutex<()>,
    query_timeout: Duration,
}

impl Synchronizer {
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        pool: Arc<ConnectionPool>,
        directory: Arc<EntityDirectory>,
        router: Arc<EntityRouter>,
        pipeline: Arc<ReadingPipeline>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            config_store,
            pool,
            directory,
            router,
            pipeline,
            running: Mutex::new(()),
            query_timeout,
        }
    }

    /// Run one synchronization pass.
    ///
    /// A failed configuration query leaves every connection and index as
    /// it was.
    pub async fn refresh(&self) -> Result<SyncReport, BridgeError> {
        let _running = self.running.lock().await;

        let subscriptions = tokio::time::timeout(self.query_timeout, self.config_store.relevant_subscriptions())
            .await
            .map_err(|_| BridgeError::Timeout(self.query_timeout.as_millis() as u64))??;

        let plan = Plan::build(subscriptions);
        let mut report = SyncReport {
            entities: plan.entities.len(),
            skipped: plan.skipped,
            ..Default::default()
        };

        self.pipeline.seed_alert_states(plan.entities.values().map(|e| &**e));
        let entity_ids: HashSet<String> = plan.entities.keys().cloned().collect();
        // Readings for removed entities are dropped from here on
        self.directory.replace(plan.entities);

        report.connections = self.pool.converge(&plan.credentials).await;

        for (key, index) in plan.indexes {
            let Some(connection) = self.pool.resolve(&key) else {
                debug!(connection = %key, "Connection unavailable, topics deferred to next pass");
                continue;
            };

            let wanted: BTreeSet<String> = index.topics().map(str::to_string).collect();
            connection.replace_index(index);

            for topic in &wanted {
                match connection.subscribe(topic).await {
                    Ok(true) => report.subscribed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(connection = %key, topic = %topic, "Subscribe failed: {}", e);
                        report.subscribe_failures += 1;
                    }
                }
            }

            let stale: Vec<String> = connection
                .subscribed_topics()
                .into_iter()
                .filter(|topic| !wanted.contains(topic))
                .collect();
            for topic in stale {
                connection.unsubscribe(&topic).await;
                report.unsubscribed += 1;
            }
        }

        self.router.retain(&entity_ids);
        gauge!("bridge_subscribed_entities").set(entity_ids.len() as f64);

        info!(
            entities = report.entities,
            skipped = report.skipped,
            connections = self.pool.len(),
            subscribed = report.subscribed,
            unsubscribed = report.unsubscribed,
            "Synchronization complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use crate::{BridgeConfig, BrokerEndpoint};
    use notifier::Dispatcher;
    use storage::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        transport: Arc<FakeTransport>,
        pool: Arc<ConnectionPool>,
        directory: Arc<EntityDirectory>,
        sync: Synchronizer,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(FakeTransport::new());
        let directory = Arc::new(EntityDirectory::new());
        let dispatcher = Arc::new(Dispatcher::new(None, store.clone(), Duration::from_secs(1)));
        let pipeline = Arc::new(ReadingPipeline::new(
            &BridgeConfig::default(),
            directory.clone(),
            store.clone(),
            store.clone(),
            dispatcher,
        ));
        let router = Arc::new(EntityRouter::new(pipeline.clone(), 16));
        let pool = Arc::new(ConnectionPool::new(transport.clone(), router.clone()));
        let sync = Synchronizer::new(
            store.clone(),
            pool.clone(),
            directory.clone(),
            router,
            pipeline,
            Duration::from_secs(1),
        );
        Harness {
            store,
            transport,
            pool,
            directory,
            sync,
        }
    }

    fn entity(id: &str, topic: &str, broker: &str) -> EntitySubscription {
        EntitySubscription::new(id, topic, broker)
    }

    fn key(broker: &str) -> ConnectionKey {
        ConnectionKey::new(BrokerEndpoint::parse(broker).unwrap(), &Credentials::default())
    }

    #[tokio::test]
    async fn test_shared_key_single_connection() {
        let h = harness();
        h.store.upsert_entity(entity("a", "site/a", "mqtt://broker:1883")).unwrap();
        h.store.upsert_entity(entity("b", "site/b", "BROKER")).unwrap();

        let report = h.sync.refresh().await.unwrap();
        assert_eq!(report.entities, 2);
        assert_eq!(report.connections.opened, 1);
        assert_eq!(report.subscribed, 2);

        let connection = h.pool.resolve(&key("broker")).unwrap();
        assert_eq!(connection.index().len(), 2);
        assert_eq!(h.transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_repeat_refresh_is_noop() {
        let h = harness();
        h.store.upsert_entity(entity("a", "site/a", "broker")).unwrap();
        h.sync.refresh().await.unwrap();

        let report = h.sync.refresh().await.unwrap();
        assert_eq!((report.subscribed, report.unsubscribed), (0, 0));
        assert_eq!(report.connections.unchanged, 1);
        let session = h.transport.session(&key("broker")).unwrap();
        assert_eq!(session.subscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_topic_change_and_removal() {
        let h = harness();
        h.store.upsert_entity(entity("a", "site/a", "broker")).unwrap();
        h.store.upsert_entity(entity("b", "site/b", "other")).unwrap();
        h.sync.refresh().await.unwrap();

        h.store.upsert_entity(entity("a", "site/a2", "broker")).unwrap();
        h.store.delete_entity("b").unwrap();
        let report = h.sync.refresh().await.unwrap();

        assert_eq!((report.subscribed, report.unsubscribed), (1, 1));
        assert_eq!(report.connections.closed, 1);
        let session = h.transport.session(&key("broker")).unwrap();
        assert_eq!(session.subscriptions(), BTreeSet::from(["site/a2".to_string()]));
        assert!(h.transport.session(&key("other")).unwrap().is_disconnected());
        assert!(h.directory.get("b").is_none());
    }

    #[tokio::test]
    async fn test_irrelevant_and_invalid_entities_skipped() {
        let h = harness();
        let mut idle = entity("idle", "site/idle", "broker");
        idle.store_history = false;
        h.store.upsert_entity(idle).unwrap();
        h.store.upsert_entity(entity("wild", "site/+", "broker")).unwrap();
        h.store.upsert_entity(entity("bad", "site/bad", "ws://broker")).unwrap();
        h.store.upsert_entity(entity("ok", "site/ok", "broker")).unwrap();

        let report = h.sync.refresh().await.unwrap();
        assert_eq!(report.entities, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(h.directory.ids(), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_connection_retried_next_pass() {
        let h = harness();
        h.store.upsert_entity(entity("a", "site/a", "broker")).unwrap();

        h.transport.set_fail_connect(true);
        let report = h.sync.refresh().await.unwrap();
        assert_eq!(report.connections.failed, 1);
        assert_eq!(report.subscribed, 0);

        h.transport.set_fail_connect(false);
        let report = h.sync.refresh().await.unwrap();
        assert_eq!(report.connections.opened, 1);
        assert_eq!(report.subscribed, 1);
    }

    /// Configuration store whose query can be made to fail
    struct FlakyConfig {
        inner: Arc<MemoryStore>,
        fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ConfigStore for FlakyConfig {
        async fn relevant_subscriptions(&self) -> Result<Vec<EntitySubscription>, storage::StorageError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(storage::StorageError::DatabaseError("unavailable".to_string()));
            }
            self.inner.relevant_subscriptions().await
        }

        async fn write_alert_state(
            &self,
            entity_id: &str,
            state: &alerting::AlertState,
        ) -> Result<(), storage::StorageError> {
            self.inner.write_alert_state(entity_id, state).await
        }
    }

    #[tokio::test]
    async fn test_query_failure_keeps_connections() {
        let h = harness();
        h.store.upsert_entity(entity("a", "site/a", "broker")).unwrap();
        let flaky = Arc::new(FlakyConfig {
            inner: h.store.clone(),
            fail: Default::default(),
        });
        let router = Arc::new(EntityRouter::new(h.sync.pipeline.clone(), 16));
        let sync = Synchronizer::new(
            flaky.clone(),
            h.pool.clone(),
            h.directory.clone(),
            router,
            h.sync.pipeline.clone(),
            Duration::from_secs(1),
        );
        sync.refresh().await.unwrap();

        flaky.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(sync.refresh().await, Err(BridgeError::Store(_))));
        assert_eq!(h.pool.len(), 1);
        assert!(h.directory.get("a").is_some());
        let session = h.transport.session(&key("broker")).unwrap();
        assert!(!session.is_disconnected());
        assert_eq!(session.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_converge() {
        let h = harness();
        for i in 0..10 {
            h.store
                .upsert_entity(entity(&format!("e{}", i), &format!("site/{}", i), "broker"))
                .unwrap();
        }

        let (a, b) = tokio::join!(h.sync.refresh(), h.sync.refresh());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.transport.connect_count(), 1);
        let session = h.transport.session(&key("broker")).unwrap();
        assert_eq!(session.subscriptions().len(), 10);
        assert_eq!(session.subscribe_calls(), 10);
    }
}
