//! Per-entity worker routing

use crate::{MessageSink, ReadingPipeline};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Worker {
    sender: mpsc::Sender<Arc<[u8]>>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    active: HashMap<String, Worker>,
    /// Stopped workers still draining their queues
    retired: HashMap<String, JoinHandle<()>>,
}

impl Workers {
    fn retire(&mut self, entity_id: String, worker: Worker) {
        // Dropping the sender lets the worker finish its queue and exit
        drop(worker.sender);
        self.retired.insert(entity_id, worker.task);
    }
}

/// Routes payloads to one worker task per entity.
///
/// Readings of the same entity are processed in arrival order; different
/// entities run concurrently. A replacement worker waits for its retired
/// predecessor, so one entity is never processed by two tasks at once.
pub struct EntityRouter {
    pipeline: Arc<ReadingPipeline>,
    workers: Mutex<Workers>,
    queue_depth: usize,
}

impl EntityRouter {
    pub fn new(pipeline: Arc<ReadingPipeline>, queue_depth: usize) -> Self {
        Self {
            pipeline,
            workers: Mutex::new(Workers::default()),
            queue_depth: queue_depth.max(1),
        }
    }

    fn spawn_worker(&self, entity_id: &str, previous: Option<JoinHandle<()>>) -> Worker {
        let (sender, mut rx) = mpsc::channel::<Arc<[u8]>>(self.queue_depth);
        let pipeline = self.pipeline.clone();
        let entity_id = entity_id.to_string();

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    debug!(entity = %entity_id, "Previous entity worker ended abnormally: {}", e);
                }
            }
            debug!(entity = %entity_id, "Entity worker started");
            while let Some(payload) = rx.recv().await {
                pipeline.process(&entity_id, &payload).await;
            }
            debug!(entity = %entity_id, "Entity worker stopped");
        });

        Worker { sender, task }
    }

    /// Number of running workers
    pub fn worker_count(&self) -> usize {
        self.workers.lock().map(|w| w.active.len()).unwrap_or(0)
    }

    /// Stop workers of entities no longer configured
    pub fn retain(&self, entity_ids: &HashSet<String>) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };
        workers.retired.retain(|_, task| !task.is_finished());

        let removed: Vec<String> = workers
            .active
            .keys()
            .filter(|id| !entity_ids.contains(*id))
            .cloned()
            .collect();
        for entity_id in removed {
            if let Some(worker) = workers.active.remove(&entity_id) {
                workers.retire(entity_id, worker);
            }
        }
    }

    /// Stop every worker; queued readings still drain
    pub fn clear(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            let active: Vec<(String, Worker)> = workers.active.drain().collect();
            for (entity_id, worker) in active {
                workers.retire(entity_id, worker);
            }
        }
    }
}

impl MessageSink for EntityRouter {
    fn route(&self, entity_id: &str, payload: Arc<[u8]>) {
        let Ok(mut workers) = self.workers.lock() else {
            return;
        };

        let sender = match workers.active.get(entity_id) {
            Some(worker) if !worker.sender.is_closed() => worker.sender.clone(),
            _ => {
                let previous = match workers.active.remove(entity_id) {
                    Some(worker) => Some(worker.task),
                    None => workers.retired.remove(entity_id),
                };
                let worker = self.spawn_worker(entity_id, previous);
                let sender = worker.sender.clone();
                workers.active.insert(entity_id.to_string(), worker);
                sender
            }
        };
        drop(workers);

        match sender.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                counter!("bridge_readings_dropped_total").increment(1);
                warn!(entity = entity_id, "Entity queue full, dropping reading");
            }
            Err(TrySendError::Closed(_)) => {
                counter!("bridge_readings_dropped_total").increment(1);
                warn!(entity = entity_id, "Entity worker gone, dropping reading");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::eventually;
    use crate::{BridgeConfig, EntityDirectory};
    use async_trait::async_trait;
    use notifier::Dispatcher;
    use std::time::Duration;
    use storage::{EntitySubscription, MemoryStore, Reading, ReadingStore, StorageError};

    /// Reading store that yields for a while on every write
    struct SlowReadings {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl ReadingStore for SlowReadings {
        async fn store_reading(&self, reading: &Reading) -> Result<(), StorageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.store_reading(reading).await
        }
    }

    fn router(ids: &[&str], queue_depth: usize) -> (Arc<MemoryStore>, EntityRouter) {
        router_with_delay(ids, queue_depth, None)
    }

    fn router_with_delay(
        ids: &[&str],
        queue_depth: usize,
        write_delay: Option<Duration>,
    ) -> (Arc<MemoryStore>, EntityRouter) {
        let store = Arc::new(MemoryStore::new());
        let readings: Arc<dyn ReadingStore> = match write_delay {
            Some(delay) => Arc::new(SlowReadings {
                inner: store.clone(),
                delay,
            }),
            None => store.clone(),
        };
        let directory = Arc::new(EntityDirectory::new());
        directory.replace(
            ids.iter()
                .map(|id| {
                    let mut entity = EntitySubscription::new(*id, format!("t/{}", id), "broker");
                    entity.deadband = Some(0.0);
                    (id.to_string(), Arc::new(entity))
                })
                .collect(),
        );
        let dispatcher = Arc::new(Dispatcher::new(None, store.clone(), Duration::from_secs(1)));
        let pipeline = Arc::new(ReadingPipeline::new(
            &BridgeConfig::default(),
            directory,
            readings,
            store.clone(),
            dispatcher,
        ));
        (store, EntityRouter::new(pipeline, queue_depth))
    }

    #[tokio::test]
    async fn test_readings_processed_in_order() {
        let (store, router) = router(&["a", "b"], 64);
        for i in 1..=20 {
            router.route("a", format!("{}", i).as_bytes().into());
            router.route("b", format!("{}", i * 10).as_bytes().into());
        }

        assert!(eventually(|| async { store.reading_count() == 40 }).await);
        let values: Vec<f64> = store.readings_for("a").iter().map(|r| r.value).collect();
        assert_eq!(values, (1..=20).map(f64::from).collect::<Vec<_>>());
        assert_eq!(router.worker_count(), 2);
    }

    #[tokio::test]
    async fn test_retain_stops_removed_workers() {
        let (store, router) = router(&["a", "b"], 64);
        router.route("a", b"1".as_slice().into());
        router.route("b", b"1".as_slice().into());
        assert!(eventually(|| async { store.reading_count() == 2 }).await);

        router.retain(&HashSet::from(["a".to_string()]));
        assert_eq!(router.worker_count(), 1);

        router.clear();
        assert_eq!(router.worker_count(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_newest() {
        let (store, router) = router(&["a"], 2);
        // Worker cannot run until this task yields
        for i in 1..=5 {
            router.route("a", format!("{}", i).as_bytes().into());
        }
        assert!(eventually(|| async { store.reading_count() == 2 }).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let values: Vec<f64> = store.readings_for("a").iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_returning_entity_waits_for_retired_worker() {
        let (store, router) = router_with_delay(&["a"], 64, Some(Duration::from_millis(5)));
        for i in 1..=5 {
            router.route("a", format!("{}", i).as_bytes().into());
        }

        // Entity leaves and comes back while its old queue is still draining
        router.retain(&HashSet::new());
        assert_eq!(router.worker_count(), 0);
        for i in 6..=8 {
            router.route("a", format!("{}", i).as_bytes().into());
        }

        assert!(eventually(|| async { store.reading_count() == 8 }).await);
        let values: Vec<f64> = store.readings_for("a").iter().map(|r| r.value).collect();
        assert_eq!(values, (1..=8).map(f64::from).collect::<Vec<_>>());
        assert_eq!(router.worker_count(), 1);
    }
}
