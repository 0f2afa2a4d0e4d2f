//! Bridge lifecycle

use crate::{
    BridgeConfig, BridgeError, BrokerTransport, ConnectionPool, EntityDirectory, EntityRouter, ReadingPipeline,
    SyncReport, Synchronizer,
};
use alerting::AlertState;
use notifier::{Dispatcher, PushTransport};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use storage::{ConfigStore, ReadingStore, TargetStore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// External collaborators the bridge is wired to
pub struct BridgeDeps {
    pub config_store: Arc<dyn ConfigStore>,
    pub readings: Arc<dyn ReadingStore>,
    pub targets: Arc<dyn TargetStore>,
    pub transport: Arc<dyn BrokerTransport>,
    /// Push service, `None` when notifications are disabled
    pub push: Option<Arc<dyn PushTransport>>,
}

/// Point-in-time bridge status
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub connections: usize,
    /// Connections the broker has acknowledged
    pub connected: usize,
    pub entities: usize,
}

/// Telemetry bridge: owns the connection pool, synchronizer, and reading pipeline
pub struct Bridge {
    config: BridgeConfig,
    pool: Arc<ConnectionPool>,
    directory: Arc<EntityDirectory>,
    router: Arc<EntityRouter>,
    pipeline: Arc<ReadingPipeline>,
    sync: Arc<Synchronizer>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, deps: BridgeDeps) -> Self {
        let directory = Arc::new(EntityDirectory::new());
        let dispatcher = Arc::new(Dispatcher::new(deps.push, deps.targets, config.push_timeout()));
        let pipeline = Arc::new(ReadingPipeline::new(
            &config,
            directory.clone(),
            deps.readings,
            deps.config_store.clone(),
            dispatcher,
        ));
        let router = Arc::new(EntityRouter::new(pipeline.clone(), config.queue_depth()));
        let pool = Arc::new(ConnectionPool::new(deps.transport, router.clone()));
        let sync = Arc::new(Synchronizer::new(
            deps.config_store,
            pool.clone(),
            directory.clone(),
            router.clone(),
            pipeline.clone(),
            config.store_timeout(),
        ));

        Self {
            config,
            pool,
            directory,
            router,
            pipeline,
            sync,
            task: Mutex::new(None),
        }
    }

    /// Start periodic synchronization; the first pass runs immediately
    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }

        let sync = self.sync.clone();
        let period = self.config.refresh_interval();
        info!("Starting bridge, refresh every {:?}", period);

        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = sync.refresh().await {
                    error!("Synchronization failed: {}", e);
                }
            }
        }));
    }

    /// Run one synchronization pass now
    pub async fn refresh(&self) -> Result<SyncReport, BridgeError> {
        self.sync.refresh().await
    }

    /// On-demand resynchronization for collaborators.
    ///
    /// Safe while a periodic pass is running; it waits for that pass and then runs.
    pub async fn reload(&self) -> Result<SyncReport, BridgeError> {
        info!("Reload requested");
        self.sync.refresh().await
    }

    /// Stop synchronizing and close every connection
    pub async fn stop(&self) {
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            task.abort();
        }
        self.pool.close_all().await;
        self.router.clear();
        info!("Bridge stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().map_or(false, |t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// In-memory alert state of every evaluated entity
    pub fn alert_states(&self) -> Vec<(String, AlertState)> {
        let mut states = self.pipeline.alert_states();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            running: self.is_running(),
            connections: self.pool.len(),
            connected: self.pool.connected(),
            entities: self.directory.len(),
        }
    }
}
