//! Connection Pool Manager

use crate::{
    BridgeError, BrokerSession, BrokerTransport, ConnectionKey, Credentials, InboundMessage, MessageHandler,
    TopicIndex,
};
use metrics::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Receives routed messages, one call per subscribed entity
pub trait MessageSink: Send + Sync {
    fn route(&self, entity_id: &str, payload: Arc<[u8]>);
}

/// Routing state shared between a connection and its message handler
#[derive(Default)]
struct RouteTable {
    index: RwLock<Arc<TopicIndex>>,
    closed: AtomicBool,
}

impl RouteTable {
    fn snapshot(&self) -> Arc<TopicIndex> {
        match self.index.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, index: TopicIndex) {
        let index = Arc::new(index);
        match self.index.write() {
            Ok(mut guard) => *guard = index,
            Err(poisoned) => *poisoned.into_inner() = index,
        }
    }

    fn dispatch(&self, message: InboundMessage, sink: &dyn MessageSink) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        counter!("bridge_messages_received_total").increment(1);

        let index = self.snapshot();
        match index.entities(&message.topic) {
            Some(entities) => {
                let payload: Arc<[u8]> = message.payload.into();
                for entity_id in entities {
                    sink.route(entity_id, payload.clone());
                }
            }
            None => debug!(topic = %message.topic, "No entities for topic"),
        }
    }
}

/// One live broker connection
pub struct Connection {
    key: ConnectionKey,
    session: Arc<dyn BrokerSession>,
    routes: Arc<RouteTable>,
    /// Topics with a subscription request accepted by the session
    subscribed: Mutex<HashSet<String>>,
}

impl Connection {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Point-in-time copy of the topic index
    pub fn index(&self) -> Arc<TopicIndex> {
        self.routes.snapshot()
    }

    /// Swap in a new topic index
    pub fn replace_index(&self, index: TopicIndex) {
        self.routes.replace(index);
    }

    pub fn subscribed_topics(&self) -> HashSet<String> {
        self.subscribed.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.routes.closed.load(Ordering::Acquire)
    }

    /// Open and acknowledged by the broker
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.session.is_connected()
    }

    /// Subscribe to `topic` unless already subscribed; returns whether a request was made
    pub async fn subscribe(&self, topic: &str) -> Result<bool, BridgeError> {
        if self.subscribed_topics().contains(topic) {
            return Ok(false);
        }
        self.session.subscribe(topic).await?;
        if let Ok(mut subscribed) = self.subscribed.lock() {
            subscribed.insert(topic.to_string());
        }
        debug!(connection = %self.key, topic, "Subscribed");
        Ok(true)
    }

    /// Unsubscribe from `topic`; the topic is forgotten even if the request fails
    pub async fn unsubscribe(&self, topic: &str) {
        if let Ok(mut subscribed) = self.subscribed.lock() {
            subscribed.remove(topic);
        }
        if let Err(e) = self.session.unsubscribe(topic).await {
            warn!(connection = %self.key, topic, "Unsubscribe failed: {}", e);
        }
    }

    /// Stop delivery immediately, then close the session
    async fn close(&self) {
        self.routes.closed.store(true, Ordering::Release);
        self.routes.replace(TopicIndex::new());
        if let Ok(mut subscribed) = self.subscribed.lock() {
            subscribed.clear();
        }
        self.session.disconnect().await;
        info!(connection = %self.key, "Connection closed");
    }
}

async fn open(
    transport: &dyn BrokerTransport,
    sink: Arc<dyn MessageSink>,
    key: &ConnectionKey,
    credentials: &Credentials,
) -> Result<Arc<Connection>, BridgeError> {
    let routes = Arc::new(RouteTable::default());

    let handler: MessageHandler = {
        let routes = routes.clone();
        Arc::new(move |message: InboundMessage| routes.dispatch(message, sink.as_ref()))
    };

    let session = transport.connect(key, credentials, handler).await?;
    info!(connection = %key, "Connection opened");

    Ok(Arc::new(Connection {
        key: key.clone(),
        session,
        routes,
        subscribed: Mutex::new(HashSet::new()),
    }))
}

/// Outcome of one converge call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    pub opened: usize,
    pub closed: usize,
    pub failed: usize,
    pub unchanged: usize,
}

/// Owns exactly one connection per required connection key
pub struct ConnectionPool {
    transport: Arc<dyn BrokerTransport>,
    sink: Arc<dyn MessageSink>,
    connections: RwLock<HashMap<ConnectionKey, Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn BrokerTransport>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            transport,
            sink,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Live connection for a key
    pub fn resolve(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.read().ok()?.get(key).cloned()
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connections the broker has acknowledged
    pub fn connected(&self) -> usize {
        self.connections
            .read()
            .map(|c| c.values().filter(|c| c.is_connected()).count())
            .unwrap_or(0)
    }

    /// Keys of all live connections
    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.connections
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Converge to exactly the `desired` keys.
    ///
    /// Connections whose key is still desired are left untouched. Failed
    /// opens are reported and retried on the next call.
    pub async fn converge(&self, desired: &HashMap<ConnectionKey, Credentials>) -> ConvergeReport {
        let mut report = ConvergeReport::default();

        let stale: Vec<Arc<Connection>> = match self.connections.write() {
            Ok(mut connections) => {
                let keys: Vec<_> = connections
                    .keys()
                    .filter(|key| !desired.contains_key(*key))
                    .cloned()
                    .collect();
                keys.iter().filter_map(|key| connections.remove(key)).collect()
            }
            Err(_) => Vec::new(),
        };

        for connection in stale {
            connection.close().await;
            report.closed += 1;
        }

        // Opens run concurrently so a slow broker never delays the others
        let mut opening = JoinSet::new();
        for (key, credentials) in desired {
            if self.resolve(key).is_some() {
                report.unchanged += 1;
                continue;
            }
            let transport = self.transport.clone();
            let sink = self.sink.clone();
            let key = key.clone();
            let credentials = credentials.clone();
            opening.spawn(async move {
                let result = open(transport.as_ref(), sink, &key, &credentials).await;
                (key, result)
            });
        }

        while let Some(joined) = opening.join_next().await {
            match joined {
                Ok((key, Ok(connection))) => {
                    if let Ok(mut connections) = self.connections.write() {
                        connections.insert(key, connection);
                    }
                    report.opened += 1;
                }
                Ok((key, Err(e))) => {
                    warn!(connection = %key, "Failed to open connection: {}", e);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Connection open task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        gauge!("bridge_connections").set(self.len() as f64);
        if report.opened > 0 || report.closed > 0 || report.failed > 0 {
            info!(
                opened = report.opened,
                closed = report.closed,
                failed = report.failed,
                unchanged = report.unchanged,
                "Connection pool converged"
            );
        }
        report
    }

    /// Close every connection
    pub async fn close_all(&self) {
        let all: Vec<Arc<Connection>> = match self.connections.write() {
            Ok(mut connections) => connections.drain().map(|(_, c)| c).collect(),
            Err(_) => Vec::new(),
        };
        for connection in all {
            connection.close().await;
        }
        gauge!("bridge_connections").set(0.0);
    }
}
