//! rumqttc-backed broker transport

use crate::{
    BridgeConfig, BridgeError, BrokerSession, BrokerTransport, ConnectionKey, Credentials, InboundMessage,
    MessageHandler,
};
use async_trait::async_trait;
use metrics::counter;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broker connection settings shared by every session
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub keep_alive: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Bound on waiting for room in the client request channel
    pub request_timeout: Duration,
    pub client_id_prefix: String,
    /// Capacity of the client request channel
    pub request_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for MqttSettings {
    fn from(config: &BridgeConfig) -> Self {
        let reconnect_min = Duration::from_secs(config.reconnect_min_secs.max(1));
        Self {
            keep_alive: Duration::from_secs(config.keep_alive_secs.max(5)),
            reconnect_min,
            reconnect_max: Duration::from_secs(config.reconnect_max_secs).max(reconnect_min),
            request_timeout: Duration::from_secs(10),
            client_id_prefix: config.client_id_prefix.clone(),
            request_capacity: 64,
        }
    }
}

/// Opens one rumqttc client per connection key
pub struct MqttTransport {
    settings: MqttSettings,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self, key: &ConnectionKey, credentials: &Credentials) -> MqttOptions {
        let client_id = format!("{}-{}", self.settings.client_id_prefix, Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, key.endpoint.host.clone(), key.endpoint.port);
        options.set_keep_alive(self.settings.keep_alive);
        // Subscriptions are restored explicitly after every ConnAck
        options.set_clean_session(true);
        if let Some(username) = &credentials.username {
            options.set_credentials(username.clone(), credentials.password.clone().unwrap_or_default());
        }
        if key.endpoint.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    /// Returns as soon as the event loop is running; the broker handshake
    /// and every retry happen in the background.
    async fn connect(
        &self,
        key: &ConnectionKey,
        credentials: &Credentials,
        on_message: MessageHandler,
    ) -> Result<Arc<dyn BrokerSession>, BridgeError> {
        let (client, eventloop) = AsyncClient::new(self.options(key, credentials), self.settings.request_capacity);
        let state = Arc::new(SessionState::default());

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            state.clone(),
            on_message,
            self.settings.clone(),
            key.to_string(),
        ));
        debug!(connection = %key, "Connecting to broker");

        Ok(Arc::new(MqttSession {
            client,
            state,
            request_timeout: self.settings.request_timeout,
            task: Mutex::new(Some(task)),
        }))
    }
}

/// State shared between a session handle and its event loop
#[derive(Default)]
struct SessionState {
    /// Topics to restore after every ConnAck
    topics: Mutex<HashSet<String>>,
    connected: AtomicBool,
}

impl SessionState {
    fn track(&self, topic: &str) {
        if let Ok(mut topics) = self.topics.lock() {
            topics.insert(topic.to_string());
        }
    }

    fn untrack(&self, topic: &str) {
        if let Ok(mut topics) = self.topics.lock() {
            topics.remove(topic);
        }
    }

    fn tracked(&self) -> Vec<String> {
        self.topics.lock().map(|t| t.iter().cloned().collect()).unwrap_or_default()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Re-send every tracked subscription, waiting for room in the request channel
async fn resubscribe(client: AsyncClient, topics: Vec<String>, connection: String) {
    let total = topics.len();
    for topic in topics {
        if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
            warn!(connection = %connection, topic = %topic, "Resubscribe failed: {}", e);
            return;
        }
    }
    debug!(connection = %connection, topics = total, "Resubscribed");
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<SessionState>,
    on_message: MessageHandler,
    settings: MqttSettings,
    connection: String,
) {
    let mut backoff = settings.reconnect_min;
    let mut restoring: Option<JoinHandle<()>> = None;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                on_message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff = settings.reconnect_min;
                // Set before the snapshot so concurrent subscribes are never missed
                state.connected.store(true, Ordering::SeqCst);
                info!(connection = %connection, "Connected to broker");

                // Clean sessions lose subscriptions on reconnect. The request
                // channel is drained by this loop, so restore from another task.
                if let Some(task) = restoring.take() {
                    task.abort();
                }
                let topics = state.tracked();
                if !topics.is_empty() {
                    restoring = Some(tokio::spawn(resubscribe(client.clone(), topics, connection.clone())));
                }
            }
            Ok(event) => debug!(connection = %connection, "MQTT event: {:?}", event),
            Err(e) => {
                counter!("bridge_connection_errors_total").increment(1);
                if state.connected.swap(false, Ordering::SeqCst) {
                    warn!(connection = %connection, "Lost broker connection, retrying in {:?}: {}", backoff, e);
                } else {
                    warn!(connection = %connection, "Broker connect failed, retrying in {:?}: {}", backoff, e);
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(settings.reconnect_max);
            }
        }
    }
}

/// A rumqttc client with its event loop task
pub struct MqttSession {
    client: AsyncClient,
    state: Arc<SessionState>,
    request_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.state.track(topic);
        if !self.state.is_connected() {
            // Sent with the other tracked topics on the next ConnAck
            return Ok(());
        }

        let request = self.client.subscribe(topic, QoS::AtLeastOnce);
        let reason = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("request channel full for {:?}", self.request_timeout),
        };
        self.state.untrack(topic);
        Err(BridgeError::Subscribe {
            topic: topic.to_string(),
            reason,
        })
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.state.untrack(topic);
        if !self.state.is_connected() {
            return Ok(());
        }
        match tokio::time::timeout(self.request_timeout, self.client.unsubscribe(topic)).await {
            Ok(result) => result.map_err(|e| BridgeError::Connection(e.to_string())),
            Err(_) => Err(BridgeError::Timeout(self.request_timeout.as_millis() as u64)),
        }
    }

    fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn disconnect(&self) {
        if let Ok(mut topics) = self.state.topics.lock() {
            topics.clear();
        }
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request failed: {}", e);
        }
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            task.abort();
        }
        self.state.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::eventually;
    use crate::BrokerEndpoint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, oneshot};

    #[test]
    fn test_settings_from_config() {
        let config = BridgeConfig {
            keep_alive_secs: 1,
            reconnect_min_secs: 5,
            reconnect_max_secs: 2,
            ..Default::default()
        };
        let settings = MqttSettings::from(&config);
        assert_eq!(settings.keep_alive, Duration::from_secs(5));
        assert_eq!(settings.reconnect_max, Duration::from_secs(5));
        assert_eq!(settings.client_id_prefix, "telemetry-bridge");
    }

    #[tokio::test]
    async fn test_unreachable_broker_does_not_block_connect() {
        let transport = MqttTransport::new(MqttSettings::default());
        let key = ConnectionKey::new(BrokerEndpoint::parse("mqtt://127.0.0.1:1").unwrap(), &Credentials::default());
        let handler: MessageHandler = Arc::new(|_| {});

        let session = tokio::time::timeout(
            Duration::from_secs(1),
            transport.connect(&key, &Credentials::default(), handler),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!session.is_connected());

        // Tracked until the broker answers
        tokio::time::timeout(Duration::from_secs(1), session.subscribe("site/level"))
            .await
            .unwrap()
            .unwrap();
        session.disconnect().await;
    }

    /// Read one MQTT control packet as (fixed header byte, body)
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn subscribe_filters(body: &[u8]) -> Vec<String> {
        let mut filters = Vec::new();
        let mut at = 2;
        while at + 2 <= body.len() {
            let len = u16::from_be_bytes([body[at], body[at + 1]]) as usize;
            at += 2;
            filters.push(String::from_utf8_lossy(&body[at..at + len]).into_owned());
            // Skip the requested QoS byte
            at += len + 1;
        }
        filters
    }

    /// Minimal broker session: acknowledges everything and reports subscribed filters
    async fn serve(
        stream: &mut TcpStream,
        session: usize,
        seen: &mpsc::UnboundedSender<(usize, String)>,
        mut hang_up: Option<oneshot::Receiver<()>>,
    ) {
        loop {
            let packet = match hang_up.as_mut() {
                Some(signal) => tokio::select! {
                    _ = signal => return,
                    packet = read_packet(stream) => packet,
                },
                None => read_packet(stream).await,
            };
            let Ok((header, body)) = packet else {
                return;
            };

            let reply = match header >> 4 {
                1 => vec![0x20, 0x02, 0x00, 0x00],
                8 => {
                    for filter in subscribe_filters(&body) {
                        let _ = seen.send((session, filter));
                    }
                    vec![0x90, 0x03, body[0], body[1], 0x01]
                }
                10 => vec![0xB0, 0x02, body[0], body[1]],
                12 => vec![0xD0, 0x00],
                _ => continue,
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    async fn filters_of_session(
        seen: &mut mpsc::UnboundedReceiver<(usize, String)>,
        session: usize,
        count: usize,
    ) -> HashSet<String> {
        let mut filters = HashSet::new();
        let deadline = tokio::time::sleep(Duration::from_secs(10));
        tokio::pin!(deadline);
        while filters.len() < count {
            tokio::select! {
                _ = &mut deadline => break,
                received = seen.recv() => match received {
                    Some((s, filter)) if s == session => {
                        filters.insert(filter);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
        filters
    }

    #[tokio::test]
    async fn test_reconnect_restores_every_tracked_topic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let (hang_up_tx, hang_up_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut hang_up = Some(hang_up_rx);
            for session in 1.. {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                serve(&mut stream, session, &seen_tx, hang_up.take()).await;
            }
        });

        let settings = MqttSettings {
            reconnect_min: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(200),
            ..MqttSettings::default()
        };
        let transport = MqttTransport::new(settings);
        let endpoint = BrokerEndpoint::parse(&format!("mqtt://127.0.0.1:{}", port)).unwrap();
        let key = ConnectionKey::new(endpoint, &Credentials::default());
        let session = transport
            .connect(&key, &Credentials::default(), Arc::new(|_| {}))
            .await
            .unwrap();
        assert!(eventually(|| async { session.is_connected() }).await);

        // More topics than the client request channel holds
        let topics: HashSet<String> = (0..150).map(|i| format!("site/tank-{}", i)).collect();
        for topic in &topics {
            session.subscribe(topic).await.unwrap();
        }
        assert_eq!(filters_of_session(&mut seen, 1, topics.len()).await, topics);

        hang_up_tx.send(()).unwrap();
        assert_eq!(filters_of_session(&mut seen, 2, topics.len()).await, topics);
        assert!(session.is_connected());

        session.disconnect().await;
        assert!(!session.is_connected());
    }
}
