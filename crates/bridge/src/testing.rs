//! In-process fakes for broker and push transports

use crate::{
    BridgeError, BrokerSession, BrokerTransport, ConnectionKey, Credentials, InboundMessage, MessageHandler,
    MessageSink,
};
use async_trait::async_trait;
use notifier::{PushError, PushPayload, PushTransport, TokenOutcome};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Broker session that delivers only what tests publish
pub struct FakeSession {
    pub key: ConnectionKey,
    handler: MessageHandler,
    subscribed: Mutex<BTreeSet<String>>,
    subscribe_calls: AtomicUsize,
    disconnected: AtomicBool,
}

impl FakeSession {
    /// Deliver a message the way a broker would
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        if self.is_disconnected() || !self.subscribed.lock().unwrap().contains(topic) {
            return;
        }
        self.deliver_anyway(topic, payload);
    }

    /// Invoke the handler regardless of session state
    pub fn deliver_anyway(&self, topic: &str, payload: &[u8]) {
        (self.handler)(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subscribed.lock().unwrap().clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.subscribed.lock().unwrap().insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError> {
        self.subscribed.lock().unwrap().remove(topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.is_disconnected()
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Broker transport recording every session it creates
#[derive(Default)]
pub struct FakeTransport {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Delay every connect attempt, successful or not
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn disconnect_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.is_disconnected())
            .count()
    }

    /// Latest session for a key
    pub fn session(&self, key: &ConnectionKey) -> Option<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| &s.key == key)
            .cloned()
    }

    pub fn live_sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.is_disconnected())
            .cloned()
            .collect()
    }

    /// Publish on every live session
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        for session in self.live_sessions() {
            session.publish(topic, payload);
        }
    }
}

#[async_trait]
impl BrokerTransport for FakeTransport {
    async fn connect(
        &self,
        key: &ConnectionKey,
        _credentials: &Credentials,
        on_message: MessageHandler,
    ) -> Result<Arc<dyn BrokerSession>, BridgeError> {
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection("refused".to_string()));
        }
        let session = Arc::new(FakeSession {
            key: key.clone(),
            handler: on_message,
            subscribed: Mutex::new(BTreeSet::new()),
            subscribe_calls: AtomicUsize::new(0),
            disconnected: AtomicBool::new(false),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

/// Sink recording routed messages
#[derive(Default)]
pub struct RecordingSink {
    routed: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn routed(&self) -> Vec<(String, Vec<u8>)> {
        self.routed.lock().unwrap().clone()
    }
}

impl MessageSink for RecordingSink {
    fn route(&self, entity_id: &str, payload: Arc<[u8]>) {
        self.routed
            .lock()
            .unwrap()
            .push((entity_id.to_string(), payload.to_vec()));
    }
}

/// Push transport recording every multicast
#[derive(Default)]
pub struct RecordingPush {
    pub unregistered: HashSet<String>,
    sent: Mutex<Vec<(Vec<String>, PushPayload)>>,
}

impl RecordingPush {
    pub fn sent(&self) -> Vec<(Vec<String>, PushPayload)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushTransport for RecordingPush {
    async fn multicast(&self, tokens: &[String], payload: &PushPayload) -> Result<Vec<TokenOutcome>, PushError> {
        self.sent.lock().unwrap().push((tokens.to_vec(), payload.clone()));
        Ok(tokens
            .iter()
            .map(|t| {
                if self.unregistered.contains(t) {
                    TokenOutcome::Unregistered
                } else {
                    TokenOutcome::Delivered
                }
            })
            .collect())
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
