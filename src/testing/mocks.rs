//! Mock implementations for testing
//!
//! Provides a mock broker link and connector so the connection manager,
//! correlator and HTTP API can be exercised without an MQTT broker.

use crate::transport::{BrokerLink, ConnectionState, Connector, InboundMessage, MqttError};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

pub type PublishedMessage = (String, Vec<u8>);

/// Computes broker replies for a publish: `(topic, payload) -> messages`
pub type Responder = Arc<dyn Fn(&str, &[u8]) -> Vec<InboundMessage> + Send + Sync>;

/// In-memory broker link
///
/// Publishes and (un)subscriptions are recorded. Replies produced by the
/// responder are delivered to listeners as soon as the publish is accepted.
pub struct MockLink {
    inbound_tx: StdMutex<Option<broadcast::Sender<InboundMessage>>>,
    state: StdMutex<ConnectionState>,
    responder: StdMutex<Option<Responder>>,
    published: Mutex<Vec<PublishedMessage>>,
    active_subscriptions: Mutex<Vec<String>>,
    subscribe_calls: Mutex<Vec<String>>,
    unsubscribe_calls: Mutex<Vec<String>>,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_disconnect: AtomicBool,
    disconnects: AtomicUsize,
}

impl Default for MockLink {
    fn default() -> Self {
        let (inbound_tx, _) = broadcast::channel(64);
        Self {
            inbound_tx: StdMutex::new(Some(inbound_tx)),
            state: StdMutex::new(ConnectionState::Connected),
            responder: StdMutex::new(None),
            published: Mutex::new(Vec::new()),
            active_subscriptions: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        }
    }
}

impl MockLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A link that answers every publish through `responder`
    pub fn with_responder<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&str, &[u8]) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        let link = Self::default();
        link.set_responder(responder);
        Arc::new(link)
    }

    /// A link that answers every publish on `command_topic` with `reply` on `reply_topic`
    pub fn replying(command_topic: &str, reply_topic: &str, reply: Value) -> Arc<Self> {
        let command_topic = command_topic.to_string();
        let reply_topic = reply_topic.to_string();
        let reply = Bytes::from(reply.to_string());
        Self::with_responder(move |topic, _| {
            if topic == command_topic {
                vec![InboundMessage::new(reply_topic.clone(), reply.clone())]
            } else {
                Vec::new()
            }
        })
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &[u8]) -> Vec<InboundMessage> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.responder.lock() {
            *slot = Some(Arc::new(responder));
        }
    }

    /// Deliver a message as if the broker sent it; returns the listener count
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) -> usize {
        self.deliver(InboundMessage::new(topic, payload))
    }

    fn deliver(&self, message: InboundMessage) -> usize {
        let Ok(sender) = self.inbound_tx.lock() else {
            return 0;
        };
        sender
            .as_ref()
            .and_then(|tx| tx.send(message).ok())
            .unwrap_or(0)
    }

    /// Drop the inbound sender so every listener sees the channel close
    pub fn close_inbound(&self) {
        if let Ok(mut sender) = self.inbound_tx.lock() {
            sender.take();
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub async fn get_published_messages(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Published payloads on `topic`, parsed as JSON
    pub async fn published_json(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.active_subscriptions.lock().await.clone()
    }

    pub async fn subscribe_calls(&self) -> Vec<String> {
        self.subscribe_calls.lock().await.clone()
    }

    pub async fn unsubscribe_calls(&self) -> Vec<String> {
        self.unsubscribe_calls.lock().await.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub async fn clear_history(&self) {
        self.published.lock().await.clear();
        self.subscribe_calls.lock().await.clear();
        self.unsubscribe_calls.lock().await.clear();
    }

    fn current_state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }
}

#[async_trait]
impl BrokerLink for MockLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let state = self.current_state();
        if !state.can_publish() {
            return Err(MqttError::NotConnected { state });
        }
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailed("mock publish failure".to_string()));
        }

        let replies = self
            .responder
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .map(|responder| responder(topic, &payload))
            .unwrap_or_default();

        self.published
            .lock()
            .await
            .push((topic.to_string(), payload));

        for reply in replies {
            self.deliver(reply);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.subscribe_calls.lock().await.push(topic.to_string());
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailed(
                "mock subscribe failure".to_string(),
            ));
        }

        let mut active = self.active_subscriptions.lock().await;
        if !active.iter().any(|t| t == topic) {
            active.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.unsubscribe_calls.lock().await.push(topic.to_string());
        self.active_subscriptions
            .lock()
            .await
            .retain(|t| t != topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailed(
                "mock disconnect failure".to_string(),
            ));
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        match self.inbound_tx.lock() {
            Ok(sender) => sender
                .as_ref()
                .map(broadcast::Sender::subscribe)
                .unwrap_or_else(closed_receiver),
            Err(_) => closed_receiver(),
        }
    }

    fn state(&self) -> ConnectionState {
        self.current_state()
    }
}

fn closed_receiver() -> broadcast::Receiver<InboundMessage> {
    let (_tx, rx) = broadcast::channel(1);
    rx
}

/// Connector handing out a shared [`MockLink`]
///
/// The link can be swapped between opens to model a reconnect that lands on
/// a fresh session.
pub struct MockConnector {
    link: StdMutex<Arc<MockLink>>,
    should_fail: AtomicBool,
    open_delay: StdMutex<Duration>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new(link: Arc<MockLink>) -> Arc<Self> {
        Arc::new(Self {
            link: StdMutex::new(link),
            should_fail: AtomicBool::new(false),
            open_delay: StdMutex::new(Duration::ZERO),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn with_failure() -> Arc<Self> {
        let connector = Self::new(MockLink::new());
        connector.set_should_fail(true);
        connector
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Make every `open` take `delay` before answering
    pub fn set_open_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.open_delay.lock() {
            *current = delay;
        }
    }

    /// Hand out `link` from the next `open` on
    pub fn replace_link(&self, link: Arc<MockLink>) {
        if let Ok(mut current) = self.link.lock() {
            *current = link;
        }
    }

    /// The link the next `open` hands out
    pub fn link(&self) -> Arc<MockLink> {
        match self.link.lock() {
            Ok(link) => link.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<Arc<dyn BrokerLink>, MqttError> {
        let delay = self
            .open_delay
            .lock()
            .map(|delay| *delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailed(
                "mock connection refused".to_string(),
            ));
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let link = self.link();
        link.set_state(ConnectionState::Connected);
        Ok(link)
    }
}
