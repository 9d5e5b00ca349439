//! Impure I/O operations for the broker link
//!
//! This module owns the rumqttc client and its event loop task. Incoming
//! publishes are fanned out over a broadcast channel so any number of
//! waiters can observe them without registering callbacks.

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig, TlsMaterial,
};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::BrokerSection;
use crate::mqtt_span;
use crate::observability::metrics::metrics;
use crate::transport::{BrokerLink, Connector, InboundMessage};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Slow receivers lag (and skip) once this many messages are buffered
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// How long `disconnect` waits for the event loop to flush DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Live rumqttc connection to the broker
pub struct MqttLink {
    client: AsyncClient,
    inbound_tx: broadcast::Sender<InboundMessage>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
    subscribed_topics: Arc<Mutex<Vec<String>>>, // Re-issued after every CONNACK
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Everything the event loop task needs, moved into it at spawn
struct EventLoopContext {
    client: AsyncClient,
    inbound_tx: broadcast::Sender<InboundMessage>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    reconnect_config: ReconnectConfig,
    ready_tx: Option<oneshot::Sender<Result<(), String>>>,
}

impl MqttLink {
    /// Spawn the event loop and wait for the broker to accept the session
    ///
    /// A refused or failed handshake stops the event loop; nothing is retried.
    pub async fn open(
        options: MqttOptions,
        connect_timeout: Duration,
        reconnect_config: ReconnectConfig,
    ) -> Result<Self, MqttError> {
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let subscribed_topics = Arc::new(Mutex::new(Vec::new()));

        let context = EventLoopContext {
            client: client.clone(),
            inbound_tx: inbound_tx.clone(),
            state_tx,
            shutdown_rx,
            closing: closing.clone(),
            subscribed_topics: subscribed_topics.clone(),
            reconnect_config,
            ready_tx: Some(ready_tx),
        };
        let handle = tokio::spawn(Self::run_event_loop(event_loop, context));

        let link = MqttLink {
            client,
            inbound_tx,
            state_rx,
            shutdown_tx,
            closing,
            subscribed_topics,
            event_loop_handle: Mutex::new(Some(handle)),
        };

        match Self::wait_for_connection_confirmation(ready_rx, connect_timeout).await {
            Ok(()) => Ok(link),
            Err(e) => {
                link.stop_event_loop().await;
                Err(e)
            }
        }
    }

    /// Wait for the handshake outcome reported by the event loop
    async fn wait_for_connection_confirmation(
        ready_rx: oneshot::Receiver<Result<(), String>>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(MqttError::ConnectionFailed(reason)),
            Ok(Err(_)) => Err(MqttError::ConnectionFailed(
                "event loop stopped before CONNACK".to_string(),
            )),
            Err(_) => Err(MqttError::ConnAckTimeout(timeout)),
        }
    }

    async fn run_event_loop(mut event_loop: EventLoop, mut ctx: EventLoopContext) {
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                changed = ctx.shutdown_rx.changed() => {
                    if changed.is_err() || *ctx.shutdown_rx.borrow() {
                        debug!(target: "mqtt_transport", "Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                event_result = event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            if !Self::process_event_route(route, &mut ctx, &mut reconnect_attempts).await {
                                break;
                            }
                        }
                        Err(e) => {
                            if let Some(ready_tx) = ctx.ready_tx.take() {
                                let _ = ready_tx.send(Err(e.to_string()));
                                break;
                            }
                            if ctx.closing.load(Ordering::Acquire) {
                                break;
                            }

                            reconnect_attempts += 1;
                            let _ = ctx.state_tx.send(ConnectionState::Reconnecting(reconnect_attempts));
                            let delay_ms = ctx.reconnect_config.calculate_backoff_delay(reconnect_attempts);
                            error!(
                                attempt = reconnect_attempts,
                                delay_ms,
                                "MQTT event loop error: {}", e
                            );

                            if !Self::interruptible_sleep(ctx.shutdown_rx.clone(), delay_ms).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let _ = ctx.state_tx.send(ConnectionState::Disconnected);
        metrics().set_mqtt_connected(false);
        info!("MQTT event loop stopped");
    }

    /// Act on one routed event; returns false to stop the event loop
    async fn process_event_route(
        route: EventRoute,
        ctx: &mut EventLoopContext,
        reconnect_attempts: &mut u32,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                let _ = ctx.state_tx.send(ConnectionState::Connected);
                metrics().set_mqtt_connected(true);
                *reconnect_attempts = 0;

                match ctx.ready_tx.take() {
                    Some(ready_tx) => {
                        info!(session_present, "MQTT session established");
                        let _ = ready_tx.send(Ok(()));
                    }
                    None => {
                        info!(session_present, "MQTT session restored");
                        Self::resubscribe_to_topics(&ctx.client, &ctx.subscribed_topics).await;
                    }
                }
                true
            }
            EventRoute::ConnectionRefused(reason) => {
                if let Some(ready_tx) = ctx.ready_tx.take() {
                    let _ = ready_tx.send(Err(format!("connection refused: {reason}")));
                    return false;
                }
                warn!("Broker refused reconnection: {}", reason);
                let _ = ctx.state_tx.send(ConnectionState::Disconnected);
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                metrics().mqtt_message_received();
                info!(
                    topic = %topic,
                    bytes = payload.len(),
                    "Received data from topic: {}", topic
                );
                let message = InboundMessage {
                    topic,
                    payload,
                    retain,
                    received_at: chrono::Utc::now(),
                };
                // No receivers is fine: nobody is waiting on a response right now
                let _ = ctx.inbound_tx.send(message);
                true
            }
            EventRoute::Disconnected => {
                warn!("MQTT broker disconnected the bridge");
                let _ = ctx.state_tx.send(ConnectionState::Disconnected);
                metrics().set_mqtt_connected(false);
                true
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                rejected,
            } => {
                if rejected {
                    warn!(packet_id, "Broker rejected subscription");
                } else {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::DisconnectSent => {
                debug!(target: "mqtt_transport", "DISCONNECT sent");
                false
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Runs inside the event loop, so requests must not wait for channel capacity
    async fn resubscribe_to_topics(client: &AsyncClient, topics: &Mutex<Vec<String>>) {
        let topics = topics.lock().await;
        for topic in topics.iter() {
            if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }

    async fn stop_event_loop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            handle.abort();
        }
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self.state_rx.borrow().clone();
        if !state.can_publish() {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.check_connection_state()?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.check_connection_state()?;
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;

        let mut topics = self.subscribed_topics.lock().await;
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client.unsubscribe(topic).await?;
        self.subscribed_topics.lock().await.retain(|t| t != topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.closing.store(true, Ordering::Release);
        if let Err(e) = self.client.disconnect().await {
            self.closing.store(false, Ordering::Release);
            return Err(e.into());
        }

        let handle = self.event_loop_handle.lock().await.take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }

    fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut guard) = self.event_loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Opens mutual-TLS sessions to AWS IoT Core from the `[broker]` section
pub struct MqttConnector {
    broker: BrokerSection,
    reconnect_config: ReconnectConfig,
}

impl MqttConnector {
    pub fn new(broker: BrokerSection) -> Self {
        Self {
            broker,
            reconnect_config: ReconnectConfig::default(),
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn open(&self) -> Result<Arc<dyn BrokerLink>, MqttError> {
        let tls = TlsMaterial::load(&self.broker)?;
        let options = configure_mqtt_options(&self.broker, tls)?;
        let (host, port) = options.broker_address();

        info!(
            client_id = %self.broker.client_id,
            host = %host,
            port,
            "Opening MQTT session"
        );

        let link = MqttLink::open(
            options,
            self.broker.connect_timeout(),
            self.reconnect_config.clone(),
        )
        .instrument(mqtt_span!(operation = "open", client_id = %self.broker.client_id))
        .await?;
        Ok(Arc::new(link))
    }
}
