//! Request/response correlation over publish/subscribe
//!
//! A command published on the command topic is answered, some time later,
//! on the response topic. The [`Correlator`] arms a waiter on the reply
//! topic before publishing, then resolves it exactly once: with the first
//! message on that topic, or with nothing when the deadline passes.
//!
//! ```text
//! arm(reply topic) ──► publish(command) ──► first message | deadline ──► release
//! ```

pub mod matcher;
pub mod subscriptions;

pub use matcher::{ResponseMatcher, Resolution};
pub use subscriptions::{SubscriptionLease, SubscriptionRegistry};

use crate::command_span;
use crate::config::{CorrelationSection, TopicsSection};
use crate::error::BridgeError;
use crate::observability::metrics::metrics;
use crate::transport::{BrokerLink, ConnectionManager, InboundMessage};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// A waiter armed on a reply topic
struct ResponseWaiter {
    id: Uuid,
    lease: SubscriptionLease,
    messages: broadcast::Receiver<InboundMessage>,
    started: Instant,
}

pub struct Correlator {
    connections: Arc<ConnectionManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    matcher: ResponseMatcher,
    command_topic: String,
    response_topic: String,
    timeout: Duration,
}

impl Correlator {
    pub fn new(
        connections: Arc<ConnectionManager>,
        topics: &TopicsSection,
        correlation: &CorrelationSection,
    ) -> Self {
        Self {
            connections,
            subscriptions: Arc::new(SubscriptionRegistry::new(topics.auto_subscribe())),
            matcher: ResponseMatcher::new(correlation.response_ids.iter().cloned()),
            command_topic: topics.command.clone(),
            response_topic: topics.response.clone(),
            timeout: correlation.response_timeout(),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Publish `payload` as JSON on `topic`
    ///
    /// Only the command topic waits for a reply; anything else is
    /// fire-and-forget and yields `None`.
    pub async fn publish<T>(&self, topic: &str, payload: &T) -> Result<Option<Value>, BridgeError>
    where
        T: Serialize + ?Sized,
    {
        let link = self.connections.ensure_connected().await?;
        let bytes = serde_json::to_vec(payload)?;

        if topic != self.command_topic {
            send(&link, topic, bytes).await?;
            return Ok(None);
        }

        // Armed before publishing so a fast reply cannot slip past
        let waiter = self.arm(&link, &self.response_topic).await?;
        if let Err(e) = send(&link, topic, bytes).await {
            metrics().command_rejected();
            self.finish(waiter, Resolution::ConnectionClosed).await;
            return Err(e);
        }
        metrics().command_published();

        let resolution = self.resolve(waiter, self.timeout).await;
        Ok(resolution.into_data())
    }

    /// Wait for the first message on `response_topic`, bounded by `timeout`
    ///
    /// The topic is subscribed for the duration of the wait and released on
    /// every path.
    pub async fn wait_for_response(
        &self,
        response_topic: &str,
        timeout: Duration,
    ) -> Result<Resolution, BridgeError> {
        let link = self.connections.ensure_connected().await?;
        let waiter = self.arm(&link, response_topic).await?;
        Ok(self.resolve(waiter, timeout).await)
    }

    async fn arm(
        &self,
        link: &Arc<dyn BrokerLink>,
        topic: &str,
    ) -> Result<ResponseWaiter, BridgeError> {
        // Listener first, then the broker subscription
        let messages = link.messages();
        let lease = self.subscriptions.acquire(link, topic).await?;
        metrics().wait_started();

        let id = Uuid::new_v4();
        debug!(waiter = %id, topic = %topic, "Response waiter armed");
        Ok(ResponseWaiter {
            id,
            lease,
            messages,
            started: Instant::now(),
        })
    }

    async fn resolve(&self, mut waiter: ResponseWaiter, timeout: Duration) -> Resolution {
        let span = command_span!(waiter = %waiter.id, topic = %waiter.lease.topic());
        let topic = waiter.lease.topic().to_string();

        let resolution = async {
            match tokio::time::timeout(timeout, next_on_topic(&mut waiter.messages, &topic)).await
            {
                Ok(Some(message)) => {
                    info!(bytes = message.payload.len(), "Received data from topic: {}", topic);
                    self.matcher.classify(&message.payload)
                }
                Ok(None) => Resolution::ConnectionClosed,
                Err(_) => Resolution::TimedOut,
            }
        }
        .instrument(span.clone())
        .await;

        self.finish(waiter, resolution.clone())
            .instrument(span)
            .await;
        resolution
    }

    /// Release the waiter's subscription and account for the outcome
    async fn finish(&self, waiter: ResponseWaiter, resolution: Resolution) {
        let ResponseWaiter {
            lease,
            messages,
            started,
            ..
        } = waiter;
        drop(messages);
        lease.release().await;

        let elapsed = started.elapsed();
        match &resolution {
            Resolution::Matched(_) => {
                metrics().response_matched(elapsed);
                info!(elapsed_ms = elapsed.as_millis() as u64, "Response matched");
            }
            Resolution::Unmatched(command_id) => {
                metrics().response_unmatched(elapsed);
                info!(
                    command_id = command_id.as_deref().unwrap_or("<none>"),
                    "Response id not in allow-list, resolving without data"
                );
            }
            Resolution::InvalidFormat => {
                metrics().response_invalid(elapsed);
                warn!("Invalid response format received.");
            }
            Resolution::TimedOut => {
                metrics().response_timed_out(elapsed);
                warn!(
                    timeout_ms = elapsed.as_millis() as u64,
                    "Response timeout from server."
                );
            }
            Resolution::ConnectionClosed => {
                metrics().wait_aborted(elapsed);
                warn!("Connection closed while waiting for a response");
            }
        }
    }
}

async fn send(link: &Arc<dyn BrokerLink>, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
    let size = payload.len();
    match link.publish(topic, payload).await {
        Ok(()) => {
            metrics().mqtt_message_published();
            info!(topic = %topic, bytes = size, "Message published to topic: {}", topic);
            Ok(())
        }
        Err(e) => {
            metrics().mqtt_publish_failed();
            warn!(topic = %topic, "Publish Error: {}", e);
            Err(BridgeError::PublishFailed(e))
        }
    }
}

/// Next message on `topic`; `None` once the sender side is gone
async fn next_on_topic(
    messages: &mut broadcast::Receiver<InboundMessage>,
    topic: &str,
) -> Option<InboundMessage> {
    loop {
        match messages.recv().await {
            Ok(message) if message.topic == topic => return Some(message),
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Response waiter fell behind, skipped messages");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
