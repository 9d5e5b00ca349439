//! Reference-counted broker subscriptions for reply topics
//!
//! Concurrent waiters on one reply topic share a single broker
//! subscription. The last waiter to finish unsubscribes. Topics the
//! connection subscribes to on its own, and topics a client subscribed to
//! explicitly, are never touched.
//!
//! Holder counts are kept per link: a reconnect hands out a new link whose
//! subscriptions start from zero, and a late release on a replaced link only
//! ever unsubscribes on that link.

use crate::error::BridgeError;
use crate::transport::BrokerLink;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

type LinkKey = usize;

fn link_key(link: &Arc<dyn BrokerLink>) -> LinkKey {
    Arc::as_ptr(link) as *const () as usize
}

#[derive(Default)]
struct Holdings {
    counts: HashMap<(LinkKey, String), usize>,
    // Weak handles keep the allocation, so a key is never reused while pinned
    pinned: Vec<(Weak<dyn BrokerLink>, String)>,
}

impl Holdings {
    fn is_pinned(&mut self, link: &Arc<dyn BrokerLink>, topic: &str) -> bool {
        self.pinned.retain(|(handle, _)| handle.strong_count() > 0);
        let key = link_key(link);
        self.pinned.iter().any(|(handle, pinned)| {
            pinned == topic
                && handle
                    .upgrade()
                    .is_some_and(|pinned_link| link_key(&pinned_link) == key)
        })
    }
}

pub struct SubscriptionRegistry {
    persistent: HashSet<String>,
    holdings: Mutex<Holdings>,
}

impl SubscriptionRegistry {
    pub fn new<I>(persistent: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            persistent: persistent.into_iter().collect(),
            holdings: Mutex::new(Holdings::default()),
        }
    }

    /// Take a share of the subscription to `topic` on `link`, subscribing if first
    pub async fn acquire(
        self: &Arc<Self>,
        link: &Arc<dyn BrokerLink>,
        topic: &str,
    ) -> Result<SubscriptionLease, BridgeError> {
        if !self.persistent.contains(topic) {
            let mut holdings = self.holdings.lock().await;
            let key = (link_key(link), topic.to_string());
            let holders = holdings.counts.get(&key).copied().unwrap_or(0);
            if holders == 0 && !holdings.is_pinned(link, topic) {
                link.subscribe(topic).await.map_err(|e| {
                    error!(topic = %topic, "Subscribe Error: {}", e);
                    BridgeError::SubscribeFailed(e)
                })?;
                debug!(topic = %topic, "Subscribed to reply topic");
            }
            holdings.counts.insert(key, holders + 1);
        }

        Ok(SubscriptionLease {
            registry: self.clone(),
            link: link.clone(),
            topic: topic.to_string(),
            active: true,
        })
    }

    /// Mark `topic` on `link` as explicitly subscribed
    ///
    /// Releasing the last waiter on a pinned topic leaves the broker
    /// subscription in place.
    pub async fn pin(&self, link: &Arc<dyn BrokerLink>, topic: &str) {
        let mut holdings = self.holdings.lock().await;
        if !holdings.is_pinned(link, topic) {
            holdings
                .pinned
                .push((Arc::downgrade(link), topic.to_string()));
            debug!(topic = %topic, "Pinned explicit subscription");
        }
    }

    async fn release(&self, link: &Arc<dyn BrokerLink>, topic: &str) {
        if self.persistent.contains(topic) {
            return;
        }

        let mut holdings = self.holdings.lock().await;
        let key = (link_key(link), topic.to_string());
        let remaining = match holdings.counts.get_mut(&key) {
            Some(holders) => {
                *holders = holders.saturating_sub(1);
                *holders
            }
            None => 0,
        };
        if remaining > 0 {
            return;
        }

        holdings.counts.remove(&key);
        if holdings.is_pinned(link, topic) {
            return;
        }
        match link.unsubscribe(topic).await {
            Ok(()) => debug!(topic = %topic, "Unsubscribed from reply topic"),
            Err(e) => warn!(topic = %topic, "Failed to unsubscribe from topic: {}", e),
        }
    }

    /// Number of waiters currently holding `topic`, across all links
    pub async fn holders(&self, topic: &str) -> usize {
        self.holdings
            .lock()
            .await
            .counts
            .iter()
            .filter(|((_, held), _)| held == topic)
            .map(|(_, holders)| holders)
            .sum()
    }
}

/// One waiter's share of a reply-topic subscription
///
/// Dropping an unreleased lease (a cancelled request) releases it on a
/// background task.
pub struct SubscriptionLease {
    registry: Arc<SubscriptionRegistry>,
    link: Arc<dyn BrokerLink>,
    topic: String,
    active: bool,
}

impl SubscriptionLease {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn release(mut self) {
        self.active = false;
        self.registry.release(&self.link, &self.topic).await;
    }
}

impl Drop for SubscriptionLease {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let registry = self.registry.clone();
        let link = self.link.clone();
        let topic = std::mem::take(&mut self.topic);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { registry.release(&link, &topic).await });
        }
    }
}
