//! Owner of the single shared broker connection
//!
//! Every HTTP request goes through one [`ConnectionManager`]. Connect and
//! disconnect are serialised on their own lock; the handle itself is only
//! locked long enough to clone it, so state queries never wait on a broker
//! round trip.

use super::{BrokerLink, ConnectionState, Connector};
use crate::error::BridgeError;
use crate::observability::metrics::metrics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What `connect` does when a connection already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// Hand back the live connection
    Reuse,
    /// Fail with `AlreadyConnected`
    RejectDuplicate,
}

impl ConnectPolicy {
    pub fn from_config(reject_duplicate_connect: bool) -> Self {
        if reject_duplicate_connect {
            ConnectPolicy::RejectDuplicate
        } else {
            ConnectPolicy::Reuse
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<()>,
    link: Mutex<Option<Arc<dyn BrokerLink>>>,
    connecting: AtomicBool,
    auto_subscribe: Vec<String>,
    policy: ConnectPolicy,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        auto_subscribe: Vec<String>,
        policy: ConnectPolicy,
    ) -> Self {
        Self {
            connector,
            lifecycle: Mutex::new(()),
            link: Mutex::new(None),
            connecting: AtomicBool::new(false),
            auto_subscribe,
            policy,
        }
    }

    pub fn policy(&self) -> ConnectPolicy {
        self.policy
    }

    /// Establish the shared connection, honouring the configured policy
    pub async fn connect(&self) -> Result<Arc<dyn BrokerLink>, BridgeError> {
        self.connect_with(self.policy).await
    }

    /// The live connection, opening one first if needed
    ///
    /// Always reuses an existing link, whatever the configured policy.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn BrokerLink>, BridgeError> {
        self.connect_with(ConnectPolicy::Reuse).await
    }

    async fn connect_with(
        &self,
        policy: ConnectPolicy,
    ) -> Result<Arc<dyn BrokerLink>, BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(link) = self.current().await {
            return match policy {
                ConnectPolicy::Reuse => {
                    debug!("Reusing existing broker connection");
                    Ok(link)
                }
                ConnectPolicy::RejectDuplicate => {
                    warn!("Already connected!");
                    Err(BridgeError::AlreadyConnected)
                }
            };
        }

        metrics().mqtt_connection_attempt();
        let _connecting = ConnectingFlag::raise(&self.connecting);
        let link = match self.connector.open().await {
            Ok(link) => link,
            Err(e) => {
                metrics().mqtt_connection_failed();
                error!("Connect Fail: {}", e);
                return Err(BridgeError::ConnectFailed(e));
            }
        };
        metrics().mqtt_connection_established();
        info!("Connected to AWS IoT successfully");

        // A failed auto-subscribe leaves the connection usable for publishing
        for topic in &self.auto_subscribe {
            match link.subscribe(topic).await {
                Ok(()) => info!(topic = %topic, "Subscribed to topic: {}", topic),
                Err(e) => warn!(topic = %topic, "Subscribe Error: {}", e),
            }
        }

        *self.link.lock().await = Some(link.clone());
        Ok(link)
    }

    /// Close the shared connection
    ///
    /// The handle is kept when the close itself fails, so a later call can
    /// retry.
    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(link) = self.current().await else {
            error!("Disconnect Error: No connection to disconnect.");
            return Err(BridgeError::nothing_to_disconnect());
        };

        info!("Disconnecting...");
        if let Err(e) = link.disconnect().await {
            error!("Disconnect Error: {}", e);
            return Err(BridgeError::DisconnectFailed(e));
        }

        *self.link.lock().await = None;
        metrics().mqtt_disconnected();
        info!("Disconnected from AWS IoT successfully");
        Ok(())
    }

    /// Subscribe on the existing connection; never connects on its own
    ///
    /// Returns the link the subscription was made on.
    pub async fn subscribe(&self, topic: &str) -> Result<Arc<dyn BrokerLink>, BridgeError> {
        let link = self.current().await.ok_or_else(|| {
            error!("No connection. Please connect first.");
            BridgeError::not_connected()
        })?;

        link.subscribe(topic).await.map_err(|e| {
            error!(topic = %topic, "Subscribe Error: {}", e);
            BridgeError::SubscribeFailed(e)
        })?;

        info!(topic = %topic, "Subscribed to topic: {}", topic);
        Ok(link)
    }

    /// The live connection, if any
    pub async fn current(&self) -> Option<Arc<dyn BrokerLink>> {
        self.link.lock().await.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        match self.current().await {
            Some(link) => link.state(),
            None if self.connecting.load(Ordering::SeqCst) => ConnectionState::Connecting,
            None => ConnectionState::Disconnected,
        }
    }
}

/// Reports `Connecting` until dropped, including when the connect is cancelled
struct ConnectingFlag<'a>(&'a AtomicBool);

impl<'a> ConnectingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
