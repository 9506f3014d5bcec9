//! Publish/subscribe facade over the connection supervisor.

use super::session::SessionState;
use super::supervisor::ConnectionSupervisor;
use rumqttc::QoS;
use tracing::{debug, error, info, warn};

pub const DEFAULT_QOS: QoS = QoS::AtLeastOnce;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Failed to publish message (code {code})")]
    Publish { code: u8 },

    #[error("Failed to subscribe (code {code})")]
    Subscribe { code: u8 },
}

#[derive(Clone)]
pub struct BrokerClient {
    supervisor: ConnectionSupervisor,
}

impl BrokerClient {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        BrokerClient { supervisor }
    }

    /// Publish `payload` on `topic`.
    ///
    /// When disconnected, makes exactly one reconnect attempt with the last
    /// settings passed to `connect` before giving up.
    pub async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), ClientError> {
        if !self.supervisor.is_connected() {
            warn!("Not connected to broker, attempting to reconnect...");
            if let Err(e) = self.supervisor.reconnect().await {
                error!("Reconnect before publish failed: {}", e);
                return Err(ClientError::NotConnected);
            }
        }

        let ack = self.supervisor.transport().publish(topic, payload, qos);
        if !ack.is_success() {
            error!(topic, code = ack.code, "Failed to publish message");
            return Err(ClientError::Publish { code: ack.code });
        }
        debug!(topic, bytes = payload.len(), "Message published");
        Ok(())
    }

    /// Subscribe to `topic_filter`; the filter is remembered only if the
    /// transport accepted the request.
    pub fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), ClientError> {
        let ack = self.supervisor.transport().subscribe(topic_filter, qos);
        if !ack.is_success() {
            error!(filter = topic_filter, code = ack.code, "Failed to subscribe");
            return Err(ClientError::Subscribe { code: ack.code });
        }
        if self.supervisor.track_subscription(topic_filter, qos) {
            info!(filter = topic_filter, "Subscribed to topic");
        } else {
            debug!(filter = topic_filter, "Already subscribed, request re-issued");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.supervisor
            .session()
            .subscriptions()
            .into_iter()
            .map(|(filter, _)| filter)
            .collect()
    }

    pub fn session(&self) -> SessionState {
        self.supervisor.session()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }
}
