//! Connection supervisor - drives the session state machine.
//!
//! ```text
//!                connect()              on_connect(0)
//! Disconnected ───────────► Connecting ──────────────► Connected
//!      ▲                        │                          │
//!      └──── on_connect(≠0) ────┘                          │
//!      └──────────────────── on_disconnect(any) ───────────┘
//! ```
//!
//! The supervisor is the [`TransportEvents`] sink for its transport. Every
//! status change is mirrored into a `watch` channel, which is what
//! [`ConnectionSupervisor::connect`] waits on. There is no automatic
//! reconnect: refusals and unexpected disconnects are reported and the caller
//! decides what to do next.

use super::config::BrokerSettings;
use super::handlers::MessageHandler;
use super::message::MessageRecord;
use super::session::{ConnectionState, SessionState};
use super::transport::{BrokerTransport, ConnectRefusal, TransportError, TransportEvents};
use rumqttc::QoS;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Refused(ConnectRefusal),

    #[error("connection closed before it was established (code {0})")]
    Closed(u8),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct Shared {
    transport: Arc<dyn BrokerTransport>,
    handler: Arc<dyn MessageHandler>,
    session: Mutex<SessionState>,
    status: watch::Sender<ConnectionState>,
    last_settings: Mutex<Option<BrokerSettings>>,
    last_disconnect: Mutex<Option<u8>>,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, SessionState> {
        // A panic inside a short state transition leaves nothing half-written.
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn client_id(&self) -> Option<String> {
        self.last_settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|s| s.client_id.clone())
    }

    fn resubscribe(&self, subscriptions: &[(String, QoS)]) {
        for (filter, qos) in subscriptions {
            info!(filter = filter.as_str(), "Resubscribing to topic");
            let ack = self.transport.subscribe(filter, *qos);
            if !ack.is_success() {
                warn!(
                    filter = filter.as_str(),
                    code = ack.code,
                    "Resubscription request failed"
                );
            }
        }
    }
}

impl TransportEvents for Shared {
    fn on_connect(&self, reason_code: u8) {
        match ConnectRefusal::from_code(reason_code) {
            None => {
                let subscriptions = {
                    let mut session = self.session();
                    session.mark_connected();
                    session.subscriptions()
                };
                info!("Connected to broker");
                self.resubscribe(&subscriptions);
                self.status.send_replace(ConnectionState::Connected);
            }
            Some(refusal) => {
                self.session().mark_refused(refusal);
                error!(code = reason_code, "Connection failed: {}", refusal);
                if let Some(hint) = refusal.hint() {
                    error!("Please {}", hint);
                }
                self.status.send_replace(ConnectionState::Disconnected);
            }
        }
    }

    fn on_disconnect(&self, reason_code: u8) {
        self.session().mark_disconnected();
        *self.last_disconnect.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason_code);
        if reason_code != 0 {
            warn!(code = reason_code, "Unexpected disconnection");
        }
        info!("Disconnected from broker");
        self.status.send_replace(ConnectionState::Disconnected);
    }

    fn on_message(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        self.session().note_message();
        let record = MessageRecord::new(topic, payload, qos)
            .with_retain(retain)
            .with_client_id(self.client_id());
        debug!(topic, qos = record.qos_level(), "Message received");
        self.handler.handle_message(record);
    }
}

/// Owns the transport and the session state; cheap to clone.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn BrokerTransport>, handler: Arc<dyn MessageHandler>) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        ConnectionSupervisor {
            shared: Arc::new(Shared {
                transport,
                handler,
                session: Mutex::new(SessionState::new()),
                status,
                last_settings: Mutex::new(None),
                last_disconnect: Mutex::new(None),
            }),
        }
    }

    /// Connect and wait up to `settings.connect_timeout` for the broker's answer.
    ///
    /// The settings are remembered for [`ConnectionSupervisor::reconnect`]
    /// even when the attempt fails.
    pub async fn connect(&self, settings: &BrokerSettings) -> Result<(), ConnectionError> {
        *self
            .shared
            .last_settings
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(settings.clone());
        *self
            .shared
            .last_disconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;

        info!("Initiating connection to {}", settings.address());
        self.shared.session().begin_connect();
        self.shared.status.send_replace(ConnectionState::Connecting);
        let mut status = self.shared.status.subscribe();

        let events: Arc<dyn TransportEvents> = self.shared.clone();
        if let Err(e) = self.shared.transport.connect(settings, events) {
            error!("Connection failed: {}", e);
            self.mark_disconnected();
            return Err(e.into());
        }

        let outcome = tokio::time::timeout(
            settings.connect_timeout,
            status.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await;

        match outcome {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(_) => {
                let session = self.shared.session();
                match session.last_refusal() {
                    Some(refusal) => Err(ConnectionError::Refused(refusal)),
                    None => {
                        drop(session);
                        let code = self
                            .shared
                            .last_disconnect
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .unwrap_or(0);
                        Err(ConnectionError::Closed(code))
                    }
                }
            }
            Err(_) => {
                error!(
                    "Connection timeout after {} seconds",
                    settings.connect_timeout.as_secs()
                );
                if let Err(e) = self.shared.transport.disconnect() {
                    debug!("Abandoning connection attempt failed: {}", e);
                }
                self.mark_disconnected();
                Err(ConnectionError::Timeout(settings.connect_timeout))
            }
        }
    }

    /// One more attempt with the settings of the last `connect` call.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        let settings = self
            .shared
            .last_settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match settings {
            Some(settings) => self.connect(&settings).await,
            None => Err(ConnectionError::Transport(TransportError::NotConnected)),
        }
    }

    /// Tear the connection down. Does nothing when already disconnected.
    pub fn disconnect(&self) -> Result<(), TransportError> {
        if self.state() == ConnectionState::Disconnected {
            debug!("Disconnect requested while already disconnected");
            return Ok(());
        }
        info!("Initiating disconnect...");
        let result = self.shared.transport.disconnect();
        self.mark_disconnected();
        result
    }

    /// Record a filter the broker accepted, so reconnects replay it.
    pub fn track_subscription(&self, topic_filter: &str, qos: QoS) -> bool {
        self.shared.session().add_subscription(topic_filter, qos)
    }

    pub fn transport(&self) -> &Arc<dyn BrokerTransport> {
        &self.shared.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.session().connection()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.session().is_connected()
    }

    pub fn session(&self) -> SessionState {
        self.shared.session().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    fn mark_disconnected(&self) {
        self.shared.session().mark_disconnected();
        self.shared.status.send_replace(ConnectionState::Disconnected);
    }
}
