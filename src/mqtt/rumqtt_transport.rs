//! [`BrokerTransport`] implementation on top of `rumqttc`.
//!
//! Each `connect` builds a fresh `AsyncClient`/`EventLoop` pair and spawns a
//! task polling the event loop. The task translates rumqttc events into
//! [`TransportEvents`] callbacks and exits at the first connection error, so
//! rumqttc never reconnects behind the supervisor's back.

use super::config::BrokerSettings;
use super::tls::normalize_pem;
use super::transport::{
    Ack, BrokerTransport, TransportError, TransportEvents, ACK_NO_CONNECTION, ACK_QUEUE_FULL,
    DISCONNECT_BY_BROKER, DISCONNECT_CLEAN, DISCONNECT_CONNECTION_LOST,
};
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    MqttOptions, Outgoing, QoS, TlsConfiguration, Transport,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Requests rumqttc buffers between the client handle and the event loop.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

struct Link {
    client: AsyncClient,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Link {
    fn close(self) {
        if !self.task.is_finished() {
            debug!("Stopping MQTT event loop task");
        }
        self.cancel.cancel();
    }

    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Callback sink for one link. Events are forwarded only while that link is
/// still the transport's current one.
struct EventGate {
    generation: u64,
    current: Arc<AtomicU64>,
    events: Arc<dyn TransportEvents>,
}

impl EventGate {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }

    fn on_connect(&self, code: u8) {
        if self.is_current() {
            self.events.on_connect(code);
        } else {
            debug!(code, generation = self.generation, "Ignoring CONNACK from a retired link");
        }
    }

    fn on_disconnect(&self, code: u8) {
        if self.is_current() {
            self.events.on_disconnect(code);
        } else {
            debug!(code, generation = self.generation, "Ignoring disconnect from a retired link");
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        if self.is_current() {
            self.events.on_message(topic, payload, qos, retain);
        }
    }
}

#[derive(Default)]
pub struct RumqttTransport {
    link: Mutex<Option<Link>>,
    generation: Arc<AtomicU64>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Client of the current link, if its event loop is still polling.
    fn client(&self) -> Option<AsyncClient> {
        self.link()
            .as_ref()
            .filter(|link| link.is_running())
            .map(|link| link.client.clone())
    }

    /// Whether a link exists and its event loop task has not ended.
    pub fn is_running(&self) -> bool {
        self.link().as_ref().is_some_and(Link::is_running)
    }

    /// Stop forwarding events from every link created so far.
    fn retire_links(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn request_code(&self, error: &ClientError) -> u8 {
        match error {
            // A full channel and a closed one look alike to try_* calls.
            ClientError::TryRequest(_) if self.is_running() => ACK_QUEUE_FULL,
            ClientError::TryRequest(_) | ClientError::Request(_) => ACK_NO_CONNECTION,
        }
    }
}

/// Options for one connection attempt: credentials, keep-alive and a TLS
/// transport trusting only the configured CA.
///
/// An empty CA means plain TCP. A CA that is not a usable PEM block is a
/// [`TransportError::Tls`].
pub fn mqtt_options(settings: &BrokerSettings) -> Result<MqttOptions, TransportError> {
    let mut options = MqttOptions::new(&settings.client_id, &settings.endpoint, settings.port);
    options
        .set_credentials(&settings.username, &settings.password)
        .set_keep_alive(settings.keep_alive)
        .set_clean_session(true);

    if !settings.ca_cert.trim().is_empty() {
        let ca = normalize_pem(&settings.ca_cert).map_err(|e| TransportError::Tls(e.to_string()))?;
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
            ca: ca.into_bytes(),
            alpn: None,
            client_auth: None,
        }));
    }
    Ok(options)
}

pub fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

impl BrokerTransport for RumqttTransport {
    fn connect(
        &self,
        settings: &BrokerSettings,
        events: Arc<dyn TransportEvents>,
    ) -> Result<(), TransportError> {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Client(format!("no async runtime: {e}")))?;
        let options = mqtt_options(settings)?;

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let gate = EventGate {
            generation: self.retire_links(),
            current: self.generation.clone(),
            events,
        };
        let task = runtime.spawn(drive(eventloop, gate, cancel.clone()));

        let previous = self.link().replace(Link {
            client,
            task,
            cancel,
        });
        if let Some(previous) = previous {
            previous.close();
        }
        debug!(address = %settings.address(), "MQTT event loop spawned");
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Ack {
        let Some(client) = self.client() else {
            return Ack::new(ACK_NO_CONNECTION);
        };
        match client.try_publish(topic, qos, false, payload.to_vec()) {
            Ok(()) => Ack::SUCCESS,
            Err(e) => {
                debug!(topic, "Publish request not queued: {}", e);
                Ack::new(self.request_code(&e))
            }
        }
    }

    fn subscribe(&self, topic_filter: &str, qos: QoS) -> Ack {
        let Some(client) = self.client() else {
            return Ack::new(ACK_NO_CONNECTION);
        };
        match client.try_subscribe(topic_filter, qos) {
            Ok(()) => Ack::SUCCESS,
            Err(e) => {
                debug!(filter = topic_filter, "Subscribe request not queued: {}", e);
                Ack::new(self.request_code(&e))
            }
        }
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let Some(link) = self.link().take() else {
            return Err(TransportError::NotConnected);
        };
        // The supervisor records the disconnect itself; nothing this link
        // reports from here on may reach a later connection.
        self.retire_links();
        let result = link
            .client
            .try_disconnect()
            .map_err(|e| TransportError::Client(e.to_string()));
        if result.is_err() {
            link.close();
        }
        // On success the event loop stops itself after sending DISCONNECT.
        result
    }
}

/// Poll `eventloop` until the connection ends or `cancel` fires.
async fn drive(mut eventloop: EventLoop, events: EventGate, cancel: CancellationToken) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };
        if cancel.is_cancelled() {
            break;
        }

        match polled {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                let code = connack_code(ack.code);
                events.on_connect(code);
                if code != 0 {
                    break;
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                events.on_message(&publish.topic, &publish.payload, publish.qos, publish.retain);
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("Broker closed the session");
                events.on_disconnect(DISCONNECT_BY_BROKER);
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                events.on_disconnect(DISCONNECT_CLEAN);
                break;
            }
            Ok(event) => trace!(?event, "MQTT event"),
            Err(ConnectionError::ConnectionRefused(code)) => {
                events.on_connect(connack_code(code));
                break;
            }
            Err(e) => {
                if events.is_current() {
                    error!("MQTT connection error: {}", e);
                }
                events.on_disconnect(DISCONNECT_CONNECTION_LOST);
                break;
            }
        }
    }
    info!(generation = events.generation, "MQTT event loop stopped");
}
