//! Seam between the bridge and the wire protocol.
//!
//! A [`BrokerTransport`] owns the network connection. Requests (`publish`,
//! `subscribe`) are queued without waiting for the broker and answer with an
//! [`Ack`] code; connection outcomes and inbound traffic come back through the
//! [`TransportEvents`] sink handed over at connect time. Events are delivered on
//! the transport's own task and must return quickly.

use super::config::BrokerSettings;
use rumqttc::QoS;
use std::fmt;
use std::sync::Arc;

/// Request accepted by the transport.
pub const ACK_SUCCESS: u8 = 0;
/// No live connection to queue the request on.
pub const ACK_NO_CONNECTION: u8 = 4;
/// Outgoing request buffer is full.
pub const ACK_QUEUE_FULL: u8 = 15;

/// Disconnect requested by this client.
pub const DISCONNECT_CLEAN: u8 = 0;
/// Broker closed the session.
pub const DISCONNECT_BY_BROKER: u8 = 1;
/// Network or protocol failure.
pub const DISCONNECT_CONNECTION_LOST: u8 = 7;

/// Result code of a queued publish or subscribe request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ack {
    pub code: u8,
}

impl Ack {
    pub const SUCCESS: Ack = Ack { code: ACK_SUCCESS };

    pub fn new(code: u8) -> Self {
        Ack { code }
    }

    pub fn is_success(&self) -> bool {
        self.code == ACK_SUCCESS
    }
}

/// Diagnostic classification of a non-zero CONNACK return code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectRefusal {
    ProtocolVersion,
    InvalidClientId,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
    Unknown(u8),
}

impl ConnectRefusal {
    /// `None` for code 0, which is an accepted connection.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(ConnectRefusal::ProtocolVersion),
            2 => Some(ConnectRefusal::InvalidClientId),
            3 => Some(ConnectRefusal::ServerUnavailable),
            4 => Some(ConnectRefusal::BadCredentials),
            5 => Some(ConnectRefusal::NotAuthorized),
            other => Some(ConnectRefusal::Unknown(other)),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            ConnectRefusal::ProtocolVersion => 1,
            ConnectRefusal::InvalidClientId => 2,
            ConnectRefusal::ServerUnavailable => 3,
            ConnectRefusal::BadCredentials => 4,
            ConnectRefusal::NotAuthorized => 5,
            ConnectRefusal::Unknown(code) => *code,
        }
    }

    /// Operator hint for refusals caused by local configuration.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ConnectRefusal::BadCredentials => Some("check the configured username and password"),
            ConnectRefusal::NotAuthorized => {
                Some("check the client credentials and broker permissions")
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConnectRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectRefusal::ProtocolVersion => {
                write!(f, "connection refused - incorrect protocol version")
            }
            ConnectRefusal::InvalidClientId => {
                write!(f, "connection refused - invalid client identifier")
            }
            ConnectRefusal::ServerUnavailable => write!(f, "connection refused - server unavailable"),
            ConnectRefusal::BadCredentials => {
                write!(f, "connection refused - bad username or password")
            }
            ConnectRefusal::NotAuthorized => write!(f, "connection refused - not authorized"),
            ConnectRefusal::Unknown(code) => write!(f, "unknown connect error code: {}", code),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport client error: {0}")]
    Client(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("no active connection")]
    NotConnected,
}

/// Callbacks raised by a transport on its network task.
pub trait TransportEvents: Send + Sync {
    fn on_connect(&self, reason_code: u8);

    fn on_disconnect(&self, reason_code: u8);

    fn on_message(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool);
}

pub trait BrokerTransport: Send + Sync {
    /// Start a connection attempt. The outcome is reported through
    /// `events.on_connect`; an `Err` means the attempt never started.
    ///
    /// Must be called from within a tokio runtime.
    fn connect(
        &self,
        settings: &BrokerSettings,
        events: Arc<dyn TransportEvents>,
    ) -> Result<(), TransportError>;

    fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Ack;

    fn subscribe(&self, topic_filter: &str, qos: QoS) -> Ack;

    fn disconnect(&self) -> Result<(), TransportError>;
}
