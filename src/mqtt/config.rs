use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Port the broker expects TLS connections on.
pub const DEFAULT_TLS_PORT: u16 = 8883;
/// Domain every cloud broker endpoint has to live under.
pub const DEFAULT_DOMAIN_SUFFIX: &str = ".hivemq.cloud";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// What to do with a configured port that differs from [`DEFAULT_TLS_PORT`].
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortPolicy {
    /// Reject the configuration.
    #[default]
    Strict,
    /// Log a warning and connect on the TLS port instead.
    Coerce,
}

/// Validated connection record handed to the transport.
///
/// Only produced by [`crate::config::BridgeConfig::validate`], so every field
/// is already checked: non-empty credentials, a positive port that passed the
/// [`PortPolicy`], and a normalized PEM trust anchor.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub endpoint: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ca_cert: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl BrokerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.endpoint, self.port)
    }
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &format_args!("<{} chars>", self.password.len()))
            .field("ca_cert", &format_args!("<{} bytes>", self.ca_cert.len()))
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Client identifier used when none is configured.
pub fn generate_client_id() -> String {
    format!("mqtt_bridge_{}", Utc::now().timestamp())
}
