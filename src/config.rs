//! Bridge configuration file.
//!
//! A TOML file with five sections (`[broker]`, `[pipeline]`, `[storage]`,
//! `[handler]`, `[publisher]`), every field optional, overlaid with `MQTT_*` environment
//! variables. [`BridgeConfig::validate`] turns the broker section into
//! [`BrokerSettings`] and reports every problem it finds in one error.
//!
//! ```toml
//! [broker]
//! endpoint = "abc123.s1.eu.hivemq.cloud"
//! username = "ingest"
//! password = "secret"
//! ca_cert_file = "/etc/mqtt-bridge/ca.pem"
//!
//! [pipeline]
//! queue_capacity = 5000
//!
//! [handler]
//! kind = "queued_store"
//! subscriptions = [{ filter = "sensors/#", qos = 1 }]
//!
//! [publisher]
//! mode = "flood"
//! ```

use crate::mqtt::config::{
    generate_client_id, BrokerSettings, PortPolicy, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_DOMAIN_SUFFIX, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_TLS_PORT,
};
use crate::mqtt::message::qos_from_level;
use crate::mqtt::tls::normalize_pem;
use crate::persistence::ingestion_queue::DEFAULT_CAPACITY;
use crate::persistence::persistence_worker::{
    RetryPolicy, WorkerSettings, DEFAULT_DEQUEUE_TIMEOUT, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_RETRY_DELAY, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STATS_INTERVAL,
};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/mqtt-bridge";
const CONFIG_FILE: &str = "config.toml";
const DATA_DIR: &str = "mqtt-bridge";
/// rumqttc refuses shorter keep-alive intervals.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("Invalid certificate: {0}")]
    Certificate(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: BrokerSection,
    pub pipeline: PipelineSettings,
    pub storage: StorageSettings,
    pub handler: HandlerSettings,
    pub publisher: PublisherSettings,
}

#[derive(Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct BrokerSection {
    pub endpoint: String,
    /// Signed so that negative values are reported instead of failing to parse.
    pub port: i64,
    pub username: String,
    pub password: String,
    /// PEM text; takes precedence over `ca_cert_file`.
    pub ca_cert: Option<String>,
    pub ca_cert_file: Option<PathBuf>,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    /// Empty disables the check.
    pub required_domain_suffix: String,
    pub port_policy: PortPolicy,
    pub connect_timeout_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        BrokerSection {
            endpoint: String::new(),
            port: i64::from(DEFAULT_TLS_PORT),
            username: String::new(),
            password: String::new(),
            ca_cert: None,
            ca_cert_file: None,
            client_id: None,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            required_domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            port_policy: PortPolicy::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

impl fmt::Debug for BrokerSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSection")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ca_cert", &self.ca_cert.as_ref().map(|c| c.len()))
            .field("ca_cert_file", &self.ca_cert_file)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("required_domain_suffix", &self.required_domain_suffix)
            .field("port_policy", &self.port_policy)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub max_store_attempts: u32,
    pub retry_delay_ms: u64,
    pub dequeue_timeout_ms: u64,
    pub stats_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            queue_capacity: DEFAULT_CAPACITY,
            max_store_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            dequeue_timeout_ms: DEFAULT_DEQUEUE_TIMEOUT.as_millis() as u64,
            stats_interval_secs: DEFAULT_STATS_INTERVAL.as_secs(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
        }
    }
}

impl PipelineSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_store_attempts,
            Duration::from_millis(self.retry_delay_ms),
        )
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            retry: self.retry_policy(),
            dequeue_timeout: Duration::from_millis(self.dequeue_timeout_ms),
            stats_interval: Duration::from_secs(self.stats_interval_secs),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn check(&self, errors: &mut Vec<String>) {
        if self.queue_capacity == 0 {
            errors.push("pipeline.queue_capacity must be at least 1".to_string());
        }
        if self.max_store_attempts == 0 {
            errors.push("pipeline.max_store_attempts must be at least 1".to_string());
        }
        if self.dequeue_timeout_ms == 0 {
            errors.push("pipeline.dequeue_timeout_ms must be positive".to_string());
        }
        if self.stats_interval_secs == 0 {
            errors.push("pipeline.stats_interval_secs must be positive".to_string());
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sled,
    Memory,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    /// Sled database directory; defaults under the user's data directory.
    pub path: Option<PathBuf>,
}

impl StorageSettings {
    pub fn resolved_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => dirs::data_local_dir()
                .map(|dir| dir.join(DATA_DIR))
                .unwrap_or_else(|| PathBuf::from(DATA_DIR)),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    #[default]
    QueuedStore,
    DirectStore,
    Echo,
    History,
}

impl HandlerKind {
    pub fn needs_store(&self) -> bool {
        matches!(self, HandlerKind::QueuedStore | HandlerKind::DirectStore)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    #[serde(default = "default_qos_level")]
    pub qos: u8,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: u8) -> Self {
        Subscription {
            filter: filter.into(),
            qos,
        }
    }

    pub fn qos(&self) -> QoS {
        qos_from_level(self.qos).unwrap_or(QoS::AtLeastOnce)
    }
}

fn default_qos_level() -> u8 {
    1
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct HandlerSettings {
    pub kind: HandlerKind,
    pub subscriptions: Vec<Subscription>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        HandlerSettings {
            kind: HandlerKind::default(),
            subscriptions: vec![Subscription::new("#", default_qos_level())],
        }
    }
}

/// What the built-in publisher sends, if anything.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublisherMode {
    #[default]
    Off,
    /// JSON counter objects.
    Counter,
    /// Simulated flood levels following a sine wave.
    Flood,
}

impl PublisherMode {
    pub fn default_topic(&self) -> &'static str {
        match self {
            PublisherMode::Off | PublisherMode::Counter => "test/topic",
            PublisherMode::Flood => "sensors/flood/main_street",
        }
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            PublisherMode::Off | PublisherMode::Counter => Duration::from_secs(2),
            PublisherMode::Flood => Duration::from_secs(1),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PublisherSettings {
    pub mode: PublisherMode,
    /// Falls back to the mode's default topic.
    pub topic: Option<String>,
    /// Falls back to the mode's default interval.
    pub interval_ms: Option<u64>,
    pub qos: u8,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        PublisherSettings {
            mode: PublisherMode::default(),
            topic: None,
            interval_ms: None,
            qos: default_qos_level(),
        }
    }
}

impl PublisherSettings {
    pub fn is_enabled(&self) -> bool {
        self.mode != PublisherMode::Off
    }

    pub fn topic(&self) -> &str {
        self.topic
            .as_deref()
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .unwrap_or_else(|| self.mode.default_topic())
    }

    pub fn interval(&self) -> Duration {
        self.interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.mode.default_interval())
    }

    pub fn qos(&self) -> QoS {
        qos_from_level(self.qos).unwrap_or(QoS::AtLeastOnce)
    }

    fn check(&self, errors: &mut Vec<String>) {
        if !self.is_enabled() {
            return;
        }
        if self.interval_ms == Some(0) {
            errors.push("publisher.interval_ms must be positive".to_string());
        }
        if qos_from_level(self.qos).is_none() {
            errors.push(format!("publisher has invalid qos {}", self.qos));
        }
        if self.topic().contains(['+', '#']) {
            errors.push(format!("publisher topic {} contains a wildcard", self.topic()));
        }
    }
}

impl BridgeConfig {
    /// `~/.config/mqtt-bridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BridgeConfig = toml::from_str(&raw)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` (or the default file when present) and apply the process
    /// environment on top.
    ///
    /// An explicit `path` has to exist; a missing default file just means
    /// defaults plus environment.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::load(&default)?,
                _ => {
                    debug!("No configuration file found, using defaults");
                    BridgeConfig::default()
                }
            },
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `get`, which maps variable names to values.
    /// Empty values are ignored.
    pub fn apply_env_with<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).filter(|value| !value.trim().is_empty());
        let broker = &mut self.broker;

        if let Some(endpoint) = var("MQTT_BROKER") {
            broker.endpoint = endpoint;
        }
        if let Some(port) = var("MQTT_PORT") {
            broker.port = port.trim().parse().map_err(|_| {
                ConfigError::Invalid(vec![format!("MQTT_PORT is not a number: {port}")])
            })?;
        }
        if let Some(username) = var("MQTT_USERNAME") {
            broker.username = username;
        }
        if let Some(password) = var("MQTT_PASSWORD") {
            broker.password = password;
        }
        if let Some(cert) = var("MQTT_CA_CERT").or_else(|| var("HIVEMQ_CLOUD_CERT")) {
            broker.ca_cert = Some(cert);
        }
        if let Some(file) = var("MQTT_CA_CERT_FILE") {
            broker.ca_cert_file = Some(PathBuf::from(file));
        }
        if let Some(client_id) = var("MQTT_CLIENT_ID") {
            broker.client_id = Some(client_id);
        }
        Ok(())
    }

    /// Check every field and build the settings the transport connects with.
    pub fn validate(&self) -> Result<BrokerSettings, ConfigError> {
        let broker = &self.broker;
        let mut errors = Vec::new();

        let endpoint = broker.endpoint.trim();
        let username = broker.username.trim();
        let password = broker.password.trim();

        if endpoint.is_empty() {
            errors.push("MQTT broker endpoint is empty or not set".to_string());
        }
        if username.is_empty() {
            errors.push("MQTT username is empty or not set".to_string());
        }
        if password.is_empty() {
            errors.push("MQTT password is empty or not set".to_string());
        }
        let certificate = match self.certificate_text() {
            Ok(text) => {
                if text.trim().is_empty() {
                    errors.push("CA certificate is empty or not set".to_string());
                }
                text
            }
            Err(e) => {
                errors.push(e.to_string());
                String::new()
            }
        };

        let suffix = broker.required_domain_suffix.as_str();
        if !endpoint.is_empty() && !suffix.is_empty() && !endpoint.ends_with(suffix) {
            errors.push(format!(
                "Invalid broker endpoint {endpoint}: must end with {suffix}"
            ));
        }

        let port = match u16::try_from(broker.port) {
            Ok(0) | Err(_) => {
                errors.push(format!("Invalid MQTT port: {}", broker.port));
                DEFAULT_TLS_PORT
            }
            Ok(port) if port != DEFAULT_TLS_PORT => match broker.port_policy {
                PortPolicy::Strict => {
                    errors.push(format!(
                        "MQTT port {port} is not the TLS port {DEFAULT_TLS_PORT}"
                    ));
                    port
                }
                PortPolicy::Coerce => {
                    warn!(
                        configured = port,
                        "Port is not the TLS port, using {} instead", DEFAULT_TLS_PORT
                    );
                    DEFAULT_TLS_PORT
                }
            },
            Ok(port) => port,
        };

        if broker.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            errors.push(format!(
                "keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            ));
        }
        if broker.connect_timeout_secs == 0 {
            errors.push("connect_timeout_secs must be positive".to_string());
        }

        self.pipeline.check(&mut errors);
        self.publisher.check(&mut errors);
        for subscription in &self.handler.subscriptions {
            if subscription.filter.is_empty() {
                errors.push("subscription filter is empty".to_string());
            }
            if qos_from_level(subscription.qos).is_none() {
                errors.push(format!(
                    "subscription {} has invalid qos {}",
                    subscription.filter, subscription.qos
                ));
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        let ca_cert =
            normalize_pem(&certificate).map_err(|e| ConfigError::Certificate(e.to_string()))?;
        let client_id = broker
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_client_id);

        info!("Configuration validation successful");
        debug!(endpoint, port, "Using broker");
        debug!(
            username_len = username.len(),
            password_len = password.len(),
            "Credentials present"
        );

        Ok(BrokerSettings {
            endpoint: endpoint.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
            ca_cert,
            client_id,
            keep_alive: Duration::from_secs(broker.keep_alive_secs),
            connect_timeout: Duration::from_secs(broker.connect_timeout_secs),
        })
    }

    fn certificate_text(&self) -> Result<String, ConfigError> {
        match (&self.broker.ca_cert, &self.broker.ca_cert_file) {
            (Some(cert), _) if !cert.trim().is_empty() => Ok(cert.clone()),
            (_, Some(path)) => fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            }),
            _ => Ok(String::new()),
        }
    }
}
