//! Built-in publisher for exercising a broker without external tools.
//!
//! Two payload generators are available, selected by [`PublisherMode`]:
//!
//! - **counter**: `{"count": n, "time": "...", "client_id": "..."}` where `n`
//!   only advances after a successful publish
//! - **flood**: a simulated water level in centimeters, following a sine wave
//!   around a base level with a little random noise
//!
//! The publisher runs as its own task on a fixed interval and goes through
//! [`BrokerClient::publish`], so a dropped connection gets the same single
//! reconnect attempt as any other publish.

use crate::config::{PublisherMode, PublisherSettings};
use crate::mqtt::client::BrokerClient;
use chrono::{DateTime, Local};
use rand::Rng;
use rumqttc::QoS;
use std::f64::consts::PI;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const FLOOD_PERIOD: Duration = Duration::from_secs(30);
pub const FLOOD_BASE_LEVEL: f64 = 50.0;
pub const FLOOD_AMPLITUDE: f64 = 30.0;
/// Noise is drawn from +/- this fraction of the amplitude.
const FLOOD_NOISE: f64 = 0.05;

pub fn counter_payload(count: u64, client_id: &str, now: DateTime<Local>) -> String {
    serde_json::json!({
        "count": count,
        "time": now.format("%Y-%m-%d %H:%M:%S").to_string(),
        "client_id": client_id,
    })
    .to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertLevel {
    Normal,
    Caution,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn for_level(level: f64) -> Self {
        if level > 90.0 {
            AlertLevel::Critical
        } else if level > 70.0 {
            AlertLevel::Warning
        } else if level > 60.0 {
            AlertLevel::Caution
        } else {
            AlertLevel::Normal
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Caution => "caution",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct FloodSimulator {
    period: Duration,
    base_level: f64,
    amplitude: f64,
    started: Instant,
}

impl Default for FloodSimulator {
    fn default() -> Self {
        Self::new(FLOOD_PERIOD, FLOOD_BASE_LEVEL, FLOOD_AMPLITUDE)
    }
}

impl FloodSimulator {
    pub fn new(period: Duration, base_level: f64, amplitude: f64) -> Self {
        FloodSimulator {
            period,
            base_level,
            amplitude,
            started: Instant::now(),
        }
    }

    /// Level `elapsed` into the simulation, rounded to two decimals.
    /// `noise` is a fraction of the amplitude, normally within +/-0.05.
    pub fn level_at(&self, elapsed: Duration, noise: f64) -> f64 {
        let period = self.period.as_secs_f64().max(f64::EPSILON);
        let position = 2.0 * PI * elapsed.as_secs_f64() / period;
        let level = self.base_level + position.sin() * self.amplitude + noise * self.amplitude;
        (level * 100.0).round() / 100.0
    }

    pub fn current_level(&self) -> f64 {
        let noise = rand::rng().random_range(-FLOOD_NOISE..=FLOOD_NOISE);
        self.level_at(self.started.elapsed(), noise)
    }
}

/// Periodic publisher task, see the module docs.
pub struct Publisher {
    client: BrokerClient,
    mode: PublisherMode,
    topic: String,
    interval: Duration,
    qos: QoS,
    client_id: String,
}

impl Publisher {
    pub fn new(client: BrokerClient, settings: &PublisherSettings, client_id: impl Into<String>) -> Self {
        Publisher {
            client,
            mode: settings.mode,
            topic: settings.topic().to_string(),
            interval: settings.interval(),
            qos: settings.qos(),
            client_id: client_id.into(),
        }
    }

    pub fn spawn(self) -> PublisherHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.run(token).await });
        PublisherHandle { task, cancel }
    }

    async fn run(self, cancel: CancellationToken) -> u64 {
        info!(
            mode = ?self.mode,
            topic = %self.topic,
            interval_ms = self.interval.as_millis() as u64,
            "Publisher started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let flood = FloodSimulator::default();
        let mut count = 0;
        let mut sent = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let payload = match self.mode {
                PublisherMode::Off => break,
                PublisherMode::Counter => counter_payload(count, &self.client_id, Local::now()),
                PublisherMode::Flood => {
                    let level = flood.current_level();
                    debug!(level, alert = %AlertLevel::for_level(level), "Flood level");
                    level.to_string()
                }
            };

            match self.client.publish(&self.topic, payload.as_bytes(), self.qos).await {
                Ok(()) => {
                    count += 1;
                    sent += 1;
                }
                Err(e) => warn!(topic = %self.topic, "Publish failed: {}", e),
            }
        }

        info!(sent, "Publisher stopped");
        sent
    }
}

pub struct PublisherHandle {
    task: JoinHandle<u64>,
    cancel: CancellationToken,
}

impl PublisherHandle {
    /// Stop after the publish in progress, returning how many succeeded.
    pub async fn stop(self) -> u64 {
        self.cancel.cancel();
        match self.task.await {
            Ok(sent) => sent,
            Err(e) => {
                error!("Publisher task terminated abnormally: {}", e);
                0
            }
        }
    }
}
