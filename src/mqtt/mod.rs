//! # MQTT Integration Module
//!
//! Client side of the bridge: everything between the broker connection and the
//! point where an inbound message is handed to a [`handlers::MessageHandler`].
//!
//! ## Module Architecture
//!
//! - [`config`] and [`tls`] turn raw settings into a validated [`config::BrokerSettings`]
//! - [`transport`] defines the seam to the wire protocol; [`rumqtt_transport`] implements it
//! - [`session`] is pure connection/subscription state, [`supervisor`] drives it
//! - [`client`] is the publish/subscribe facade used by callers
//!
//! ## Concurrency
//!
//! Transport callbacks run on the rumqttc event loop task. They only touch the
//! session state (short `std::sync::Mutex` sections) and the configured handler,
//! which must never block. Callers of [`client::BrokerClient`] run on their own
//! tasks and wait on a `watch` channel when a connect is in flight.

pub mod client;
pub mod config;
pub mod handlers;
pub mod message;
pub mod rumqtt_transport;
pub mod session;
pub mod supervisor;
pub mod tls;
pub mod transport;
