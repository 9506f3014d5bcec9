//! # mqtt-bridge
//!
//! Bridges an MQTT broker to persistent storage. The bridge subscribes to topic
//! filters, buffers inbound messages in a bounded queue and hands them to a
//! dedicated storage worker, so a burst of traffic never stalls the network
//! event loop and a flaky store never silently loses data.
//!
//! ## Module Layout
//!
//! ```text
//! mqtt/
//! ├── config.rs            - Validated broker settings and port policy
//! ├── tls.rs               - Trust anchor (PEM) normalization
//! ├── message.rs           - Immutable inbound message record
//! ├── session.rs           - Connection status and subscribed filters
//! ├── transport.rs         - Broker transport seam and reason codes
//! ├── rumqtt_transport.rs  - rumqttc backed transport
//! ├── supervisor.rs        - Connection state machine
//! ├── handlers.rs          - Message handler variants
//! └── client.rs            - Publish/subscribe facade
//! persistence/
//! ├── ingestion_queue.rs   - Bounded drop-on-overflow queue
//! ├── persistence_worker.rs- Storage worker, retry and statistics
//! ├── memory_store.rs      - In-process message store
//! └── sled_store.rs        - On-disk message store
//! bridge.rs                - Wiring and graceful shutdown
//! config.rs                - TOML/env configuration file
//! publisher.rs             - Counter and flood-level test publisher
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Broker ─► rumqttc event loop ─► Supervisor ─► QueuedStoreHandler ─► IngestionQueue
//!                                                                         │
//!                                          MessageStore ◄── StorageWorker ◄┘
//! ```

pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod publisher;

#[cfg(test)]
pub(crate) mod testing;
