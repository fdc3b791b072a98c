//! # MQTT Integration Module
//!
//! Broker-facing half of mqtt2cmd: how topics are named, how payloads are
//! encoded, and how requests reach the broker and get acknowledged.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker settings and address parsing
//! ├── topics.rs           - Topic naming for the app and each switch
//! ├── message_manager.rs  - Payload codec and inbound topic routing
//! ├── broker.rs           - Broker trait, errors and connection events
//! └── mqtt_handler.rs     - rumqttc implementation with acknowledgement tracking
//! ```
//!
//! The engine only sees the [`broker::Broker`] trait, so the switch logic can be
//! exercised without a live broker.

pub mod broker;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod topics;
