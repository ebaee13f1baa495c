//! # Broker session
//!
//! Keeps exactly one MQTT session to the broker alive and hands every publish
//! on it to the dispatcher.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker endpoint, poll cadence and reconnect backoff
//! ├── message_manager.rs  - Received message representation
//! ├── mqtt_handler.rs     - Session state machine, reconnect procedure, step()
//! └── transport.rs        - Connector/link seam and the rumqttc implementation
//! ```
//!
//! Transport faults never leave this module except as a logged state
//! transition; only a failed first connect or an exhausted reconnect budget
//! is reported upwards.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
pub mod transport;
