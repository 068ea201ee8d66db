//! rumqttc-backed transport
//!
//! The module is split the same way as the rest of the transport code:
//!
//! - [`connection`] - Pure option building and broker URL parsing
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`client`] - Impure connector and link driving the rumqttc event loop

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttConnector, MqttLink};
pub use connection::{
    configure_mqtt_options, parse_broker_url, BrokerEndpoint, MqttError, DEFAULT_PORT,
    DEFAULT_TLS_PORT,
};
pub use message_handler::{EventRoute, MessageHandler};
