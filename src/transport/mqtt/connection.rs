//! Pure connection configuration for the rumqttc transport
//!
//! This module contains pure functions that turn session options and broker
//! URLs into rumqttc configuration.

use crate::transport::{QoS, SessionOptions};
use rumqttc::v5::{mqttbytes::QoS as WireQoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use thiserror::Error;
use url::Url;

/// Default port for plain TCP brokers
pub const DEFAULT_PORT: u16 = 1883;

/// Default port for TLS brokers
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Largest packet accepted from the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// rumqttc configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Unsupported broker URL scheme '{0}', expected mqtt or mqtts")]
    UnsupportedScheme(String),
    #[error("Invalid session options: {0}")]
    InvalidOptions(String),
}

/// Broker endpoint parsed from a `mqtt://` or `mqtts://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse a broker URL into host, port and TLS flag (pure function)
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        other => return Err(MqttError::UnsupportedScheme(other.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Map our QoS onto the wire QoS (pure function)
pub fn wire_qos(qos: QoS) -> WireQoS {
    match qos {
        QoS::AtMostOnce => WireQoS::AtMostOnce,
        QoS::AtLeastOnce => WireQoS::AtLeastOnce,
        QoS::ExactlyOnce => WireQoS::ExactlyOnce,
    }
}

/// Pure function to build rumqttc options from session options
pub fn configure_mqtt_options(options: &SessionOptions) -> Result<MqttOptions, MqttError> {
    if options.host.is_empty() {
        return Err(MqttError::InvalidOptions("host is empty".to_string()));
    }
    if options.client_id.is_empty() {
        return Err(MqttError::InvalidOptions("client id is empty".to_string()));
    }

    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);

    if options.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // ThingsBoard authenticates devices by access token in the username field
    if let Some(credentials) = &options.credentials {
        let password = credentials.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(&credentials.username, &password);
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(mqtt_options)
}
