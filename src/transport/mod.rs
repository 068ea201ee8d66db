//! Transport abstraction for the device session
//!
//! The session supervisor never talks to an MQTT library directly. It asks a
//! [`Connector`] for a fresh [`Link`] on every (re)connect attempt and drives
//! that link until it fails. The production implementation lives in
//! [`mqtt`]; tests use the in-memory transport from `crate::testing`.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod mqtt;

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// QoS value outside of 0..=2
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid QoS level {0}, expected 0, 1 or 2")]
pub struct InvalidQos(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQos;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Broker credentials. For ThingsBoard the username is the device access token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn access_token(token: impl Into<String>) -> Self {
        Self {
            username: token.into(),
            password: None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &"***")
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Everything a connector needs to open a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    /// Upper bound for a single connect attempt, including the ConnAck wait
    pub connect_timeout: Duration,
    /// Capacity of the transport's outgoing request queue
    pub request_capacity: usize,
}

impl SessionOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            client_id: format!("tbagent-{}", uuid::Uuid::new_v4().simple()),
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            request_capacity: 64,
        }
    }
}

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// Message handed to the transport for publishing
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Failure to establish a session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("broker refused the connection: {0}")]
    Refused(String),
    #[error("no connection acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("re-subscribing '{filter}' failed: {reason}")]
    Subscription { filter: String, reason: String },
    #[error("connection attempt cancelled by shutdown")]
    Cancelled,
}

/// Failure of a single publish. Reported through tickets and receipts.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("session is not connected")]
    NotConnected,
    #[error("outbound queue is full")]
    QueueFull,
    #[error("transport rejected the publish: {0}")]
    Rejected(String),
    #[error("connection lost before delivery was confirmed")]
    ConnectionLost,
    #[error("no delivery acknowledgement within {0:?}")]
    AckTimeout(Duration),
    #[error("session closed")]
    SessionClosed,
}

/// Failure of a live link
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Resolves once the transport confirms (or gives up on) a publish
pub type AckHandle = oneshot::Receiver<Result<(), PublishError>>;

/// Opens links to the broker
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new session. Must only return once the broker has accepted the
    /// connection (ConnAck) or the attempt has definitely failed.
    async fn connect(&self, options: &SessionOptions) -> Result<Box<dyn Link>, ConnectError>;
}

/// A single established broker connection.
///
/// Once [`Link::next_message`] returns an error the link is dead and the
/// supervisor discards it.
#[async_trait]
pub trait Link: Send {
    /// Issue a subscription. Does not wait for the SubAck.
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), LinkError>;

    /// Hand a message to the transport. The returned handle resolves when the
    /// broker acknowledges it (qos >= 1) or as soon as it is accepted (qos 0).
    async fn publish(&mut self, message: &OutboundMessage) -> Result<AckHandle, PublishError>;

    /// Drive the connection until the next inbound message arrives
    async fn next_message(&mut self) -> Result<InboundMessage, LinkError>;

    /// Best-effort graceful disconnect
    async fn disconnect(&mut self);
}
