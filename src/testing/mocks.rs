//! In-memory broker for testing the session, telemetry and RPC paths
//!
//! [`MockBroker`] hands out [`MockConnector`]s whose links record everything
//! they are asked to do and can be steered from the test: refuse or stall
//! connects, drop the live connection, reject publishes or subscriptions, hold
//! back acknowledgements and deliver inbound messages.

use crate::transport::{
    AckHandle, ConnectError, Connector, InboundMessage, Link, LinkError, OutboundMessage,
    PublishError, QoS, SessionOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A publish the broker accepted
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// 1-based number of the connection it arrived on
    pub connection: u32,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

enum LinkSignal {
    Deliver(InboundMessage),
    Drop(String),
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: u32,
    connections: u32,
    fail_connects: u32,
    hang_connects: bool,
    reject_publishes: bool,
    reject_subscribes: bool,
    withhold_acks: bool,
    held_acks: Vec<oneshot::Sender<Result<(), PublishError>>>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(u32, String)>,
    live: Option<(u32, mpsc::UnboundedSender<LinkSignal>)>,
    last_options: Option<SessionOptions>,
}

/// Shared broker state plus the knobs tests turn
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    // Fault injection

    /// Refuse the next `count` connection attempts with a network error
    pub async fn fail_next_connects(&self, count: u32) {
        self.state.lock().await.fail_connects = count;
    }

    /// Leave connection attempts unanswered, like a blackholed broker
    pub async fn set_hang_connects(&self, hang: bool) {
        self.state.lock().await.hang_connects = hang;
    }

    pub async fn set_reject_publishes(&self, reject: bool) {
        self.state.lock().await.reject_publishes = reject;
    }

    /// Refuse SUBSCRIBE requests as a broker SubAck with `NotAuthorized` would
    pub async fn set_reject_subscribes(&self, reject: bool) {
        self.state.lock().await.reject_subscribes = reject;
    }

    /// Accept QoS 1/2 publishes without acknowledging them
    pub async fn set_withhold_acks(&self, withhold: bool) {
        self.state.lock().await.withhold_acks = withhold;
    }

    /// Acknowledge every held publish; returns how many were released
    pub async fn release_held_acks(&self) -> usize {
        let held: Vec<_> = self.state.lock().await.held_acks.drain(..).collect();
        let count = held.len();
        for ack in held {
            let _ = ack.send(Ok(()));
        }
        count
    }

    /// Deliver a message to the live connection; false when there is none
    pub async fn inject(&self, topic: impl Into<String>, payload: impl Into<Bytes>) -> bool {
        let message = InboundMessage::new(topic, payload);
        match &self.state.lock().await.live {
            Some((_, link)) => link.send(LinkSignal::Deliver(message)).is_ok(),
            None => false,
        }
    }

    /// Kill the live connection as if the network went away.
    ///
    /// Held acknowledgements fail with `ConnectionLost`.
    pub async fn drop_connection(&self) -> bool {
        let mut state = self.state.lock().await;
        for ack in state.held_acks.drain(..) {
            let _ = ack.send(Err(PublishError::ConnectionLost));
        }
        match state.live.take() {
            Some((_, link)) => link
                .send(LinkSignal::Drop("connection reset by mock broker".to_string()))
                .is_ok(),
            None => false,
        }
    }

    // Recorders

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// `(connection, filter)` in the order the subscriptions were issued
    pub async fn subscriptions(&self) -> Vec<(u32, String)> {
        self.state.lock().await.subscriptions.clone()
    }

    pub async fn connect_attempts(&self) -> u32 {
        self.state.lock().await.connect_attempts
    }

    /// Successful connections so far
    pub async fn connections(&self) -> u32 {
        self.state.lock().await.connections
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.live.is_some()
    }

    pub async fn last_options(&self) -> Option<SessionOptions> {
        self.state.lock().await.last_options.clone()
    }

    // Waiters

    /// Wait until at least `count` messages were published on `topic`
    pub async fn wait_for_published(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<PublishedMessage> {
        self.wait_until(timeout, |state| {
            state.published.iter().filter(|m| m.topic == topic).count() >= count
        })
        .await;
        self.published_on(topic).await
    }

    /// Wait until `filter` was subscribed on connection number `connection`
    pub async fn wait_for_subscription(
        &self,
        filter: &str,
        connection: u32,
        timeout: Duration,
    ) -> bool {
        self.wait_until(timeout, |state| {
            state
                .subscriptions
                .iter()
                .any(|(conn, f)| *conn == connection && f == filter)
        })
        .await
    }

    pub async fn wait_for_connections(&self, count: u32, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.connections >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, condition: impl Fn(&BrokerState) -> bool) -> bool {
        let poll = async {
            loop {
                if condition(&*self.state.lock().await) {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }
}

/// [`Connector`] backed by a [`MockBroker`]
pub struct MockConnector {
    broker: MockBroker,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, options: &SessionOptions) -> Result<Box<dyn Link>, ConnectError> {
        let mut state = self.broker.state.lock().await;
        state.connect_attempts += 1;
        state.last_options = Some(options.clone());

        if state.hang_connects {
            drop(state);
            return std::future::pending().await;
        }

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ConnectError::Network("mock broker unavailable".to_string()));
        }

        state.connections += 1;
        let connection = state.connections;
        let (tx, rx) = mpsc::unbounded_channel();
        // a previous link, if any, sees its channel close
        state.live = Some((connection, tx));

        Ok(Box::new(MockLink {
            broker: self.broker.clone(),
            connection,
            signals: rx,
        }))
    }
}

/// One connection to the [`MockBroker`]
pub struct MockLink {
    broker: MockBroker,
    connection: u32,
    signals: mpsc::UnboundedReceiver<LinkSignal>,
}

#[async_trait]
impl Link for MockLink {
    async fn subscribe(&mut self, filter: &str, _qos: QoS) -> Result<(), LinkError> {
        let mut state = self.broker.state.lock().await;
        if state.reject_subscribes {
            return Err(LinkError::Rejected(format!(
                "broker refused subscription to {filter}: NotAuthorized"
            )));
        }
        state.subscriptions.push((self.connection, filter.to_string()));
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<AckHandle, PublishError> {
        let mut state = self.broker.state.lock().await;
        if state.reject_publishes {
            return Err(PublishError::Rejected(
                "mock broker rejected the publish".to_string(),
            ));
        }

        state.published.push(PublishedMessage {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            connection: self.connection,
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        if state.withhold_acks && message.qos != QoS::AtMostOnce {
            state.held_acks.push(ack_tx);
        } else {
            let _ = ack_tx.send(Ok(()));
        }
        Ok(ack_rx)
    }

    async fn next_message(&mut self) -> Result<InboundMessage, LinkError> {
        match self.signals.recv().await {
            Some(LinkSignal::Deliver(message)) => Ok(message),
            Some(LinkSignal::Drop(reason)) => Err(LinkError::Closed(reason)),
            None => Err(LinkError::Closed("link replaced".to_string())),
        }
    }

    async fn disconnect(&mut self) {
        let mut state = self.broker.state.lock().await;
        if matches!(&state.live, Some((connection, _)) if *connection == self.connection) {
            state.live = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, qos: QoS) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: Bytes::from_static(b"{}"),
            qos,
            retain: false,
        }
    }

    #[tokio::test]
    async fn test_connect_failures_then_success() {
        let broker = MockBroker::new();
        broker.fail_next_connects(2).await;
        let connector = broker.connector();
        let options = SessionOptions::new("localhost", 1883);

        assert!(connector.connect(&options).await.is_err());
        assert!(connector.connect(&options).await.is_err());
        assert!(connector.connect(&options).await.is_ok());
        assert_eq!(broker.connect_attempts().await, 3);
        assert_eq!(broker.connections().await, 1);
    }

    #[tokio::test]
    async fn test_withheld_acks_release_and_drop() {
        let broker = MockBroker::new();
        let mut link = broker
            .connector()
            .connect(&SessionOptions::new("localhost", 1883))
            .await
            .unwrap();
        broker.set_withhold_acks(true).await;

        let qos0 = link.publish(&message("a", QoS::AtMostOnce)).await.unwrap();
        assert_eq!(qos0.await.unwrap(), Ok(()));

        let first = link.publish(&message("a", QoS::AtLeastOnce)).await.unwrap();
        assert_eq!(broker.release_held_acks().await, 1);
        assert_eq!(first.await.unwrap(), Ok(()));

        let second = link.publish(&message("a", QoS::AtLeastOnce)).await.unwrap();
        assert!(broker.drop_connection().await);
        assert_eq!(second.await.unwrap(), Err(PublishError::ConnectionLost));
        assert!(matches!(link.next_message().await, Err(LinkError::Closed(_))));
    }

    #[tokio::test]
    async fn test_rejected_subscribe_is_not_recorded() {
        let broker = MockBroker::new();
        let mut link = broker
            .connector()
            .connect(&SessionOptions::new("localhost", 1883))
            .await
            .unwrap();
        broker.set_reject_subscribes(true).await;

        let result = link.subscribe("v1/devices/me/rpc/request/+", QoS::AtLeastOnce).await;
        assert!(matches!(result, Err(LinkError::Rejected(_))));
        assert!(broker.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_hung_connect_never_resolves() {
        let broker = MockBroker::new();
        broker.set_hang_connects(true).await;
        let connector = broker.connector();
        let options = SessionOptions::new("localhost", 1883);

        let attempt = tokio::time::timeout(Duration::from_millis(50), connector.connect(&options));
        assert!(attempt.await.is_err());
        assert_eq!(broker.connect_attempts().await, 1);
        assert_eq!(broker.connections().await, 0);
    }

    #[tokio::test]
    async fn test_inject_reaches_live_link() {
        let broker = MockBroker::new();
        assert!(!broker.inject("t", "x").await);

        let mut link = broker
            .connector()
            .connect(&SessionOptions::new("localhost", 1883))
            .await
            .unwrap();
        assert!(broker.inject("v1/devices/me/rpc/request/1", "{}").await);

        let inbound = link.next_message().await.unwrap();
        assert_eq!(inbound.topic, "v1/devices/me/rpc/request/1");

        link.disconnect().await;
        assert!(!broker.is_connected().await);
    }
}
