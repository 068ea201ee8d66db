//! Connection supervisor: the background task that owns the device session
//!
//! A single driver task owns the [`Link`], the subscription list and the
//! reconnect loop. Callers talk to it through a bounded command channel via
//! the cloneable [`SessionHandle`] and observe it through a `watch` channel
//! (state) and a `broadcast` channel (lifecycle events).

use super::state::{
    log_connect_failure, log_state_transition, ConnectionState, ReconnectConfig, SessionEvent,
};
use crate::observability::metrics::metrics;
use crate::protocol::{topic_matches, RPC_REQUEST_FILTER};
use crate::transport::{
    AckHandle, ConnectError, Connector, InboundMessage, Link, LinkError, OutboundMessage,
    PublishError, QoS, SessionOptions,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Time the driver gets to disconnect cleanly before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const EVENT_CAPACITY: usize = 64;

enum Command {
    Publish {
        message: OutboundMessage,
        reply: oneshot::Sender<Result<AckHandle, PublishError>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        sink: mpsc::Sender<InboundMessage>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
}

struct Subscription {
    filter: String,
    qos: QoS,
    sink: mpsc::Sender<InboundMessage>,
}

/// Outcome of a publish handed to the session
#[must_use = "a receipt does nothing unless waited on"]
pub struct DeliveryReceipt {
    inner: Receipt,
}

enum Receipt {
    Failed(PublishError),
    Queued(oneshot::Receiver<Result<AckHandle, PublishError>>),
}

impl DeliveryReceipt {
    fn failed(error: PublishError) -> Self {
        Self {
            inner: Receipt::Failed(error),
        }
    }

    /// Error when the publish was refused before reaching the driver
    pub fn rejection(&self) -> Option<&PublishError> {
        match &self.inner {
            Receipt::Failed(error) => Some(error),
            Receipt::Queued(_) => None,
        }
    }

    /// Wait until the transport confirms or gives up on the publish
    pub async fn wait(self) -> Result<(), PublishError> {
        let reply = match self.inner {
            Receipt::Failed(error) => return Err(error),
            Receipt::Queued(reply) => reply,
        };
        let ack = reply.await.map_err(|_| PublishError::SessionClosed)??;
        ack.await.map_err(|_| PublishError::ConnectionLost)?
    }
}

/// Cloneable handle used to publish, subscribe and observe the session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Queue a publish without blocking.
    ///
    /// Fails immediately with `NotConnected` outside of `Connected` and with
    /// `QueueFull` when the command channel is saturated. Publishes from one
    /// caller reach the transport in call order.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> DeliveryReceipt {
        if !self.state().can_publish() {
            return DeliveryReceipt::failed(PublishError::NotConnected);
        }

        let message = OutboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        };
        let (reply, reply_rx) = oneshot::channel();
        match self.commands.try_send(Command::Publish { message, reply }) {
            Ok(()) => DeliveryReceipt {
                inner: Receipt::Queued(reply_rx),
            },
            Err(TrySendError::Full(_)) => DeliveryReceipt::failed(PublishError::QueueFull),
            Err(TrySendError::Closed(_)) => DeliveryReceipt::failed(PublishError::SessionClosed),
        }
    }

    /// Register a subscription.
    ///
    /// The filter is re-applied on every reconnect. Registering a filter again
    /// replaces its sink and keeps its position. While offline the call only
    /// records the subscription.
    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        sink: mpsc::Sender<InboundMessage>,
    ) -> Result<(), LinkError> {
        let (reply, reply_rx) = oneshot::channel();
        let command = Command::Subscribe {
            filter: filter.into(),
            qos,
            sink,
            reply,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| LinkError::Closed("session closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| LinkError::Closed("session closed".to_string()))?
    }

    /// Wait until the session reports `Connected`; false on timeout
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut state_rx = self.state_rx.clone();
        let connected = matches!(
            tokio::time::timeout(
                timeout,
                state_rx.wait_for(|state| *state == ConnectionState::Connected)
            )
            .await,
            Ok(Ok(_))
        );
        connected
    }
}

/// Owner of the session driver task
pub struct ConnectionSupervisor {
    handle: SessionHandle,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    shutdown_tx: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    /// Start the driver without waiting for the first connection. Failures are
    /// retried forever and reported as [`SessionEvent::ConnectFailed`].
    pub fn spawn(
        connector: Arc<dyn Connector>,
        options: SessionOptions,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self::launch(connector, options, reconnect).0
    }

    /// Start the driver and wait for the outcome of the first attempt.
    ///
    /// When the first attempt fails the driver is stopped and the error
    /// returned instead of entering the reconnect loop.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        options: SessionOptions,
        reconnect: ReconnectConfig,
    ) -> Result<Self, ConnectError> {
        let (mut supervisor, mut events) = Self::launch(connector, options, reconnect);

        loop {
            match events.recv().await {
                Ok(SessionEvent::Connected) => return Ok(supervisor),
                Ok(SessionEvent::ConnectFailed { error, .. }) => {
                    supervisor.disconnect().await;
                    return Err(error);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if supervisor.state() == ConnectionState::Connected {
                        return Ok(supervisor);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ConnectError::Cancelled),
            }
        }
    }

    fn launch(
        connector: Arc<dyn Connector>,
        options: SessionOptions,
        reconnect: ReconnectConfig,
    ) -> (Self, broadcast::Receiver<SessionEvent>) {
        let (commands_tx, commands_rx) = mpsc::channel(options.request_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_tx = Arc::new(state_tx);

        let span = crate::session_span!(client_id = %options.client_id, host = %options.host);
        let driver = SessionDriver {
            connector,
            options,
            reconnect,
            commands: commands_rx,
            shutdown: shutdown_rx,
            state_tx: Arc::clone(&state_tx),
            events_tx: events_tx.clone(),
            subscriptions: Vec::new(),
        };
        let join = tokio::spawn(driver.run().instrument(span));

        let supervisor = Self {
            handle: SessionHandle {
                commands: commands_tx,
                state_rx,
                events_tx,
            },
            state_tx,
            shutdown_tx,
            driver: Some(join),
        };
        (supervisor, events_rx)
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.handle.state_changes()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.handle.events()
    }

    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> DeliveryReceipt {
        self.handle.publish(topic, payload, qos)
    }

    pub async fn subscribe(
        &self,
        filter: impl Into<String>,
        qos: QoS,
        sink: mpsc::Sender<InboundMessage>,
    ) -> Result<(), LinkError> {
        self.handle.subscribe(filter, qos, sink).await
    }

    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        self.handle.wait_connected(timeout).await
    }

    /// Stop the driver: cancels any backoff wait, disconnects the link and
    /// joins the task. Idempotent.
    pub async fn disconnect(&mut self) {
        self.shutdown_tx.send_replace(true);

        let Some(mut driver) = self.driver.take() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut driver).await.is_err() {
            warn!("Session driver did not stop within {:?}, aborting", SHUTDOWN_GRACE);
            driver.abort();
            self.state_tx.send_replace(ConnectionState::Disconnected);
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Resolves once shutdown has been requested or the supervisor is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

enum Established {
    Link(Box<dyn Link>),
    Failed(ConnectError),
    Shutdown,
}

enum Served {
    Lost(String),
    Shutdown,
}

struct SessionDriver {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    reconnect: ReconnectConfig,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: broadcast::Sender<SessionEvent>,
    subscriptions: Vec<Subscription>,
}

impl SessionDriver {
    async fn run(mut self) {
        // 0 for the initial connect, n for the n-th reconnect since the
        // session was last up
        let mut attempt: u32 = 0;

        loop {
            match self.establish(attempt).await {
                Established::Shutdown => break,
                Established::Failed(error) => {
                    log_connect_failure(attempt, &error);
                    metrics().mqtt_connection_failed();
                    self.emit(SessionEvent::ConnectFailed { attempt, error });
                }
                Established::Link(link) => {
                    attempt = 0;
                    match self.serve(link).await {
                        Served::Shutdown => break,
                        Served::Lost(reason) => {
                            metrics().mqtt_connection_lost();
                            warn!(%reason, "Connection lost");
                            self.emit(SessionEvent::ConnectionLost { reason });
                        }
                    }
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.reconnect.delay_for_attempt(attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off");

            if !self.backoff(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.emit(SessionEvent::Disconnected);
    }

    /// One connect attempt plus re-subscription of every registered filter
    async fn establish(&mut self, attempt: u32) -> Established {
        metrics().mqtt_connection_attempt();
        self.set_state(ConnectionState::Connecting);
        self.emit(SessionEvent::Connecting { attempt });

        let connector = Arc::clone(&self.connector);
        let options = self.options.clone();
        let connect = async move { connector.connect(&options).await };
        tokio::pin!(connect);

        let mut link = loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return Established::Shutdown,
                result = &mut connect => match result {
                    Ok(link) => break link,
                    Err(error) => return Established::Failed(error),
                },
                Some(command) = self.commands.recv() => self.handle_offline(command),
            }
        };

        if let Err(error) = self.resubscribe(link.as_mut()).await {
            link.disconnect().await;
            return Established::Failed(error);
        }

        self.set_state(ConnectionState::Connected);
        metrics().mqtt_connection_established();
        self.emit(SessionEvent::Connected);
        Established::Link(link)
    }

    async fn resubscribe(&self, link: &mut dyn Link) -> Result<(), ConnectError> {
        for subscription in &self.subscriptions {
            link.subscribe(&subscription.filter, subscription.qos)
                .await
                .map_err(|e| ConnectError::Subscription {
                    filter: subscription.filter.clone(),
                    reason: e.to_string(),
                })?;
            debug!(filter = %subscription.filter, "Re-subscribed");
            self.emit(SessionEvent::Subscribed {
                filter: subscription.filter.clone(),
            });
        }
        Ok(())
    }

    async fn serve(&mut self, mut link: Box<dyn Link>) -> Served {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    link.disconnect().await;
                    return Served::Shutdown;
                }
                Some(command) = self.commands.recv() => {
                    self.handle_online(link.as_mut(), command).await;
                }
                inbound = link.next_message() => match inbound {
                    Ok(message) => self.route_inbound(message),
                    Err(error) => return Served::Lost(error.to_string()),
                },
            }
        }
    }

    /// Interruptible backoff; false when shutdown was requested
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return false,
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv() => self.handle_offline(command),
            }
        }
    }

    fn handle_offline(&mut self, command: Command) {
        match command {
            Command::Publish { reply, .. } => {
                metrics().mqtt_publish_failed();
                let _ = reply.send(Err(PublishError::NotConnected));
            }
            Command::Subscribe {
                filter,
                qos,
                sink,
                reply,
            } => {
                debug!(%filter, "Recorded subscription while offline");
                self.record_subscription(filter, qos, sink);
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn handle_online(&mut self, link: &mut dyn Link, command: Command) {
        match command {
            Command::Publish { message, reply } => {
                let result = link.publish(&message).await;
                match &result {
                    Ok(_) => metrics().mqtt_message_published(),
                    Err(error) => {
                        metrics().mqtt_publish_failed();
                        warn!(topic = %message.topic, "Publish rejected: {}", error);
                    }
                }
                let _ = reply.send(result);
            }
            Command::Subscribe {
                filter,
                qos,
                sink,
                reply,
            } => {
                let result = link.subscribe(&filter, qos).await;
                match &result {
                    Ok(()) => {
                        info!(%filter, "Subscribed");
                        self.record_subscription(filter.clone(), qos, sink);
                        self.emit(SessionEvent::Subscribed { filter });
                    }
                    // not recorded, so a later reconnect does not retry it
                    Err(error) => {
                        warn!(%filter, "Subscribe failed: {}", error);
                        self.emit(SessionEvent::SubscribeFailed {
                            filter,
                            reason: error.to_string(),
                        });
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    fn record_subscription(&mut self, filter: String, qos: QoS, sink: mpsc::Sender<InboundMessage>) {
        match self.subscriptions.iter_mut().find(|s| s.filter == filter) {
            Some(existing) => {
                existing.qos = qos;
                existing.sink = sink;
            }
            None => self.subscriptions.push(Subscription { filter, qos, sink }),
        }
    }

    fn route_inbound(&self, message: InboundMessage) {
        metrics().mqtt_message_received();

        let mut delivered = false;
        for subscription in self
            .subscriptions
            .iter()
            .filter(|s| topic_matches(&s.filter, &message.topic))
        {
            match subscription.sink.try_send(message.clone()) {
                Ok(()) => delivered = true,
                Err(TrySendError::Full(_)) => {
                    metrics().mqtt_message_dropped();
                    if topic_matches(RPC_REQUEST_FILTER, &message.topic) {
                        // the platform sees this request time out
                        metrics().rpc_dropped();
                        error!(topic = %message.topic, "RPC queue full, request dropped without a response");
                    } else {
                        warn!(topic = %message.topic, filter = %subscription.filter, "Subscriber queue full, dropping message");
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(filter = %subscription.filter, "Subscriber gone");
                }
            }
        }

        if !delivered {
            debug!(topic = %message.topic, "Inbound message had no receiver");
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        log_state_transition(previous, next);
    }

    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockBroker;

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_connect_reports_connected() {
        let broker = MockBroker::new();
        let mut supervisor = ConnectionSupervisor::connect(
            broker.connector(),
            SessionOptions::new("localhost", 1883),
            fast_reconnect(),
        )
        .await
        .unwrap();

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        supervisor.disconnect().await;
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_returns_first_failure() {
        let broker = MockBroker::new();
        broker.fail_next_connects(1).await;

        let result = ConnectionSupervisor::connect(
            broker.connector(),
            SessionOptions::new("localhost", 1883),
            fast_reconnect(),
        )
        .await;

        assert!(matches!(result, Err(ConnectError::Network(_))));
        assert_eq!(broker.connect_attempts().await, 1);
    }

    #[tokio::test]
    async fn test_publish_while_offline_fails_fast() {
        let broker = MockBroker::new();
        broker.fail_next_connects(u32::MAX).await;
        let mut supervisor = ConnectionSupervisor::spawn(
            broker.connector(),
            SessionOptions::new("localhost", 1883),
            fast_reconnect(),
        );

        let receipt = supervisor.publish("v1/devices/me/telemetry", "{}", QoS::AtLeastOnce);
        assert_eq!(receipt.rejection(), Some(&PublishError::NotConnected));
        assert_eq!(receipt.wait().await, Err(PublishError::NotConnected));
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn test_subscribe_replaces_sink_in_place() {
        let broker = MockBroker::new();
        let mut supervisor = ConnectionSupervisor::connect(
            broker.connector(),
            SessionOptions::new("localhost", 1883),
            fast_reconnect(),
        )
        .await
        .unwrap();

        let (first_tx, mut first_rx) = mpsc::channel(4);
        let (second_tx, mut second_rx) = mpsc::channel(4);
        supervisor.subscribe("a/+", QoS::AtLeastOnce, first_tx).await.unwrap();
        supervisor.subscribe("a/+", QoS::AtLeastOnce, second_tx).await.unwrap();

        broker.inject("a/1", "hello").await;
        let message = tokio::time::timeout(Duration::from_secs(1), second_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&message.payload[..], b"hello");
        assert!(first_rx.try_recv().is_err());

        supervisor.disconnect().await;
    }
}
