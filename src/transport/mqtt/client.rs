//! Impure I/O operations for the rumqttc transport
//!
//! [`MqttConnector`] opens a fresh rumqttc client/event loop pair per connect
//! attempt and only hands out a [`MqttLink`] after the broker's ConnAck.
//! The link correlates outgoing publishes with their PubAck/PubComp so every
//! publish gets an acknowledgement handle, and only reports a subscription as
//! done once the broker's SubAck granted it.

use super::connection::{configure_mqtt_options, wire_qos};
use super::message_handler::{EventRoute, MessageHandler};
use crate::transport::{
    AckHandle, ConnectError, Connector, InboundMessage, Link, LinkError, OutboundMessage,
    PublishError, QoS, SessionOptions,
};
use async_trait::async_trait;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

type AckSender = oneshot::Sender<Result<(), PublishError>>;

/// Grace period for flushing the DISCONNECT packet on shutdown
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// How long a SUBSCRIBE may wait for its SubAck
const SUBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Production connector backed by rumqttc (MQTT v5)
#[derive(Debug, Default, Clone)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }

    /// Poll the fresh event loop until the broker answers the CONNECT
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectError> {
        loop {
            let event = event_loop.poll().await.map_err(classify_connection_error)?;
            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAcknowledged => return Ok(()),
                EventRoute::ConnectionRefused(code) => return Err(ConnectError::Refused(code)),
                other => debug!(target: "mqtt_transport", "Pre-ConnAck event: {:?}", other),
            }
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, options: &SessionOptions) -> Result<Box<dyn Link>, ConnectError> {
        let mqtt_options = configure_mqtt_options(options)
            .map_err(|e| ConnectError::InvalidOptions(e.to_string()))?;

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, options.request_capacity);

        info!(
            host = %options.host,
            port = options.port,
            tls = options.tls,
            client_id = %options.client_id,
            "Connecting to MQTT broker"
        );

        let outcome =
            tokio::time::timeout(options.connect_timeout, Self::wait_for_connack(&mut event_loop))
                .await;

        match outcome {
            Ok(Ok(())) => {
                info!(host = %options.host, "MQTT broker acknowledged connection");
                Ok(Box::new(MqttLink::new(client, event_loop)))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConnectError::Timeout(options.connect_timeout)),
        }
    }
}

/// Map rumqttc connection errors onto the connect taxonomy (pure function)
fn classify_connection_error(error: ConnectionError) -> ConnectError {
    match error {
        ConnectionError::ConnectionRefused(code) => ConnectError::Refused(format!("{code:?}")),
        other => ConnectError::Network(other.to_string()),
    }
}

/// One live rumqttc connection
pub struct MqttLink {
    client: AsyncClient,
    event_loop: EventLoop,
    /// Acks for qos >= 1 publishes that have not been assigned a packet id yet,
    /// in request order
    awaiting_pkid: VecDeque<AckSender>,
    /// Acks keyed by packet id, waiting for PubAck / PubComp
    inflight: HashMap<u16, AckSender>,
    /// Messages that arrived while a subscribe waited for its SubAck
    buffered: VecDeque<InboundMessage>,
}

impl MqttLink {
    fn new(client: AsyncClient, event_loop: EventLoop) -> Self {
        Self {
            client,
            event_loop,
            awaiting_pkid: VecDeque::new(),
            inflight: HashMap::new(),
            buffered: VecDeque::new(),
        }
    }

    fn resolve(&mut self, pkid: u16, result: Result<(), PublishError>) {
        match self.inflight.remove(&pkid) {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => debug!(target: "mqtt_transport", "Ack for untracked packet id {}", pkid),
        }
    }

    fn fail_pending(&mut self, error: PublishError) {
        for ack in self.awaiting_pkid.drain(..) {
            let _ = ack.send(Err(error.clone()));
        }
        for (_, ack) in self.inflight.drain() {
            let _ = ack.send(Err(error.clone()));
        }
    }

    /// Poll until the SubAck for the one outstanding SUBSCRIBE arrives.
    ///
    /// Inbound publishes seen meanwhile are buffered for `next_message`.
    async fn await_suback(&mut self, filter: &str) -> Result<(), LinkError> {
        loop {
            let event = match self.event_loop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    self.fail_pending(PublishError::ConnectionLost);
                    return Err(LinkError::Closed(e.to_string()));
                }
            };

            let route = MessageHandler::route_mqtt_event(&event);
            let is_suback = matches!(route, EventRoute::SubscriptionConfirmed { .. });
            match self.apply_route(route) {
                Ok(Some(message)) => self.buffered.push_back(message),
                Ok(None) if is_suback => return Ok(()),
                Ok(None) => {}
                Err(LinkError::Rejected(reason)) if is_suback => {
                    return Err(LinkError::Rejected(format!(
                        "broker refused subscription to {filter}: {reason}"
                    )));
                }
                Err(e) => {
                    self.fail_pending(PublishError::ConnectionLost);
                    return Err(e);
                }
            }
        }
    }

    /// Apply a routed event to the ack bookkeeping; returns inbound messages
    fn apply_route(&mut self, route: EventRoute) -> Result<Option<InboundMessage>, LinkError> {
        match route {
            EventRoute::MessageReceived(message) => return Ok(Some(message)),
            EventRoute::PublishSent { pkid } => {
                // qos 0 publishes carry packet id 0 and were resolved on hand-off
                if pkid != 0 {
                    if let Some(ack) = self.awaiting_pkid.pop_front() {
                        self.inflight.insert(pkid, ack);
                    }
                }
            }
            EventRoute::PublishAcknowledged {
                pkid,
                accepted,
                reason,
            } => {
                let result = if accepted {
                    Ok(())
                } else {
                    Err(PublishError::Rejected(reason))
                };
                self.resolve(pkid, result);
            }
            EventRoute::PublishCompleted { pkid } => self.resolve(pkid, Ok(())),
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                // a refused filter leaves the session without a subscription
                // it depends on, so the link is treated as failed
                MessageHandler::validate_subscription_success(&return_codes).map_err(|e| {
                    error!(packet_id, "{}", e);
                    LinkError::Rejected(e)
                })?;
                debug!(target: "mqtt_transport", "Subscription confirmed: {:?}", return_codes);
            }
            EventRoute::Disconnected(reason) => {
                return Err(LinkError::Closed(format!("broker sent DISCONNECT ({reason})")));
            }
            EventRoute::ConnectionAcknowledged | EventRoute::ConnectionRefused(_) => {
                warn!("Unexpected ConnAck on an established link");
            }
            EventRoute::InfrastructureEvent(event) => {
                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
        Ok(None)
    }
}

#[async_trait]
impl Link for MqttLink {
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), LinkError> {
        // try_* never waits on the request queue, which is only drained by
        // polling this same link
        self.client
            .try_subscribe(filter, wire_qos(qos))
            .map_err(|e| LinkError::Rejected(format!("subscribe to {filter} failed: {e}")))?;

        match tokio::time::timeout(SUBACK_TIMEOUT, self.await_suback(filter)).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Closed(format!(
                "no SubAck for {filter} within {SUBACK_TIMEOUT:?}"
            ))),
        }
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<AckHandle, PublishError> {
        self.client
            .try_publish(
                message.topic.clone(),
                wire_qos(message.qos),
                message.retain,
                message.payload.clone(),
            )
            .map_err(|e| match e {
                rumqttc::v5::ClientError::TryRequest(_) => PublishError::QueueFull,
                other => PublishError::Rejected(other.to_string()),
            })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if message.qos == QoS::AtMostOnce {
            let _ = ack_tx.send(Ok(()));
        } else {
            self.awaiting_pkid.push_back(ack_tx);
        }
        Ok(ack_rx)
    }

    async fn next_message(&mut self) -> Result<InboundMessage, LinkError> {
        if let Some(message) = self.buffered.pop_front() {
            return Ok(message);
        }

        loop {
            let event = match self.event_loop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    self.fail_pending(PublishError::ConnectionLost);
                    return Err(LinkError::Closed(e.to_string()));
                }
            };

            let route = MessageHandler::route_mqtt_event(&event);
            match self.apply_route(route) {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => continue,
                Err(e) => {
                    self.fail_pending(PublishError::ConnectionLost);
                    return Err(e);
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to queue MQTT DISCONNECT: {}", e);
        }

        let event_loop = &mut self.event_loop;
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("MQTT DISCONNECT not flushed within {:?}", DISCONNECT_GRACE);
        }

        self.fail_pending(PublishError::SessionClosed);
        info!("MQTT link disconnected");
    }
}
