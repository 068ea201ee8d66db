//! Delivery tickets for submitted telemetry

use crate::transport::{PublishError, QoS};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Delivery progress of one publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Acknowledged,
    Failed(PublishError),
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryState::Pending)
    }
}

/// Handle on an in-flight or completed telemetry publish.
///
/// Cloning shares the same underlying state.
#[derive(Debug, Clone)]
pub struct PublishTicket {
    id: Uuid,
    topic: String,
    qos: QoS,
    state_rx: watch::Receiver<DeliveryState>,
}

/// Write side of a ticket, consumed when the outcome is known
#[derive(Debug)]
pub(crate) struct TicketResolver {
    state_tx: watch::Sender<DeliveryState>,
}

impl TicketResolver {
    pub(crate) fn resolve(self, outcome: Result<(), PublishError>) {
        let state = match outcome {
            Ok(()) => DeliveryState::Acknowledged,
            Err(error) => DeliveryState::Failed(error),
        };
        self.state_tx.send_replace(state);
    }
}

impl PublishTicket {
    pub(crate) fn pending(topic: impl Into<String>, qos: QoS) -> (Self, TicketResolver) {
        let (state_tx, state_rx) = watch::channel(DeliveryState::Pending);
        let ticket = Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            qos,
            state_rx,
        };
        (ticket, TicketResolver { state_tx })
    }

    pub(crate) fn failed(topic: impl Into<String>, qos: QoS, error: PublishError) -> Self {
        let (ticket, resolver) = Self::pending(topic, qos);
        resolver.resolve(Err(error));
        ticket
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Current state without waiting
    pub fn state(&self) -> DeliveryState {
        self.state_rx.borrow().clone()
    }

    /// Wait for a terminal state
    pub async fn wait(&self) -> DeliveryState {
        let mut state_rx = self.state_rx.clone();
        let outcome = state_rx
            .wait_for(DeliveryState::is_terminal)
            .await
            .map(|state| state.clone());
        match outcome {
            Ok(state) => state,
            // resolver dropped without an outcome
            Err(_) => match self.state() {
                DeliveryState::Pending => DeliveryState::Failed(PublishError::SessionClosed),
                terminal => terminal,
            },
        }
    }

    /// Like [`PublishTicket::wait`] but gives up after `timeout`
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<DeliveryState> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticket_resolution() {
        let (ticket, resolver) = PublishTicket::pending("v1/devices/me/telemetry", QoS::AtLeastOnce);
        assert_eq!(ticket.state(), DeliveryState::Pending);

        let observer = ticket.clone();
        resolver.resolve(Ok(()));

        assert_eq!(observer.wait().await, DeliveryState::Acknowledged);
        assert_eq!(ticket.state(), DeliveryState::Acknowledged);
    }

    #[tokio::test]
    async fn test_failed_ticket_is_terminal() {
        let ticket = PublishTicket::failed("t", QoS::AtMostOnce, PublishError::NotConnected);
        assert_eq!(
            ticket.wait().await,
            DeliveryState::Failed(PublishError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_dropped_resolver_fails_ticket() {
        let (ticket, resolver) = PublishTicket::pending("t", QoS::AtLeastOnce);
        drop(resolver);
        assert_eq!(
            ticket.wait().await,
            DeliveryState::Failed(PublishError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn test_wait_timeout_on_pending() {
        let (ticket, _resolver) = PublishTicket::pending("t", QoS::AtLeastOnce);
        assert!(ticket.wait_timeout(Duration::from_millis(20)).await.is_none());
        assert_eq!(ticket.id(), ticket.clone().id());
    }
}
