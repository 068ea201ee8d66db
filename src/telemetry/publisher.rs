//! Telemetry publisher with delivery tracking

use super::sample::{TelemetrySample, ValidationError};
use super::ticket::PublishTicket;
use crate::observability::metrics::metrics;
use crate::protocol::TELEMETRY_TOPIC;
use crate::session::SessionHandle;
use crate::transport::{PublishError, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn, Instrument};

/// Publisher settings taken from the `[telemetry]` configuration section
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    /// Fields every sample must carry
    pub required_fields: Vec<String>,
    /// How long a ticket may stay pending before it fails
    pub ack_timeout: Duration,
    /// Publish the `{"ts", "values"}` form instead of the flat object
    pub include_timestamp: bool,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            ack_timeout: Duration::from_secs(10),
            include_timestamp: false,
        }
    }
}

/// Validates, serializes and publishes telemetry samples
#[derive(Clone)]
pub struct TelemetryPublisher {
    session: SessionHandle,
    settings: Arc<PublisherSettings>,
}

impl TelemetryPublisher {
    pub fn new(session: SessionHandle, settings: PublisherSettings) -> Self {
        Self {
            session,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Submit a sample without blocking.
    ///
    /// Validation errors are returned directly and nothing is sent. Every
    /// other failure (not connected, queue full, transport errors, ack
    /// timeout) is reported through the returned ticket. Must be called from
    /// within a tokio runtime.
    pub fn submit(
        &self,
        sample: &TelemetrySample,
        qos: QoS,
    ) -> Result<PublishTicket, ValidationError> {
        if let Err(error) = sample.validate_required(&self.settings.required_fields) {
            metrics().telemetry_rejected();
            return Err(error);
        }

        let payload = sample.to_bytes(self.settings.include_timestamp);
        metrics().telemetry_submitted();

        let receipt = self.session.publish(TELEMETRY_TOPIC, payload, qos);
        if let Some(error) = receipt.rejection() {
            metrics().telemetry_failed();
            warn!(topic = TELEMETRY_TOPIC, "Telemetry not sent: {}", error);
            return Ok(PublishTicket::failed(TELEMETRY_TOPIC, qos, error.clone()));
        }

        let (ticket, resolver) = PublishTicket::pending(TELEMETRY_TOPIC, qos);
        let ack_timeout = self.settings.ack_timeout;
        let span = crate::telemetry_span!(ticket_id = %ticket.id(), qos = u8::from(qos));

        tokio::spawn(
            async move {
                let outcome = match tokio::time::timeout(ack_timeout, receipt.wait()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(PublishError::AckTimeout(ack_timeout)),
                };
                match &outcome {
                    Ok(()) => {
                        metrics().telemetry_acknowledged();
                        debug!("Telemetry acknowledged");
                    }
                    Err(error) => {
                        metrics().telemetry_failed();
                        warn!("Telemetry delivery failed: {}", error);
                    }
                }
                resolver.resolve(outcome);
            }
            .instrument(span),
        );

        Ok(ticket)
    }
}
