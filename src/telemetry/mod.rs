//! Outbound telemetry
//!
//! - [`sample`] - Samples, validation and payload encoding
//! - [`ticket`] - Delivery tickets
//! - [`publisher`] - Submission to the session with ack tracking

pub mod publisher;
pub mod sample;
pub mod ticket;

pub use publisher::{PublisherSettings, TelemetryPublisher};
pub use sample::{parse_field_assignments, TelemetrySample, ValidationError};
pub use ticket::{DeliveryState, PublishTicket};
