//! Device agent composition root
//!
//! [`Agent`] owns the supervised MQTT session, the telemetry publisher and
//! the RPC dispatcher, and exposes the caller-facing API.

pub mod lifecycle;

pub use lifecycle::{merge_fields, Agent};
