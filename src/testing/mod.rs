//! Testing utilities
//!
//! An in-memory broker so the session, telemetry and RPC paths can be
//! exercised without a running MQTT server.

pub mod mocks;

pub use mocks::{MockBroker, MockConnector, MockLink, PublishedMessage};
