//! Device session management
//!
//! - [`state`] - Pure connection state, events and backoff policy
//! - [`supervisor`] - Background driver owning the broker link

pub mod state;
pub mod supervisor;

pub use state::{ConnectionState, ReconnectConfig, SessionEvent};
pub use supervisor::{ConnectionSupervisor, DeliveryReceipt, SessionHandle};
