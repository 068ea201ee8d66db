//! Pure session state and reconnect policy
//!
//! Everything here is free of I/O so the supervisor's decisions can be tested
//! without a broker.

use crate::transport::ConnectError;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Connection state of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped by the caller
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Broker accepted the session and every subscription is applied
    Connected,
    /// Backing off before reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
        }
    }
}

/// Lifecycle events broadcast to status listeners
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting { attempt: u32 },
    Connected,
    ConnectFailed { attempt: u32, error: ConnectError },
    ConnectionLost { reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    Subscribed { filter: String },
    SubscribeFailed { filter: String, reason: String },
    Disconnected,
}

/// Reconnect backoff policy
///
/// Delays grow as `base * 2^(attempt - 1)` up to `max_delay`. With `jitter`
/// enabled the actual delay is drawn uniformly from `[0, ceiling]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl ReconnectConfig {
    /// Upper bound of the delay before attempt `attempt` (1-based)
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let ceiling_ms = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);
        Duration::from_millis(ceiling_ms)
    }

    /// Delay to wait before attempt `attempt` (full jitter when enabled)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("reconnect base delay must be greater than zero".to_string());
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "reconnect base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            ));
        }
        Ok(())
    }
}

/// Log connection state transition (pure logging function)
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match (from, to) {
        (_, ConnectionState::Connected) => {
            info!("Device session established");
        }
        (ConnectionState::Reconnecting { attempt }, ConnectionState::Connecting) => {
            info!(attempt, "Reconnecting");
        }
        (ConnectionState::Connected, ConnectionState::Reconnecting { .. }) => {
            warn!("Device session lost, reconnecting");
        }
        (_, ConnectionState::Reconnecting { attempt }) => {
            info!(attempt, "Scheduling reconnection attempt");
        }
        (_, ConnectionState::Disconnected) => {
            info!("Device session closed");
        }
        (from, to) if from == to => {}
        (from, to) => {
            info!("Session state {} -> {}", from, to);
        }
    }
}

/// Log a failed attempt with the severity it deserves
pub fn log_connect_failure(attempt: u32, error: &ConnectError) {
    match error {
        ConnectError::Refused(_) | ConnectError::InvalidOptions(_) => {
            error!(attempt, "Connection attempt failed: {}", error);
        }
        _ => warn!(attempt, "Connection attempt failed: {}", error),
    }
}
