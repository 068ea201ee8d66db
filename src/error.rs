//! Crate-level error aggregation and message sanitization
//!
//! Every component has its own `thiserror` enum; [`AgentError`] wraps them for
//! callers that just want one error type (the CLI, the agent facade).

use crate::config::ConfigError;
use crate::rpc::RpcError;
use crate::telemetry::ValidationError;
use crate::transport::mqtt::MqttError;
use crate::transport::{ConnectError, LinkError, PublishError};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Longest error description that leaves the device
const MAX_MESSAGE_LEN: usize = 500;

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Invalid telemetry: {0}")]
    Validation(#[from] ValidationError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("Subscription failed: {0}")]
    Subscribe(#[from] LinkError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("MQTT configuration error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Agent is already running")]
    AlreadyStarted,

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl AgentError {
    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Description safe to show outside the device
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SECRET_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Redact credentials and secret file paths, cap the length at 500 bytes
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SECRET_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secrets_are_redacted() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_sanitize_case_insensitive_and_colons() {
        let sanitized = sanitize_error_message("PASSWORD: secret123 Key=xyz");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized =
            sanitize_error_message("Failed to read /home/pi/.ssh/id_rsa and /etc/secrets/device.token");

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/pi/.ssh/id_rsa"));
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = sanitize_error_message(&"x".repeat(500));
        assert_eq!(exact.len(), 500);
        assert!(!exact.contains("truncated"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"°".repeat(400));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_agent_error_conversions() {
        let error: AgentError = PublishError::NotConnected.into();
        assert_eq!(error.to_string(), "Publish failed: session is not connected");

        let error: AgentError = ValidationError::MissingField("pressure".to_string()).into();
        assert!(matches!(error, AgentError::Validation(_)));

        let error = AgentError::internal_error("token=abc failed");
        assert!(!error.sanitized_message().contains("abc"));
    }
}
