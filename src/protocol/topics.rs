//! Device API topic layout and topic filter matching
//!
//! The device talks to the platform through a fixed set of `v1/devices/me/...`
//! topics. RPC requests arrive on `v1/devices/me/rpc/request/{requestId}` and
//! the matching response goes to `v1/devices/me/rpc/response/{requestId}`.

use thiserror::Error;

/// Topic that telemetry samples are published to
pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";

/// Prefix of every inbound RPC request topic
pub const RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";

/// Subscription filter covering every inbound RPC request
pub const RPC_REQUEST_FILTER: &str = "v1/devices/me/rpc/request/+";

/// Prefix of every outbound RPC response topic
pub const RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";

/// Inbound topic could not be mapped to an RPC request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TopicFormatError {
    #[error("topic '{0}' is not an RPC request topic")]
    NotRpcRequest(String),
    #[error("topic '{topic}' carries an invalid request id '{request_id}'")]
    InvalidRequestId { topic: String, request_id: String },
}

/// Build the response topic for a request id: `v1/devices/me/rpc/response/{id}`
pub fn rpc_response_topic(request_id: &str) -> String {
    format!("{RPC_RESPONSE_PREFIX}{request_id}")
}

/// Extract the request id from an RPC request topic.
///
/// The id is the final path segment and must be a non-empty run of ASCII
/// digits directly under [`RPC_REQUEST_PREFIX`].
pub fn extract_request_id(topic: &str) -> Result<&str, TopicFormatError> {
    let request_id = topic
        .strip_prefix(RPC_REQUEST_PREFIX)
        .ok_or_else(|| TopicFormatError::NotRpcRequest(topic.to_string()))?;

    if request_id.is_empty() || !request_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TopicFormatError::InvalidRequestId {
            topic: topic.to_string(),
            request_id: request_id.to_string(),
        });
    }

    Ok(request_id)
}

/// Check whether a concrete topic name matches an MQTT topic filter.
///
/// `+` matches exactly one level, `#` matches the remaining levels (including
/// none). Topics starting with `$` are never matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
