//! RPC envelopes exchanged with the platform
//!
//! Requests arrive as `{"method": "...", "params": ...}` on a request topic whose
//! last segment is the request id. Responses are published as
//! `{"status":"success","result":...}` or
//! `{"status":"error","error":{"code":"...","message":"..."}}`.

use super::topics::{extract_request_id, rpc_response_topic, TopicFormatError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Inbound RPC message that cannot be turned into a request
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MalformedRequestError {
    #[error("request topic rejected: {0}")]
    Topic(#[from] TopicFormatError),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("payload has no string 'method' field")]
    MissingMethod,
}

/// Raw request body as sent by the platform
#[derive(Debug, Deserialize)]
struct RequestBody {
    method: Option<Value>,
    #[serde(default)]
    params: Value,
}

/// A parsed, correlated RPC request
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Numeric suffix of the request topic
    pub request_id: String,
    /// Method name used to resolve the handler
    pub method: String,
    /// Opaque parameters, `null` when absent
    pub params: Value,
}

impl RpcRequest {
    /// Parse an inbound message into a request (pure function)
    pub fn parse(topic: &str, payload: &[u8]) -> Result<Self, MalformedRequestError> {
        let request_id = extract_request_id(topic)?.to_string();

        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| MalformedRequestError::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(MalformedRequestError::NotAnObject);
        }

        let body: RequestBody = serde_json::from_value(value)
            .map_err(|e| MalformedRequestError::InvalidJson(e.to_string()))?;

        let method = match body.method {
            Some(Value::String(method)) if !method.is_empty() => method,
            _ => return Err(MalformedRequestError::MissingMethod),
        };

        Ok(Self {
            request_id,
            method,
            params: body.params,
        })
    }

    /// Topic the response to this request must be published to
    pub fn response_topic(&self) -> String {
        rpc_response_topic(&self.request_id)
    }
}

/// Outcome reported back to the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcStatus {
    Success,
    Error,
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcStatus::Success => write!(f, "success"),
            RpcStatus::Error => write!(f, "error"),
        }
    }
}

/// Response correlated to a request id
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub request_id: String,
    pub status: RpcStatus,
    /// Handler result for successes, `{"code", "message"}` for errors
    pub result: Value,
}

impl RpcResponse {
    pub fn success(request_id: impl Into<String>, result: Value) -> Self {
        Self {
            request_id: request_id.into(),
            status: RpcStatus::Success,
            result,
        }
    }

    pub fn failure(request_id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: RpcStatus::Error,
            result: json!({ "code": code, "message": message.into() }),
        }
    }

    pub fn topic(&self) -> String {
        rpc_response_topic(&self.request_id)
    }

    /// JSON body published on the response topic
    pub fn to_payload(&self) -> Value {
        match self.status {
            RpcStatus::Success => json!({ "status": "success", "result": self.result }),
            RpcStatus::Error => json!({ "status": "error", "error": self.result }),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.to_payload())
    }
}
