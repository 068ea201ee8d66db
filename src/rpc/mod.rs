//! Server-side RPC: handler interface, registry and dispatcher
//!
//! The platform sends requests on `v1/devices/me/rpc/request/{id}`; every
//! valid request is answered exactly once on `v1/devices/me/rpc/response/{id}`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub mod builtin;
pub mod dispatcher;
pub mod registry;

pub use builtin::{
    register_builtin_handlers, GetValueHandler, SetValueHandler, ValueStore, GET_VALUE_METHOD,
    SET_VALUE_METHOD,
};
pub use dispatcher::{RpcDispatcher, RpcEvent};
pub use registry::HandlerRegistry;

/// Handler for one RPC method
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Run the method with the request's `params` (`null` when absent)
    async fn handle(&self, params: Value) -> Result<Value, HandlerError>;
}

/// Failure reported by a handler, sent back as a `handler_error` response
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Adapter turning a plain closure into an [`RpcHandler`]
pub struct FnHandler<F> {
    func: F,
}

#[async_trait]
impl<F> RpcHandler for FnHandler<F>
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync,
{
    async fn handle(&self, params: Value) -> Result<Value, HandlerError> {
        (self.func)(params)
    }
}

/// Wrap a synchronous closure as a handler
pub fn handler_fn<F>(func: F) -> FnHandler<F>
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync,
{
    FnHandler { func }
}

/// Why an RPC request produced an error response
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("method '{0}' is not registered")]
    MethodNotFound(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("handler panicked")]
    Panicked,
    #[error("handler did not complete within {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl RpcError {
    /// Error code placed in the response body
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::MethodNotFound(_) => "method_not_found",
            RpcError::Handler(_) | RpcError::Panicked => "handler_error",
            RpcError::Timeout(_) => "handler_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler() {
        let handler = handler_fn(|params| Ok(json!({ "echo": params })));
        assert_eq!(
            handler.handle(json!(42)).await.unwrap(),
            json!({ "echo": 42 })
        );

        let failing = handler_fn(|_| Err(HandlerError::new("bad params")));
        assert_eq!(
            failing.handle(Value::Null).await.unwrap_err().message(),
            "bad params"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RpcError::MethodNotFound("x".to_string()).code(),
            "method_not_found"
        );
        assert_eq!(RpcError::Handler("x".to_string()).code(), "handler_error");
        assert_eq!(RpcError::Panicked.code(), "handler_error");
        assert_eq!(
            RpcError::Timeout(Duration::from_secs(5)).code(),
            "handler_timeout"
        );
        assert_eq!(
            RpcError::Timeout(Duration::from_secs(5)).to_string(),
            "handler did not complete within 5000ms"
        );
    }
}
