//! Inbound RPC dispatch
//!
//! Each request runs on its own task inside a `JoinSet`. The handler itself
//! runs on a further task so a panic or a timeout can be turned into an error
//! response instead of taking the dispatcher down.

use super::registry::HandlerRegistry;
use super::RpcError;
use crate::error::sanitize_error_message;
use crate::observability::metrics::metrics;
use crate::protocol::{RpcRequest, RpcResponse, RpcStatus};
use crate::session::SessionHandle;
use crate::transport::{InboundMessage, PublishError, QoS};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

/// How long a response publish may wait for its PubAck
const RESPONSE_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// RPC activity for UI and status listeners
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    /// A well-formed request arrived
    Received {
        request_id: String,
        method: String,
        params: Value,
    },
    /// The response was handed to the session
    Completed {
        request_id: String,
        method: String,
        status: RpcStatus,
        result: Value,
        delivery: Result<(), PublishError>,
    },
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Clone)]
pub struct RpcDispatcher {
    registry: Arc<HandlerRegistry>,
    session: SessionHandle,
    events: broadcast::Sender<RpcEvent>,
    handler_timeout: Duration,
}

impl RpcDispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        session: SessionHandle,
        events: broadcast::Sender<RpcEvent>,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            session,
            events,
            handler_timeout,
        }
    }

    /// Parse and answer one message without publishing the response.
    ///
    /// Returns `None` for messages that are dropped (bad topic or payload).
    pub async fn handle_message(&self, message: &InboundMessage) -> Option<RpcResponse> {
        self.dispatch(message).await.map(|(_, response)| response)
    }

    async fn dispatch(&self, message: &InboundMessage) -> Option<(RpcRequest, RpcResponse)> {
        let request = match RpcRequest::parse(&message.topic, &message.payload) {
            Ok(request) => request,
            Err(error) => {
                metrics().rpc_dropped();
                warn!(topic = %message.topic, "Dropping RPC message: {}", error);
                return None;
            }
        };

        metrics().rpc_received();
        info!(
            request_id = %request.request_id,
            method = %request.method,
            "RPC request received"
        );
        let _ = self.events.send(RpcEvent::Received {
            request_id: request.request_id.clone(),
            method: request.method.clone(),
            params: request.params.clone(),
        });

        let response = match self.invoke(&request).await {
            Ok(result) => RpcResponse::success(&request.request_id, result),
            Err(error) => {
                warn!(
                    request_id = %request.request_id,
                    method = %request.method,
                    code = error.code(),
                    "RPC request failed: {}",
                    error
                );
                RpcResponse::failure(
                    &request.request_id,
                    error.code(),
                    sanitize_error_message(&error.to_string()),
                )
            }
        };
        Some((request, response))
    }

    /// Resolve and run the handler, bounded by the handler timeout
    async fn invoke(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        let handler = self.registry.resolve(&request.method)?;
        let params = request.params.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(params).await }));

        match tokio::time::timeout(self.handler_timeout, &mut task.0).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(RpcError::Handler(error.to_string())),
            Ok(Err(join_error)) if join_error.is_panic() => Err(RpcError::Panicked),
            Ok(Err(join_error)) => Err(RpcError::Handler(join_error.to_string())),
            Err(_) => Err(RpcError::Timeout(self.handler_timeout)),
        }
    }

    /// Handle one message end to end: dispatch, publish, report
    pub async fn process(&self, message: InboundMessage) {
        let started = Instant::now();
        let Some((request, response)) = self.dispatch(&message).await else {
            return;
        };

        let delivery = self.publish_response(&response).await;
        match (&delivery, response.status) {
            (Ok(()), RpcStatus::Success) => metrics().rpc_succeeded(started.elapsed()),
            (Ok(()), RpcStatus::Error) => metrics().rpc_failed(started.elapsed()),
            (Err(error), _) => {
                metrics().rpc_failed(started.elapsed());
                error!(
                    request_id = %response.request_id,
                    "RPC response not delivered: {}",
                    error
                );
            }
        }
        debug!(
            request_id = %response.request_id,
            status = %response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "RPC request completed"
        );

        let _ = self.events.send(RpcEvent::Completed {
            request_id: response.request_id,
            method: request.method,
            status: response.status,
            result: response.result,
            delivery,
        });
    }

    async fn publish_response(&self, response: &RpcResponse) -> Result<(), PublishError> {
        let payload = response
            .to_bytes()
            .map_err(|e| PublishError::Rejected(e.to_string()))?;
        let receipt = self
            .session
            .publish(response.topic(), payload, QoS::AtLeastOnce);

        match tokio::time::timeout(RESPONSE_ACK_TIMEOUT, receipt.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::AckTimeout(RESPONSE_ACK_TIMEOUT)),
        }
    }

    /// Consume `inbound` until it closes or `shutdown` flips to true.
    ///
    /// In-flight requests are cancelled on shutdown.
    pub fn spawn(
        self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_signal(&mut shutdown) => break,
                    message = inbound.recv() => match message {
                        Some(message) => {
                            let dispatcher = self.clone();
                            let span = crate::rpc_span!(topic = %message.topic);
                            tasks.spawn(async move { dispatcher.process(message).await }.instrument(span));
                        }
                        None => break,
                    },
                    Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(join_error) = finished {
                            if join_error.is_panic() {
                                error!("RPC task panicked: {}", join_error);
                            }
                        }
                    }
                }
            }

            if !tasks.is_empty() {
                debug!(pending = tasks.len(), "Cancelling in-flight RPC requests");
            }
            tasks.shutdown().await;
            debug!("RPC dispatcher stopped");
        })
    }
}

async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{handler_fn, HandlerError, RpcHandler};
    use crate::session::{ConnectionSupervisor, ReconnectConfig};
    use crate::testing::mocks::MockBroker;
    use crate::transport::SessionOptions;
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowHandler;

    #[async_trait]
    impl RpcHandler for SlowHandler {
        async fn handle(&self, _params: Value) -> Result<Value, HandlerError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl RpcHandler for PanickingHandler {
        async fn handle(&self, _params: Value) -> Result<Value, HandlerError> {
            panic!("boom")
        }
    }

    async fn dispatcher(
        broker: &MockBroker,
        registry: Arc<HandlerRegistry>,
    ) -> (ConnectionSupervisor, RpcDispatcher) {
        let supervisor = ConnectionSupervisor::connect(
            broker.connector(),
            SessionOptions::new("localhost", 1883),
            ReconnectConfig::default(),
        )
        .await
        .unwrap();
        let (events, _) = broadcast::channel(16);
        let dispatcher = RpcDispatcher::new(
            registry,
            supervisor.handle(),
            events,
            Duration::from_millis(100),
        );
        (supervisor, dispatcher)
    }

    #[tokio::test]
    async fn test_success_response() {
        let broker = MockBroker::new();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("setValue", Arc::new(handler_fn(|_| Ok(json!({ "ok": true })))));
        let (mut supervisor, dispatcher) = dispatcher(&broker, registry).await;

        let message = InboundMessage::new(
            "v1/devices/me/rpc/request/7",
            r#"{"method":"setValue","params":42}"#,
        );
        let response = dispatcher.handle_message(&message).await.unwrap();

        assert_eq!(response.request_id, "7");
        assert_eq!(response.status, RpcStatus::Success);
        assert_eq!(response.result, json!({ "ok": true }));
        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn test_unknown_method_and_malformed_payloads() {
        let broker = MockBroker::new();
        let (mut supervisor, dispatcher) =
            dispatcher(&broker, Arc::new(HandlerRegistry::new())).await;

        let unknown = InboundMessage::new("v1/devices/me/rpc/request/1", r#"{"method":"reboot"}"#);
        let response = dispatcher.handle_message(&unknown).await.unwrap();
        assert_eq!(response.status, RpcStatus::Error);
        assert_eq!(response.result["code"], "method_not_found");

        let not_json = InboundMessage::new("v1/devices/me/rpc/request/2", "not json");
        assert!(dispatcher.handle_message(&not_json).await.is_none());

        let no_method = InboundMessage::new("v1/devices/me/rpc/request/3", r#"{"params":1}"#);
        assert!(dispatcher.handle_message(&no_method).await.is_none());

        let bad_topic = InboundMessage::new("v1/devices/me/rpc/request/abc", r#"{"method":"x"}"#);
        assert!(dispatcher.handle_message(&bad_topic).await.is_none());

        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn test_timeout_and_panic_become_error_responses() {
        let broker = MockBroker::new();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("slow", Arc::new(SlowHandler));
        registry.register("explode", Arc::new(PanickingHandler));
        let (mut supervisor, dispatcher) = dispatcher(&broker, registry).await;

        let slow = InboundMessage::new("v1/devices/me/rpc/request/10", r#"{"method":"slow"}"#);
        let response = dispatcher.handle_message(&slow).await.unwrap();
        assert_eq!(response.result["code"], "handler_timeout");

        let explode = InboundMessage::new("v1/devices/me/rpc/request/11", r#"{"method":"explode"}"#);
        let response = dispatcher.handle_message(&explode).await.unwrap();
        assert_eq!(response.result["code"], "handler_error");

        supervisor.disconnect().await;
    }

    #[tokio::test]
    async fn test_handler_error_message_is_sanitized() {
        let broker = MockBroker::new();
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "login",
            Arc::new(handler_fn(|_| Err(HandlerError::new("rejected token=abc123")))),
        );
        let (mut supervisor, dispatcher) = dispatcher(&broker, registry).await;

        let message = InboundMessage::new("v1/devices/me/rpc/request/5", r#"{"method":"login"}"#);
        let response = dispatcher.handle_message(&message).await.unwrap();
        let text = response.result["message"].as_str().unwrap();
        assert!(!text.contains("abc123"));
        assert!(text.contains("token=***"));

        supervisor.disconnect().await;
    }
}
