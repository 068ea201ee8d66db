//! Agent lifecycle tests
//!
//! Startup wiring, stop/restart, and recovery from a dropped connection with
//! the RPC subscription re-applied.

mod test_helpers;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tbagent::config::{AgentConfig, ConfigError};
use tbagent::protocol::RPC_REQUEST_FILTER;
use tbagent::rpc::{handler_fn, HandlerError, RpcHandler};
use tbagent::session::SessionEvent;
use tbagent::testing::MockBroker;
use tbagent::transport::PublishError;
use tbagent::{Agent, AgentError, ConnectionState, DeliveryState, RpcEvent};
use test_helpers::{collect_events_until, started_agent, test_config, TEST_TOKEN, WAIT};

#[tokio::test]
async fn test_start_uses_configured_identity() {
    let broker = MockBroker::new();
    let mut agent = started_agent(&broker).await;

    let options = broker.last_options().await.unwrap();
    assert_eq!(options.client_id, "panel-test");
    assert_eq!(options.credentials.unwrap().username, TEST_TOKEN);
    assert_eq!(options.keep_alive, Duration::from_secs(60));
    assert_eq!(agent.connection_state(), ConnectionState::Connected);

    agent.stop().await;
}

#[tokio::test]
async fn test_rpc_survives_reconnect() {
    let broker = MockBroker::new();
    let mut agent = started_agent(&broker).await;
    agent.register_rpc_handler("setValue", handler_fn(|_| Ok(json!({ "ok": true }))));
    let mut events = agent.session_events().unwrap();

    assert!(broker.drop_connection().await);
    let seen = collect_events_until(&mut events, |e| *e == SessionEvent::Connected).await;
    assert!(matches!(seen.first(), Some(SessionEvent::ConnectionLost { .. })));
    assert!(seen.contains(&SessionEvent::Subscribed {
        filter: RPC_REQUEST_FILTER.to_string()
    }));
    assert!(broker.wait_for_subscription(RPC_REQUEST_FILTER, 2, WAIT).await);

    broker
        .inject("v1/devices/me/rpc/request/77", r#"{"method":"setValue","params":1}"#)
        .await;
    let responses = broker
        .wait_for_published("v1/devices/me/rpc/response/77", 1, WAIT)
        .await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].connection, 2);
    assert_eq!(
        responses[0].json().unwrap(),
        json!({ "status": "success", "result": { "ok": true } })
    );

    agent.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_disconnects() {
    let broker = MockBroker::new();
    let mut agent = started_agent(&broker).await;

    agent.stop().await;
    agent.stop().await;

    assert!(!agent.is_running());
    assert!(!broker.is_connected().await);
    assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
    assert!(agent.session_events().is_none());

    let ticket = agent.submit_telemetry(agent.with_defaults(Map::new())).unwrap();
    assert_eq!(
        ticket.state(),
        DeliveryState::Failed(PublishError::NotConnected)
    );
}

#[tokio::test]
async fn test_restart_after_stop() {
    let broker = MockBroker::new();
    let mut agent = started_agent(&broker).await;
    agent.stop().await;

    agent.start_with_connector(broker.connector()).await.unwrap();
    assert!(agent.wait_connected(WAIT).await);
    assert!(broker.wait_for_subscription(RPC_REQUEST_FILTER, 2, WAIT).await);

    let ticket = agent.submit_telemetry(agent.with_defaults(Map::new())).unwrap();
    assert_eq!(ticket.wait().await, DeliveryState::Acknowledged);

    agent.stop().await;
}

#[tokio::test]
async fn test_start_keeps_retrying_when_broker_is_down() {
    let broker = MockBroker::new();
    broker.fail_next_connects(3).await;

    let mut agent = Agent::new(test_config());
    agent.start_with_connector(broker.connector()).await.unwrap();

    assert!(agent.wait_connected(WAIT).await);
    assert_eq!(broker.connect_attempts().await, 4);
    assert!(broker.wait_for_subscription(RPC_REQUEST_FILTER, 1, WAIT).await);

    agent.stop().await;
}

#[tokio::test]
async fn test_missing_token_variable_fails_start() {
    let config = AgentConfig::from_toml_str(
        r#"
[device]
broker_url = "mqtt://localhost"
access_token_env = "TBAGENT_LIFECYCLE_TEST_UNSET_TOKEN"
"#,
    )
    .unwrap();
    let broker = MockBroker::new();
    let mut agent = Agent::new(config);

    let result = agent.start_with_connector(broker.connector()).await;
    assert!(matches!(
        result,
        Err(AgentError::Config(ConfigError::EnvVarNotFound(_)))
    ));
    assert!(!agent.is_running());
    assert_eq!(broker.connect_attempts().await, 0);
}

#[tokio::test]
async fn test_health_server_starts_and_stops_with_agent() {
    let mut config = test_config();
    config.health.enabled = true;
    config.health.port = 0;

    let broker = MockBroker::new();
    let mut agent = Agent::new(config);
    agent.start_with_connector(broker.connector()).await.unwrap();
    assert!(agent.wait_connected(WAIT).await);

    tokio::time::timeout(WAIT, agent.stop())
        .await
        .expect("stop should join the health server");
}

/// Sleeps, then records that it ran to completion
struct Calibrate {
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl RpcHandler for Calibrate {
    async fn handle(&self, _params: Value) -> Result<Value, HandlerError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(json!("calibrated"))
    }
}

#[tokio::test]
async fn test_stop_cancels_pending_handler() {
    let mut config = test_config();
    config.rpc.handler_timeout_ms = 10_000;
    let broker = MockBroker::new();
    let mut agent = Agent::new(config);
    agent.start_with_connector(broker.connector()).await.unwrap();
    assert!(agent.wait_connected(WAIT).await);
    assert!(broker.wait_for_subscription(RPC_REQUEST_FILTER, 1, WAIT).await);

    let finished = Arc::new(AtomicBool::new(false));
    agent.register_rpc_handler(
        "calibrate",
        Calibrate {
            finished: Arc::clone(&finished),
        },
    );
    let mut events = agent.on_rpc_received();
    broker
        .inject("v1/devices/me/rpc/request/31", r#"{"method":"calibrate"}"#)
        .await;
    let received = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(received, RpcEvent::Received { .. }));

    tokio::time::timeout(Duration::from_millis(250), agent.stop())
        .await
        .expect("stop should not wait for the handler");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!finished.load(Ordering::SeqCst));
    assert!(broker
        .published_on("v1/devices/me/rpc/response/31")
        .await
        .is_empty());
}

#[tokio::test]
async fn test_stop_cancels_unanswered_connect() {
    let broker = MockBroker::new();
    broker.set_hang_connects(true).await;
    let mut agent = Agent::new(test_config());
    agent.start_with_connector(broker.connector()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(agent.connection_state(), ConnectionState::Connecting);

    tokio::time::timeout(Duration::from_secs(1), agent.stop())
        .await
        .expect("stop should cancel the connect attempt");
    assert!(!agent.is_running());
    assert_eq!(broker.connections().await, 0);
}
