//! Test helpers and utilities for integration tests

use std::time::Duration;
use tbagent::config::AgentConfig;
use tbagent::protocol::RPC_REQUEST_FILTER;
use tbagent::session::{ReconnectConfig, SessionEvent};
use tbagent::testing::MockBroker;
use tbagent::Agent;
use tokio::sync::broadcast;

/// Upper bound for anything a test waits on
#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(2);

#[allow(dead_code)]
pub const TEST_TOKEN: &str = "A1_TEST_TOKEN";

/// Agent configuration with fast reconnects and short handler timeouts
#[allow(dead_code)]
pub fn test_config() -> AgentConfig {
    AgentConfig::from_toml_str(&format!(
        r#"
[device]
broker_url = "mqtt://localhost:1883"
access_token = "{TEST_TOKEN}"
client_id = "panel-test"

[telemetry]
ack_timeout_secs = 2

[rpc]
handler_timeout_ms = 200

[reconnect]
base_delay_ms = 10
max_delay_ms = 50
jitter = false
"#
    ))
    .expect("test config should be valid")
}

#[allow(dead_code)]
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        jitter: false,
    }
}

/// Start an agent against `broker` and wait until the RPC filter is live
#[allow(dead_code)]
pub async fn started_agent(broker: &MockBroker) -> Agent {
    let mut agent = Agent::new(test_config());
    agent
        .start_with_connector(broker.connector())
        .await
        .expect("agent should start");
    assert!(agent.wait_connected(WAIT).await, "agent did not connect");
    assert!(
        broker.wait_for_subscription(RPC_REQUEST_FILTER, 1, WAIT).await,
        "RPC filter was not subscribed"
    );
    agent
}

/// Collect session events until `done` matches one (inclusive) or `WAIT` passes
#[allow(dead_code)]
pub async fn collect_events_until(
    events: &mut broadcast::Receiver<SessionEvent>,
    done: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(WAIT, async {
        while let Ok(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    seen
}
