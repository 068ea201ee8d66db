//! Agent lifecycle: wires the session, publisher and dispatcher together
//!
//! `start` spawns the connection supervisor (which keeps retrying in the
//! background), records the RPC request subscription, and launches the
//! dispatcher and, if enabled, the health server. `stop` tears all of that
//! down again and may be called any number of times.

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::observability::HealthServer;
use crate::protocol::{RPC_REQUEST_FILTER, TELEMETRY_TOPIC};
use crate::rpc::{HandlerRegistry, RpcDispatcher, RpcEvent, RpcHandler};
use crate::session::{ConnectionState, ConnectionSupervisor, SessionEvent};
use crate::telemetry::{PublishTicket, TelemetryPublisher, TelemetrySample, ValidationError};
use crate::transport::mqtt::MqttConnector;
use crate::transport::{Connector, PublishError, QoS};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time background tasks get to finish after shutdown is signalled
const TASK_GRACE: Duration = Duration::from_secs(2);

const RPC_EVENT_CAPACITY: usize = 64;

/// Device agent: telemetry out, RPC in, over one supervised MQTT session
pub struct Agent {
    config: AgentConfig,
    registry: Arc<HandlerRegistry>,
    rpc_events: broadcast::Sender<RpcEvent>,
    running: Option<Running>,
}

/// Everything that only exists between `start` and `stop`
struct Running {
    supervisor: ConnectionSupervisor,
    publisher: TelemetryPublisher,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: JoinHandle<()>,
    health: Option<JoinHandle<()>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let (rpc_events, _) = broadcast::channel(RPC_EVENT_CAPACITY);
        Self {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            rpc_events,
            running: None,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Handler registry shared with the dispatcher
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start against the configured MQTT broker
    pub async fn start(&mut self) -> AgentResult<()> {
        self.start_with_connector(Arc::new(MqttConnector::new()))
            .await
    }

    /// Start with an injected transport.
    ///
    /// Returns once the background tasks are running; the broker connection
    /// itself is established (and re-established) asynchronously.
    pub async fn start_with_connector(&mut self, connector: Arc<dyn Connector>) -> AgentResult<()> {
        if self.running.is_some() {
            return Err(AgentError::AlreadyStarted);
        }

        let options = self.config.session_options()?;
        let client_id = options.client_id.clone();
        info!(%client_id, host = %options.host, port = options.port, "Starting agent");

        let mut supervisor =
            ConnectionSupervisor::spawn(connector, options, self.config.reconnect_config());

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.rpc.queue_capacity);
        if let Err(error) = supervisor
            .subscribe(RPC_REQUEST_FILTER, QoS::AtLeastOnce, inbound_tx)
            .await
        {
            supervisor.disconnect().await;
            return Err(error.into());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = RpcDispatcher::new(
            Arc::clone(&self.registry),
            supervisor.handle(),
            self.rpc_events.clone(),
            self.config.handler_timeout(),
        )
        .spawn(inbound_rx, shutdown_rx.clone());

        let health = if self.config.health.enabled {
            let server = HealthServer::new(
                client_id,
                self.config.health.port,
                supervisor.state_changes(),
            );
            match server.spawn(shutdown_rx) {
                Ok((_, task)) => Some(task),
                Err(e) => {
                    shutdown_tx.send_replace(true);
                    join_with_grace("rpc dispatcher", dispatcher).await;
                    supervisor.disconnect().await;
                    return Err(AgentError::internal_error(format!(
                        "health server failed to bind port {}: {e}",
                        self.config.health.port
                    )));
                }
            }
        } else {
            None
        };

        let publisher = TelemetryPublisher::new(supervisor.handle(), self.config.publisher_settings());
        self.running = Some(Running {
            supervisor,
            publisher,
            shutdown_tx,
            dispatcher,
            health,
        });
        info!("Agent started");
        Ok(())
    }

    /// Stop all background work and disconnect. Idempotent.
    ///
    /// Pending handler invocations are cancelled without a response.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Agent already stopped");
            return;
        };
        let Running {
            mut supervisor,
            shutdown_tx,
            dispatcher,
            health,
            ..
        } = running;

        info!("Stopping agent");
        shutdown_tx.send_replace(true);
        join_with_grace("rpc dispatcher", dispatcher).await;
        if let Some(health) = health {
            join_with_grace("health server", health).await;
        }
        supervisor.disconnect().await;
        info!("Agent stopped");
    }

    /// Submit one telemetry sample exactly as given.
    ///
    /// Validation errors (including a missing required field) are returned
    /// directly and nothing is published; delivery failures (including a
    /// stopped agent) are reported through the ticket. Use
    /// [`Agent::with_defaults`] to fill in the configured default readings.
    pub fn submit_telemetry(
        &self,
        fields: Map<String, Value>,
    ) -> Result<PublishTicket, ValidationError> {
        let sample = TelemetrySample::from_values(&fields)?;
        let qos = self.config.telemetry_qos();

        match &self.running {
            Some(running) => running.publisher.submit(&sample, qos),
            None => {
                sample.validate_required(&self.config.telemetry.required_fields)?;
                warn!("Telemetry submitted while the agent is stopped");
                Ok(PublishTicket::failed(
                    TELEMETRY_TOPIC,
                    qos,
                    PublishError::NotConnected,
                ))
            }
        }
    }

    /// `fields` merged over the configured `telemetry.defaults`
    pub fn with_defaults(&self, fields: Map<String, Value>) -> Map<String, Value> {
        merge_fields(&self.config.telemetry.defaults, fields)
    }

    /// Stream of RPC activity. Receivers only see events sent after they
    /// subscribed.
    pub fn on_rpc_received(&self) -> broadcast::Receiver<RpcEvent> {
        self.rpc_events.subscribe()
    }

    /// Register `handler` for `method`; true when it replaced an earlier one
    pub fn register_rpc_handler(
        &self,
        method: impl Into<String>,
        handler: impl RpcHandler + 'static,
    ) -> bool {
        self.registry.register(method, Arc::new(handler))
    }

    pub fn unregister_rpc_handler(&self, method: &str) -> bool {
        self.registry.unregister(method)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.running
            .as_ref()
            .map_or(ConnectionState::Disconnected, |r| r.supervisor.state())
    }

    /// Session lifecycle events; `None` while stopped
    pub fn session_events(&self) -> Option<broadcast::Receiver<SessionEvent>> {
        self.running.as_ref().map(|r| r.supervisor.events())
    }

    /// Wait for the session to be connected; false on timeout or when stopped
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        match &self.running {
            Some(running) => running.supervisor.wait_connected(timeout).await,
            None => false,
        }
    }
}

/// Defaults first, caller values override in place, new names appended
pub fn merge_fields(defaults: &Map<String, Value>, fields: Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (name, value) in fields {
        merged.insert(name, value);
    }
    merged
}

async fn join_with_grace(name: &str, mut task: JoinHandle<()>) {
    match tokio::time::timeout(TASK_GRACE, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => error!(task = name, "Task ended abnormally: {}", e),
        Err(_) => {
            warn!(task = name, "Task did not stop within {:?}, aborting", TASK_GRACE);
            task.abort();
        }
    }
}
