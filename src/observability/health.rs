//! Health check HTTP server
//!
//! Serves the agent's connection state and counters for operators and
//! process supervisors. Disabled unless `[health] enabled = true`.

use crate::observability::metrics::{metrics, RpcMetrics, TelemetryMetrics};
use crate::session::ConnectionState;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    client_id: String,
    port: u16,
    state: watch::Receiver<ConnectionState>,
}

impl HealthServer {
    pub fn new(
        client_id: impl Into<String>,
        port: u16,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            port,
            state,
        }
    }

    /// `/health`, `/ready`, `/live` and `/metrics`
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let state = self.state.clone();
        let client_id = self.client_id.clone();
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let report = health_report(&client_id, *state.borrow());
                let code = if report.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&report), code)
            });

        let state = self.state.clone();
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = *state.borrow() == ConnectionState::Connected;
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(
                    warp::reply::json(&ReadinessResponse {
                        ready,
                        timestamp: current_timestamp(),
                    }),
                    code,
                )
            });

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        health_route
            .or(ready_route)
            .or(live_route)
            .or(metrics_route)
    }

    /// Bind and serve until `shutdown` flips to true.
    ///
    /// Returns the bound address (port 0 picks a free one) and the server task.
    pub fn spawn(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(SocketAddr, JoinHandle<()>), warp::Error> {
        let routes = self.routes();
        let (addr, server) = warp::serve(routes).try_bind_with_graceful_shutdown(
            ([0, 0, 0, 0], self.port),
            async move {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            },
        )?;

        tracing::info!(%addr, "Health server listening");
        Ok((addr, tokio::spawn(server)))
    }
}

/// Body of `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub client_id: String,
    pub connection: String,
    pub uptime_seconds: u64,
    pub telemetry: TelemetryMetrics,
    pub rpc: RpcMetrics,
    pub timestamp: u64,
}

pub fn health_report(client_id: &str, state: ConnectionState) -> HealthReport {
    let snapshot = metrics().get_metrics();
    HealthReport {
        status: if state == ConnectionState::Connected {
            "healthy"
        } else {
            "unhealthy"
        },
        client_id: client_id.to_string(),
        connection: state.to_string(),
        uptime_seconds: snapshot.uptime_seconds,
        telemetry: snapshot.telemetry,
        rpc: snapshot.rpc,
        timestamp: snapshot.timestamp,
    }
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
