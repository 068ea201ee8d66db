//! tbagent - device-side MQTT telemetry and RPC agent
//!
//! Connects a device to a ThingsBoard-style IoT platform over MQTT using the
//! device access token, publishes telemetry samples with delivery tracking and
//! answers server-side RPC requests through registered handlers.
//!
//! # Overview
//!
//! - [`session`] - supervised connection with exponential backoff and
//!   automatic re-subscription
//! - [`telemetry`] - sample validation, publishing and delivery tickets
//! - [`rpc`] - handler registry and request dispatch
//! - [`agent`] - the [`Agent`] composition root
//!
//! # Quick Start
//!
//! ```no_run
//! use serde_json::{json, Map};
//! use std::path::Path;
//! use tbagent::rpc::handler_fn;
//! use tbagent::{Agent, AgentConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentConfig::load_from_file(Path::new("tbagent.toml"))?;
//! let mut agent = Agent::new(config);
//! agent.register_rpc_handler("setValue", handler_fn(|params| Ok(json!({ "value": params }))));
//! agent.start().await?;
//!
//! let mut fields = Map::new();
//! fields.insert("temperature".to_string(), json!(25.1));
//! let ticket = agent.submit_telemetry(agent.with_defaults(fields))?;
//! println!("delivery: {:?}", ticket.wait().await);
//!
//! agent.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod telemetry;
pub mod testing;
pub mod transport;

pub use agent::Agent;
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult};
pub use rpc::{HandlerError, HandlerRegistry, RpcEvent, RpcHandler};
pub use session::{ConnectionState, SessionEvent};
pub use telemetry::{DeliveryState, PublishTicket, ValidationError};
