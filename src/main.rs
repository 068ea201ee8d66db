//! tbagent - device telemetry and RPC agent, command line entry point

use serde_json::Map;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tbagent::config::AgentConfig;
use tbagent::observability::init_default_logging;
use tbagent::rpc::{register_builtin_handlers, ValueStore, SET_VALUE_METHOD};
use tbagent::telemetry::parse_field_assignments;
use tbagent::transport::QoS;
use tbagent::{Agent, DeliveryState, PublishTicket, RpcEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Device-side MQTT telemetry and RPC agent
#[derive(clap::Parser)]
#[command(name = "tbagent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TBAGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run {
        /// Publish the default field set every SECS seconds
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
        /// Stop when stdin reaches end of file
        #[arg(long)]
        exit_on_eof: bool,
    },
    /// Publish one telemetry sample and wait for its acknowledgement
    Send {
        /// Field override, e.g. --field temperature=25.3
        #[arg(long = "field", value_name = "NAME=VALUE")]
        fields: Vec<String>,
        /// QoS level for this sample
        #[arg(long)]
        qos: Option<u8>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = <Cli as clap::Parser>::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            interval,
            exit_on_eof,
        } => run_agent(config, interval.map(Duration::from_secs), exit_on_eof).await,
        Commands::Send { fields, qos } => send_sample(config, &fields, qos).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&PathBuf>) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let path = match path {
        Some(path) => path.clone(),
        None => AgentConfig::find_default_file()?,
    };
    info!("Loading configuration from: {}", path.display());
    Ok(AgentConfig::load_from_file(&path)?)
}

async fn run_agent(
    config: AgentConfig,
    interval: Option<Duration>,
    exit_on_eof: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut agent = Agent::new(config);
    let store = ValueStore::new();
    register_builtin_handlers(&agent.registry(), &store);

    let events = tokio::spawn(log_rpc_events(agent.on_rpc_received()));
    agent.start().await?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let mut ticker = interval.map(tokio::time::interval);
    let mut stdin = Some(BufReader::new(tokio::io::stdin()).lines());

    info!("Agent running; reading telemetry from stdin");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            _ = tick(&mut ticker) => {
                submit(&agent, agent.with_defaults(Map::new()));
            }
            line = next_line(&mut stdin) => match line {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_field_assignments(&line) {
                    Ok(fields) => submit(&agent, agent.with_defaults(fields)),
                    Err(e) => warn!("Ignoring input line: {}", e),
                },
                None => {
                    stdin = None;
                    if exit_on_eof {
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            },
        }
    }

    agent.stop().await;
    events.abort();
    Ok(())
}

async fn send_sample(
    mut config: AgentConfig,
    fields: &[String],
    qos: Option<u8>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(qos) = qos {
        QoS::try_from(qos)?;
        config.telemetry.qos = qos;
    }

    let mut values = Map::new();
    for field in fields {
        values.extend(parse_field_assignments(field)?);
    }

    let connect_timeout = Duration::from_secs(config.device.connect_timeout_secs);
    let mut agent = Agent::new(config);
    agent.start().await?;

    if !agent.wait_connected(connect_timeout).await {
        agent.stop().await;
        return Err(format!("not connected within {connect_timeout:?}").into());
    }

    let outcome = match agent.submit_telemetry(agent.with_defaults(values)) {
        Ok(ticket) => Ok(ticket.wait().await),
        Err(e) => Err(e),
    };
    agent.stop().await;

    match outcome? {
        DeliveryState::Acknowledged => {
            info!("Telemetry acknowledged");
            Ok(())
        }
        state => Err(format!("telemetry not delivered: {state:?}").into()),
    }
}

fn handle_config_command(config: &AgentConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }
    info!("Configuration validation complete");
    Ok(())
}

/// Submit and log the outcome in the background
fn submit(agent: &Agent, fields: Map<String, serde_json::Value>) {
    match agent.submit_telemetry(fields) {
        Ok(ticket) => {
            tokio::spawn(report_delivery(ticket));
        }
        Err(e) => warn!("Telemetry rejected: {}", e),
    }
}

async fn report_delivery(ticket: PublishTicket) {
    match ticket.wait().await {
        DeliveryState::Acknowledged => info!(ticket_id = %ticket.id(), "Telemetry acknowledged"),
        state => warn!(ticket_id = %ticket.id(), "Telemetry not delivered: {:?}", state),
    }
}

async fn log_rpc_events(mut events: broadcast::Receiver<RpcEvent>) {
    loop {
        match events.recv().await {
            Ok(RpcEvent::Received {
                request_id,
                method,
                params,
            }) => {
                if method == SET_VALUE_METHOD {
                    info!(%request_id, "VALUE SET: {}", params);
                } else {
                    info!(%request_id, %method, %params, "RPC request");
                }
            }
            Ok(RpcEvent::Completed {
                request_id,
                status,
                delivery,
                ..
            }) => match delivery {
                Ok(()) => info!(%request_id, %status, "RPC response sent"),
                Err(e) => warn!(%request_id, %status, "RPC response not delivered: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "RPC event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_line(
    stdin: &mut Option<tokio::io::Lines<BufReader<tokio::io::Stdin>>>,
) -> Option<String> {
    match stdin {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                None
            }
        },
        None => std::future::pending().await,
    }
}
