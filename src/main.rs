use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::Level;

use veil_bus::EventBus;
use veil_core::events::{topic, NodeEvent, NodeStatus};
use veil_server::{BroadcastHub, ServerConfig, DEFAULT_SUBSCRIBER_QUEUE};
use veil_state::Keeper;
use veil_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "veil", about = "Veil node daemon")]
struct Args {
    /// Port for the local control API.
    #[arg(long, default_value_t = 4050)]
    port: u16,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// State announcement debounce window in milliseconds.
    #[arg(long, default_value_t = 200)]
    debounce_ms: u64,

    /// Emit JSON-formatted log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    veil_telemetry::init_telemetry(&TelemetryConfig {
        log_level: args.log_level,
        json_output: args.json_logs,
        ..Default::default()
    });

    tracing::info!("starting veil node");

    let bus = EventBus::new();

    let keeper = Keeper::new(Arc::clone(&bus), Duration::from_millis(args.debounce_ms));
    keeper.subscribe();

    let hub = BroadcastHub::new(DEFAULT_SUBSCRIBER_QUEUE);
    hub.subscribe_bus(&bus);

    let config = ServerConfig { port: args.port };
    let handle = veil_server::start(config, Arc::clone(&hub), keeper)
        .await
        .context("failed to start control API")?;

    bus.publish(
        topic::NODE,
        NodeEvent {
            status: NodeStatus::Started,
        },
    );
    tracing::info!(port = handle.port, "veil node ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    bus.publish(
        topic::NODE,
        NodeEvent {
            status: NodeStatus::Stopped,
        },
    );

    Ok(())
}
