use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use market_bus_bridge::local::{local_config, LocalPipeline};
use market_bus_bridge::{CommandGateway, CommandRoute};
use market_bus_core::telemetry::init_logging;
use market_bus_core::{BridgeConfig, RequestClient, SendOptions, Transport};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "market-bus", version, about = "Send commands to the market worker pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one command and print the worker's reply.
    Send {
        /// Command route, e.g. /stock/create
        uri: String,
        /// JSON payload
        payload: String,
        /// Overrides REQUEST_TIMEOUT_MS for this call.
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Correlation key to use instead of a generated one.
        #[arg(long)]
        key: Option<String>,
        /// Use an in-process broker with an echo worker.
        #[arg(long)]
        in_memory: bool,
    },
    /// List the known command routes.
    Routes,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let cli = Cli::parse();
    match cli.command {
        Command::Routes => {
            for route in CommandRoute::ALL {
                println!("{route}");
            }
            Ok(())
        }
        Command::Send {
            uri,
            payload,
            timeout_ms,
            key,
            in_memory,
        } => send(&uri, &payload, timeout_ms, key, in_memory).await,
    }
}

async fn send(
    uri: &str,
    payload: &str,
    timeout_ms: Option<u64>,
    key: Option<String>,
    in_memory: bool,
) -> Result<(), BoxError> {
    let route: CommandRoute = uri.parse()?;
    let payload: Value = serde_json::from_str(payload)?;

    // Kept alive until the call completes.
    let mut local = None;
    let client = if in_memory {
        let config = local_config(
            BridgeConfig::default().with_env_overrides(|name| std::env::var(name).ok())?,
        );
        let pipeline = LocalPipeline::start(&config).await?;
        let client = RequestClient::with_transport(config, pipeline.transport())?;
        local = Some(pipeline);
        client
    } else {
        let config = BridgeConfig::load()?;
        let (outbound, inbound) = broker_transports(&config)?;
        RequestClient::new(config, outbound, inbound)?
    };

    let client = Arc::new(client);
    client.start().await?;

    let mut options = SendOptions::new();
    if let Some(ms) = timeout_ms {
        options = options.timeout_ms(ms);
    }
    if let Some(key) = key {
        options = options.key(key);
    }

    let gateway = CommandGateway::new(Arc::clone(&client));
    let result = gateway.execute_with(route, payload, options).await;
    client.close().await?;
    drop(local);

    match result {
        Ok(dto) => {
            println!("{}", serde_json::to_string_pretty(&dto)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(uri = %route, status = e.status_code(), error = %e, "Command failed");
            Err(e.into())
        }
    }
}

#[cfg(feature = "mqtt")]
fn broker_transports(
    config: &BridgeConfig,
) -> market_bus_core::Result<(Arc<dyn Transport>, Arc<dyn Transport>)> {
    use market_bus_core::messaging::MqttTransport;

    let outbound: Arc<dyn Transport> = Arc::new(MqttTransport::from_config(config, "pub")?);
    let inbound: Arc<dyn Transport> = Arc::new(MqttTransport::from_config(config, "sub")?);
    Ok((outbound, inbound))
}

#[cfg(not(feature = "mqtt"))]
fn broker_transports(
    _config: &BridgeConfig,
) -> market_bus_core::Result<(Arc<dyn Transport>, Arc<dyn Transport>)> {
    use market_bus_core::BusError;

    Err(BusError::Config(
        "no broker transport built in; rebuild with --features mqtt or pass --in-memory".into(),
    ))
}
