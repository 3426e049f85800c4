//! ---
//! sbus_section: "01-core-functionality"
//! sbus_subsection: "binary"
//! sbus_type: "source"
//! sbus_scope: "code"
//! sbus_description: "Binary entrypoint for the S-BUS node daemon."
//! sbus_version: "v0.0.0-prealpha"
//! sbus_owner: "tbd"
//! ---
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use prometheus::{Encoder, Registry, TextEncoder};
use sbus_common::config::LoadedAppConfig;
use sbus_common::{init_tracing, AppConfig, TransportKind};
use sbus_market::AlphaVantageGateway;
use sbus_msg::{
    build_transport, BusClient, BusMetrics, Envelope, HandlerRegistry, HandlerSettings, LogSink,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "S-BUS node daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured transport")]
    transport: Option<CliTransport>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTransport {
    Coap,
    Mqtt,
}

impl From<CliTransport> for TransportKind {
    fn from(value: CliTransport) -> Self {
        match value {
            CliTransport::Coap => TransportKind::Coap,
            CliTransport::Mqtt => TransportKind::Mqtt,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the node; envelopes are read from stdin, one JSON document per line")]
    Run,
    #[command(about = "Pack a service file or directory and register it on the bus")]
    Register {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

/// Prints results for the operator and mirrors them into tracing.
struct StdoutLogSink;

impl LogSink for StdoutLogSink {
    fn line(&self, text: &str) {
        println!("{text}");
        info!(target: "sbus::log", "{text}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/sbus.toml"));
    candidates.push(PathBuf::from("sbus.toml"));

    let LoadedAppConfig {
        mut config,
        source,
    } = AppConfig::load_with_source(&candidates)?;
    if let Some(transport) = cli.transport {
        config.node.transport = transport.into();
    }
    init_tracing("sbusd", &config.logging)?;
    info!(config_path = %source.display(), transport = ?config.node.transport, node = %config.node.name, "configuration loaded");

    let registry = Registry::new();
    let client = build_client(&config, &registry)?;
    client
        .start()
        .await
        .with_context(|| format!("failed to start {} transport", client.transport().name()))?;

    let outcome = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_node(&client).await,
        Commands::Register { path } => register(&client, path).await,
    };

    client.on_shutdown().await?;
    info!(stats = ?client.stats(), "node stopped");
    dump_metrics(&registry);
    outcome
}

fn build_client(config: &AppConfig, registry: &Registry) -> Result<BusClient> {
    let gateway =
        AlphaVantageGateway::new(&config.market).context("failed to build market gateway")?;
    if config.market.resolved_api_key().is_none() {
        warn!(
            env = sbus_common::MarketConfig::ENV_API_KEY,
            "no market api key configured; quote requests will be answered with errors"
        );
    }
    let handlers = HandlerRegistry::with_builtins(
        HandlerSettings::from(&config.handlers),
        Arc::new(gateway),
    );
    let metrics = BusMetrics::register(registry).context("failed to register bus metrics")?;
    let transport = build_transport(config).context("failed to build transport")?;

    Ok(BusClient::builder(transport, Arc::new(handlers))
        .node_name(config.node.name.clone())
        .log_sink(Arc::new(StdoutLogSink))
        .metrics(metrics)
        .handler_timeout(config.handlers.timeout)
        .build())
}

async fn run_node(client: &BusClient) -> Result<()> {
    info!(transport = client.transport().name(), "node running; reading envelopes from stdin");
    read_until_shutdown(
        BufReader::new(tokio::io::stdin()),
        shutdown_signal(),
        |line| async move { submit(client, &line).await },
    )
    .await
}

/// Feed input lines to `on_line` until `shutdown` resolves.
///
/// End of input only stops reading; the node keeps serving the bus until a
/// termination signal arrives.
async fn read_until_shutdown<R, S, F, Fut>(input: R, shutdown: S, mut on_line: F) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = Result<&'static str>>,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut input_open = true;
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line.context("failed to read stdin")? {
                    Some(line) => on_line(line).await,
                    None => {
                        info!("stdin closed; serving until a termination signal");
                        input_open = false;
                    }
                }
            }
            received = &mut shutdown => {
                let received = received?;
                info!(signal = received, "shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Resolve on ctrl-c, or on SIGTERM where the platform has it.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut terminate =
            unix_signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            interrupted = signal::ctrl_c() => {
                interrupted.context("failed to listen for ctrl-c")?;
                Ok("ctrl-c")
            }
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
        Ok("ctrl-c")
    }
}

async fn submit(client: &BusClient, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let envelope = match Envelope::from_json(line) {
        Ok(envelope) => envelope,
        Err(err) => {
            eprintln!("{err}");
            return;
        }
    };
    let action = envelope.action().to_owned();
    match client.on_user_send(envelope).await {
        Ok(receipt) => {
            tokio::spawn(async move {
                match receipt.outcome().await {
                    Ok(delivery) => info!(%action, ?delivery, "delivery settled"),
                    Err(err) => warn!(%action, error = %err, "delivery failed"),
                }
            });
        }
        Err(err) => eprintln!("failed to send {action}: {err}"),
    }
}

async fn register(client: &BusClient, path: PathBuf) -> Result<()> {
    let receipt = client
        .register_service(&path)
        .await
        .with_context(|| format!("failed to register {}", path.display()))?;
    let delivery = receipt.outcome().await?;
    if !delivery.is_success() {
        anyhow::bail!("bus rejected registration: {delivery:?}");
    }
    info!(path = %path.display(), ?delivery, "service registration delivered");
    Ok(())
}

fn dump_metrics(registry: &Registry) {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        warn!(error = %err, "failed to encode metrics");
        return;
    }
    debug!(metrics = %String::from_utf8_lossy(&buffer), "final metrics snapshot");
}
