use clap::Parser;
use netcopy::config::{self, Config};
use netcopy::network::TapListener;
use netcopy::tunnel::{RelayMetrics, TunnelRegistry};
use netcopy::Relay;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::{Cli, Command, RunArgs};

// Matches the per-tunnel queue so the tap cannot run far ahead of the relay.
const EVENT_CHANNEL_SIZE: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(ref args) => {
            let config = load_settings(&cli, args)?;
            init_logging(&cli, &config)?;
            run(config).await
        }
        Command::Version => print_version(),
    }
}

fn init_logging(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);

    let subscriber = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(level));

    match format {
        "json" => {
            subscriber
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            subscriber.with(tracing_subscriber::fmt::layer()).init();
        }
    }

    Ok(())
}

fn load_settings(cli: &Cli, args: &RunArgs) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let target = args
                .target
                .clone()
                .ok_or_else(|| anyhow::anyhow!("No config file given and no --target set"))?;
            Config::default_with_target(target)
        }
    };

    // Apply CLI overrides
    if let Some(target) = &args.target {
        config.relay.target = target.clone();
    }
    if let Some(protocol) = args.protocol {
        config.relay.protocol = protocol;
    }
    if let Some(amplification) = args.amplification {
        config.relay.amplification = amplification;
    }
    if let Some(idle_timeout_ms) = args.idle_timeout_ms {
        config.relay.idle_timeout_ms = idle_timeout_ms;
    }
    if let Some(listen) = &args.listen {
        config.tap.listen = listen.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let tunnel_config = config.relay.tunnel_config();
    tracing::info!(
        "Relaying flows to {} over {} with amplification {}",
        tunnel_config.target,
        tunnel_config.transport,
        tunnel_config.amplification
    );

    let metrics = Arc::new(RelayMetrics::new());
    let registry = Arc::new(TunnelRegistry::new(Arc::clone(&metrics)));
    let relay = Relay::new(Arc::clone(&registry), tunnel_config);

    let tap = TapListener::bind(config.tap.tap_config()?).await?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tap_handle = tokio::spawn(tap.run(event_tx, shutdown_rx.clone()));
    let relay_handle = tokio::spawn(relay.run(event_rx, shutdown_rx));

    wait_for_shutdown_signal().await;

    tracing::info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(true);

    match tap_handle.await {
        Ok(Err(e)) => tracing::error!("Tap listener failed: {}", e),
        Err(e) => tracing::error!("Tap task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = relay_handle.await {
        tracing::error!("Relay task panicked: {}", e);
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        "Shutdown complete: {} tunnels opened, {} dial failures, {} payloads forwarded, {} bytes written, {} payloads dropped",
        snapshot.tunnels_opened,
        snapshot.dial_failures,
        snapshot.payloads_forwarded,
        snapshot.bytes_written,
        snapshot.payloads_dropped
    );
    Ok(())
}

fn print_version() -> anyhow::Result<()> {
    println!("netcopy {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C (SIGINT)");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
