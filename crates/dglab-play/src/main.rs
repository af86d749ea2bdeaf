//! dglab-play: multi-tenant DG-Lab session manager.
//!
//! Gives every tenant its own terminal on a DG-Lab relay (a remote one, or
//! one hosted in this process), keeps a waveform looping on each bound App
//! and groups tenants for dice games. Operators drive it from stdin.

mod commands;
mod config;
mod console;
mod game;
mod pulses;
mod registry;
mod relay;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};

use commands::Commands;
use config::{Overrides, PlayConfig};
use console::Console;
use pulses::PulseLibrary;
use registry::Registry;

/// dglab-play: DG-Lab session manager
#[derive(Parser, Debug)]
#[command(name = "dglab-play", version, about = "Multi-tenant DG-Lab session manager")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.dglab-play/config.toml")]
    config: String,

    /// Connect terminals to this relay instead of hosting one
    #[arg(long)]
    remote_uri: Option<String>,

    /// Local relay listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Address Apps use to reach the local relay
    #[arg(long)]
    publish_uri: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting dglab-play");

    // Outward wss connections build their client config from the process default.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let overrides = Overrides {
        remote_uri: cli.remote_uri,
        port: cli.port,
        publish_uri: cli.publish_uri,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = PlayConfig::load(Some(&config_path), &overrides).context("failed to load config")?;

    let pulses = PulseLibrary::load_or_init(&config.pulse.custom_pulse_data)
        .context("failed to load pulse library")?;

    let registry = Registry::new(&config.relay, config.session_settings());
    registry.serve().await.context("failed to start relay")?;

    let commands = Commands::new(registry, Arc::new(pulses));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            println!("{line}");
        }
    });
    let console = Console::new(commands, config.game, out_tx);

    tokio::select! {
        result = console.run(BufReader::new(tokio::io::stdin())) => {
            if let Err(e) = result {
                error!(error = %e, "console failed");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("dglab-play stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
