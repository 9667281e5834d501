//! `gatehouse` — runs the gateway client service.

use anyhow::Context;
use clap::{Parser, Subcommand};
use gatehouse_api::config::load_config;
use gatehouse_types::ServiceConfig;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "gatehouse",
    version,
    about = "Gateway RPC client and connection pool for the agent dashboard"
)]
struct Cli {
    /// Path to config file (default: ~/.gatehouse/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API until interrupted.
    Serve {
        /// Override the listen address from the config file.
        #[arg(long)]
        listen: Option<String>,
        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the effective configuration with tokens redacted.
    CheckConfig,
}

/// Logs go to stderr so stdout carries only command output.
fn init_tracing_stderr(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { listen, log_json } => {
            init_tracing_stderr(log_json);
            let mut config = load_config(cli.config.as_deref());
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            cmd_serve(config)
        }
        Commands::CheckConfig => {
            init_tracing_stderr(false);
            cmd_check_config(&load_config(cli.config.as_deref()))
        }
    }
}

fn cmd_serve(config: ServiceConfig) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let listen_addr = config.listen_addr.clone();
        gatehouse_api::run_server(config, shutdown_signal())
            .await
            .with_context(|| format!("Gatehouse API on {listen_addr} failed"))
    })
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown requested");
    } else {
        // No signal handler available; run until the process is killed.
        std::future::pending::<()>().await;
    }
}

fn cmd_check_config(config: &ServiceConfig) -> anyhow::Result<()> {
    let rendered =
        toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")?;
    println!("{rendered}");
    Ok(())
}
