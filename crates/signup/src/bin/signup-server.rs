//! Registration service.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use signup::server::run_server;
use signup::Config;

/// Race-free registration server. Backends are configured through
/// `SIGNUP_*` environment variables.
#[derive(Parser)]
#[command(name = "signup-server")]
#[command(version)]
struct Cli {
    /// Override `SIGNUP_PORT`
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON logs
    #[arg(long, env = "SIGNUP_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("signup=debug,tower_http=debug,info")
        } else {
            EnvFilter::new("signup=info,warn")
        }
    });
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    info!(config = ?config, "Starting signup server");

    run_server(config).await
}
