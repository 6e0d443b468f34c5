//! Signup harness CLI - fire duplicate registrations at a running server.

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use signup::harness::{mock_users, run_batch, DEFAULT_DUPLICATES};
use signup_harness::HttpRegistrar;

/// Send every mock user's registration several times at once and verify
/// that each openid was registered exactly once.
#[derive(Parser)]
#[command(name = "signup-harness")]
#[command(version)]
struct Cli {
    /// Server base URL
    #[arg(long, env = "SIGNUP_HARNESS_BASE_URL", default_value = "http://localhost:9999")]
    base_url: String,

    /// Registration path on the server
    #[arg(long, default_value = "register")]
    register_path: String,

    /// Number of distinct users
    #[arg(short, long, default_value = "50")]
    count: usize,

    /// Concurrent copies of each request
    #[arg(short, long, default_value_t = DEFAULT_DUPLICATES)]
    duplicates: usize,

    /// Print the full per-openid report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("signup=debug,signup_harness=debug,info")
    } else {
        EnvFilter::new("signup=info,signup_harness=info,warn")
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if cli.count == 0 || cli.duplicates == 0 {
        bail!("--count and --duplicates must be at least 1");
    }

    let registrar = Arc::new(HttpRegistrar::new(&cli.base_url, &cli.register_path)?);
    info!(
        endpoint = registrar.endpoint(),
        count = cli.count,
        duplicates = cli.duplicates,
        "Starting duplicate registration run"
    );

    let report = run_batch(registrar, mock_users(cli.count), cli.duplicates).await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let totals = report.totals();
    println!(
        "registered={} already_registered={} unavailable={} failed={}",
        totals.registered, totals.already_registered, totals.unavailable, totals.failed
    );

    let violations = report.violations();
    if !violations.is_empty() {
        for openid in &violations {
            error!(openid = %openid, "Registered more than once");
        }
        bail!("{} openid(s) registered more than once", violations.len());
    }

    info!("Every openid registered at most once");
    Ok(())
}
