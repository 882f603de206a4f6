//! fleetschemad — the fleetschema daemon.
//!
//! Runs beside (or inside the deployment of) every service instance:
//! - bootstraps the database and its bookkeeping
//! - keeps this instance's registration alive
//! - serves the catalog HTTP API when a scripts directory is configured
//! - optionally upgrades the database to the latest compatible version
//!
//! # Usage
//!
//! ```text
//! fleetschemad --config /etc/fleetschema.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use fleetschema_core::FleetConfig;
use fleetschema_ledger::PostgresLedger;

mod daemon;

#[derive(Parser)]
#[command(name = "fleetschemad", about = "fleetschema daemon", version)]
struct Cli {
    /// Path to fleetschema.toml.
    #[arg(short, long, default_value = "fleetschema.toml")]
    config: PathBuf,

    /// Catalog port, overrides [catalog].listen_port.
    #[arg(long)]
    port: Option<u16>,

    /// Script directory, overrides [catalog].scripts_dir.
    #[arg(long)]
    scripts_dir: Option<String>,

    /// Upgrade to the latest compatible version on start.
    #[arg(long)]
    auto_upgrade: bool,

    /// Highest version to advertise, overrides [catalog].max_version.
    #[arg(long)]
    max_version: Option<i32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetschema=debug")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        FleetConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        info!(path = %cli.config.display(), "no config file, using defaults");
        FleetConfig::default()
    };
    if let Some(port) = cli.port {
        config.catalog.listen_port = port;
    }
    if let Some(dir) = cli.scripts_dir {
        config.catalog.scripts_dir = Some(dir);
    }
    config.catalog.auto_upgrade |= cli.auto_upgrade;
    if let Some(max) = cli.max_version {
        config.catalog.max_version = Some(max);
    }
    config.validate()?;

    let ledger = Arc::new(PostgresLedger::new(&config.database.url, &config.database.name)?);
    info!(database = %config.database.name, "ledger configured");

    let listener = match &config.catalog.scripts_dir {
        Some(_) => {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.catalog.listen_port));
            Some(tokio::net::TcpListener::bind(addr).await?)
        }
        None => None,
    };

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    daemon::Daemon::new(config, ledger.clone(), ledger)
        .run(listener, shutdown_rx)
        .await?;

    info!("fleetschema daemon stopped");
    Ok(())
}
