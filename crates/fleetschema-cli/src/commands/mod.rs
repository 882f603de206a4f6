pub mod apply;
pub mod show;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info};

use fleetschema_catalog::HttpCatalogClient;
use fleetschema_core::FleetConfig;
use fleetschema_ledger::PostgresLedger;
use fleetschema_migrate::{BaseSchemaBootstrapper, MigrationOptions, MigrationOrchestrator};

use crate::GlobalArgs;

const DEFAULT_CONFIG: &str = "fleetschema.toml";

/// Config file (explicit, or `./fleetschema.toml` if present) with flag overrides applied.
pub fn load_config(global: &GlobalArgs) -> anyhow::Result<FleetConfig> {
    let mut config = match &global.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => {
            FleetConfig::from_file(Path::new(DEFAULT_CONFIG))
                .with_context(|| format!("loading {DEFAULT_CONFIG}"))?
        }
        None => FleetConfig::default(),
    };

    if let Some(server) = &global.server {
        config.catalog.base_uri = server.clone();
    }
    if let Some(url) = &global.connection_string {
        config.database.url = url.clone();
    }
    if let Some(name) = &global.database {
        config.database.name = name.clone();
    }
    config.validate()?;
    debug!(
        catalog = %config.catalog.base_uri,
        database = %config.database.name,
        "configuration loaded"
    );
    Ok(config)
}

pub fn build_orchestrator(config: &FleetConfig) -> anyhow::Result<MigrationOrchestrator> {
    let ledger = Arc::new(PostgresLedger::new(&config.database.url, &config.database.name)?);
    let catalog = Arc::new(
        HttpCatalogClient::new(&config.catalog.base_uri)
            .with_context(|| format!("catalog {}", config.catalog.base_uri))?,
    );
    let bootstrapper = BaseSchemaBootstrapper::new(ledger.clone(), ledger.clone());
    let options = MigrationOptions::from_config(&config.retry)?;
    Ok(MigrationOrchestrator::new(ledger, catalog, bootstrapper).with_options(options))
}

/// Flips to `true` on the first Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling");
            let _ = tx.send(true);
        }
    });
    rx
}
