//! Daemon mode — wires the registrar, catalog server and auto-upgrade
//! together around one ledger.
//!
//! Startup order:
//! 1. Bootstrap the database and its bookkeeping
//! 2. Start the registrar heartbeat
//! 3. Serve the catalog API if a scripts directory is configured
//! 4. Apply the latest compatible version if auto-upgrade is on
//!
//! Everything stops when the shutdown channel flips.

use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use fleetschema_catalog::{
    HttpCatalogClient, LocalCatalog, SchemaCatalog, ScriptLibrary, build_router,
};
use fleetschema_core::FleetConfig;
use fleetschema_core::shutdown::wait_for_shutdown;
use fleetschema_ledger::{DatabaseProvisioner, SchemaLedger, SchemaVersion};
use fleetschema_migrate::{
    BaseSchemaBootstrapper, MigrateError, MigrationOptions, MigrationOrchestrator,
    SchemaUpgraded, TargetSelector,
};
use fleetschema_registry::InstanceRegistrar;

pub struct Daemon {
    config: FleetConfig,
    ledger: Arc<dyn SchemaLedger>,
    provisioner: Arc<dyn DatabaseProvisioner>,
}

impl Daemon {
    pub fn new(
        config: FleetConfig,
        ledger: Arc<dyn SchemaLedger>,
        provisioner: Arc<dyn DatabaseProvisioner>,
    ) -> Self {
        Self {
            config,
            ledger,
            provisioner,
        }
    }

    /// Run until `shutdown` flips. `listener` serves the catalog API.
    pub async fn run(
        self,
        listener: Option<TcpListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let config = &self.config;
        let options = MigrationOptions::from_config(&config.retry)?;

        // ── Bootstrap ──────────────────────────────────────────
        let bootstrapper =
            BaseSchemaBootstrapper::new(self.ledger.clone(), self.provisioner.clone())
                .with_registration_retry(options.registration_retry);
        bootstrapper.ensure_base_schema_exists().await?;
        info!(database = self.provisioner.database_name(), "base schema ready");

        // ── Registrar ──────────────────────────────────────────
        let registrar = InstanceRegistrar::new(
            self.ledger.clone(),
            &config.instance.resolved_name(),
            config.instance.supported_range()?,
        )
        .with_heartbeat_interval(config.heartbeat.interval()?)
        .with_lease_ttl(config.heartbeat.lease_ttl()?)
        .with_registration_retry(options.registration_retry);
        info!(
            instance = registrar.name(),
            supported = %registrar.supported(),
            "starting registrar"
        );
        let (registrar_handle, current) = registrar.spawn(shutdown.clone());
        let version_handle = tokio::spawn(log_version_changes(current, shutdown.clone()));

        // ── Catalog ────────────────────────────────────────────
        let local = match &config.catalog.scripts_dir {
            Some(dir) => {
                let library = ScriptLibrary::load_dir(Path::new(dir))?;
                info!(
                    dir = %dir,
                    newest = ?library.max_version(),
                    cap = ?config.catalog.max_version,
                    "script library loaded"
                );
                let mut catalog = LocalCatalog::new(library, self.ledger.clone());
                if let Some(max) = config.catalog.max_version {
                    catalog = catalog.with_max_version(max);
                }
                Some(Arc::new(catalog))
            }
            None => None,
        };

        let server_handle = match (&local, listener) {
            (Some(local), Some(listener)) => {
                let router = build_router(local.clone());
                let mut server_shutdown = shutdown.clone();
                info!(addr = ?listener.local_addr().ok(), "catalog server starting");
                Some(tokio::spawn(async move {
                    axum::serve(listener, router)
                        .with_graceful_shutdown(async move {
                            wait_for_shutdown(&mut server_shutdown).await;
                        })
                        .await
                }))
            }
            (Some(_), None) => {
                warn!("scripts directory configured without a listener, catalog not served");
                None
            }
            (None, _) => {
                info!("no scripts directory, catalog server disabled");
                None
            }
        };

        // ── Auto-upgrade ───────────────────────────────────────
        let upgrade_handle = if config.catalog.auto_upgrade {
            let catalog: Arc<dyn SchemaCatalog> = match local {
                Some(local) => local,
                None => Arc::new(HttpCatalogClient::new(&config.catalog.base_uri)?),
            };
            let orchestrator = MigrationOrchestrator::new(self.ledger.clone(), catalog, bootstrapper)
                .with_options(options);
            tokio::spawn(log_upgrades(orchestrator.subscribe()));

            let upgrade_shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                match orchestrator
                    .apply_schema(TargetSelector::Latest, false, &upgrade_shutdown)
                    .await
                {
                    Ok(outcome) => info!(?outcome, "auto-upgrade finished"),
                    Err(MigrateError::Cancelled) => info!("auto-upgrade cancelled"),
                    Err(e) => error!(error = %e, "auto-upgrade failed"),
                }
            }))
        } else {
            None
        };

        wait_for_shutdown(&mut shutdown).await;
        info!("shutting down");

        if let Some(handle) = upgrade_handle {
            let _ = handle.await;
        }
        if let Some(handle) = server_handle {
            handle.await??;
        }
        let _ = registrar_handle.await;
        let _ = version_handle.await;
        Ok(())
    }
}

async fn log_version_changes(
    mut current: watch::Receiver<SchemaVersion>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = current.changed() => {
                if changed.is_err() {
                    return;
                }
                let version = *current.borrow_and_update();
                info!(version, "database schema version observed");
            }
            _ = wait_for_shutdown(&mut shutdown) => return,
        }
    }
}

async fn log_upgrades(mut events: broadcast::Receiver<SchemaUpgraded>) {
    loop {
        match events.recv().await {
            Ok(event) => info!(
                version = event.version,
                full_snapshot = event.is_full_snapshot,
                "schema upgraded"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "upgrade events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use fleetschema_ledger::{EmbeddedLedger, ScriptRunner};

    use super::*;

    #[derive(Default)]
    struct RecordingRunner {
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScriptRunner for RecordingRunner {
        async fn run(&self, script: &str) -> Result<(), String> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(())
        }
    }

    fn config(scripts_dir: &Path, auto_upgrade: bool) -> FleetConfig {
        config_with_cap(scripts_dir, auto_upgrade, None)
    }

    fn config_with_cap(scripts_dir: &Path, auto_upgrade: bool, cap: Option<i32>) -> FleetConfig {
        let mut config = FleetConfig::from_toml(&format!(
            r#"
[instance]
name = "test-1"
min_supported_version = 1
max_supported_version = 2

[heartbeat]
interval = "20ms"
lease_ttl = "5s"

[catalog]
scripts_dir = {dir:?}
auto_upgrade = {auto_upgrade}

[retry.registration]
attempts = 50
delay = "10ms"

[retry.discover]
attempts = 3
delay = "10ms"

[retry.resolve]
attempts = 3
delay = "10ms"

[retry.compatibility]
attempts = 3
delay = "10ms"

[retry.readiness]
attempts = 3
delay = "10ms"
"#,
            dir = scripts_dir.display().to_string(),
        ))
        .unwrap();
        config.catalog.max_version = cap;
        config
    }

    fn scripts() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.sql"), "snapshot 1").unwrap();
        std::fs::write(dir.path().join("2.sql"), "snapshot 2").unwrap();
        std::fs::write(dir.path().join("2.diff.sql"), "diff 2").unwrap();
        dir
    }

    async fn wait_for_version(ledger: &EmbeddedLedger, version: SchemaVersion) {
        for _ in 0..200 {
            if ledger.current_schema_version().await.unwrap() == version {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("ledger never reached version {version}");
    }

    #[tokio::test]
    async fn auto_upgrade_serves_and_stops() {
        let dir = scripts();
        let runner = Arc::new(RecordingRunner::default());
        let ledger = Arc::new(EmbeddedLedger::open_in_memory(runner.clone()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = watch::channel(false);
        let daemon = Daemon::new(config(dir.path(), true), ledger.clone(), ledger.clone());
        let handle = tokio::spawn(daemon.run(Some(listener), rx));

        wait_for_version(&ledger, 2).await;
        assert_eq!(*runner.scripts.lock().unwrap(), vec!["snapshot 2".to_string()]);

        let client = HttpCatalogClient::new(&format!("http://{addr}")).unwrap();
        let available = client.available_versions().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].id, 2);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn catalog_cap_holds_back_newer_scripts() {
        let dir = scripts();
        let runner = Arc::new(RecordingRunner::default());
        let ledger = Arc::new(EmbeddedLedger::open_in_memory(runner.clone()).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = watch::channel(false);
        let daemon = Daemon::new(
            config_with_cap(dir.path(), true, Some(1)),
            ledger.clone(),
            ledger.clone(),
        );
        let handle = tokio::spawn(daemon.run(Some(listener), rx));

        wait_for_version(&ledger, 1).await;
        assert_eq!(*runner.scripts.lock().unwrap(), vec!["snapshot 1".to_string()]);

        let client = HttpCatalogClient::new(&format!("http://{addr}")).unwrap();
        let available = client.available_versions().await.unwrap();
        assert_eq!(available.iter().map(|v| v.id).collect::<Vec<_>>(), vec![1]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn without_auto_upgrade_only_registers() {
        let dir = scripts();
        let runner = Arc::new(RecordingRunner::default());
        let ledger = Arc::new(EmbeddedLedger::open_in_memory(runner.clone()).unwrap());

        let (tx, rx) = watch::channel(false);
        let daemon = Daemon::new(config(dir.path(), false), ledger.clone(), ledger.clone());
        let handle = tokio::spawn(daemon.run(None, rx));

        for _ in 0..200 {
            if ledger.instance_registration_exists().await.unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let live = ledger.live_registrations().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "test-1");
        assert!(runner.scripts.lock().unwrap().is_empty());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
