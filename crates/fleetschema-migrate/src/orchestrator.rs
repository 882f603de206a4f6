//! Migration orchestrator — drives the database to a target version.
//!
//! One call to [`MigrationOrchestrator::apply_schema`] runs the whole
//! state machine:
//!
//! ```text
//! Bootstrapping → Discovering → Validating → Applying(v) … → Done
//!        └──────────────┴────────────┴────────────┴──→ Failed
//! ```
//!
//! Every step recomputes from the ledger, so a run that fails halfway
//! resumes at the first version it did not commit. Versions are applied in
//! ascending order without gaps, each in its own transaction. `force` only
//! skips the wait for instances to reach the previous version; it never
//! bypasses the fleet compatibility check.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use fleetschema_catalog::{AvailableVersion, CatalogError, SchemaCatalog};
use fleetschema_core::config::{ConfigResult, RetryConfig};
use fleetschema_core::RetryPolicy;
use fleetschema_ledger::{
    CurrentVersionInformation, SchemaLedger, SchemaVersion, SchemaVersionStatus,
};
use fleetschema_registry::CompatibleVersions;

use crate::bootstrap::BaseSchemaBootstrapper;
use crate::error::{MigrateError, MigrateResult, from_execution};
use crate::events::{EVENT_CAPACITY, SchemaUpgraded};

/// Which version to migrate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSelector {
    /// The version right after the current one.
    Next,
    /// The newest version the catalog offers.
    Latest,
    Explicit(SchemaVersion),
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Next => f.write_str("next"),
            TargetSelector::Latest => f.write_str("latest"),
            TargetSelector::Explicit(v) => write!(f, "{v}"),
        }
    }
}

/// Where the orchestrator is in its current (or last) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum MigrationPhase {
    Idle,
    Bootstrapping,
    Discovering,
    Validating,
    Applying { version: SchemaVersion },
    Done,
    Failed { reason: String },
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPhase::Idle => f.write_str("idle"),
            MigrationPhase::Bootstrapping => f.write_str("bootstrapping"),
            MigrationPhase::Discovering => f.write_str("discovering"),
            MigrationPhase::Validating => f.write_str("validating"),
            MigrationPhase::Applying { version } => write!(f, "applying({version})"),
            MigrationPhase::Done => f.write_str("done"),
            MigrationPhase::Failed { .. } => f.write_str("failed"),
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Nothing newer was available.
    UpToDate { current: SchemaVersion },
    Applied {
        from: SchemaVersion,
        to: SchemaVersion,
        /// Committed versions, in order.
        applied: Vec<SchemaVersion>,
        full_snapshot: bool,
    },
}

/// Retry policies for each waiting step of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Listing available versions while the catalog may still be starting.
    pub discover_retry: RetryPolicy,
    /// Waiting for the catalog's current version to match the ledger.
    pub resolve_retry: RetryPolicy,
    /// Reading the fleet's compatible range.
    pub compatibility_retry: RetryPolicy,
    /// Waiting for live instances to reach the previous version.
    pub readiness_retry: RetryPolicy,
    /// Waiting for the first instance registration.
    pub registration_retry: RetryPolicy,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            discover_retry: RetryPolicy::fixed(10, Duration::from_secs(3)),
            resolve_retry: RetryPolicy::fixed(5, Duration::from_secs(5)),
            compatibility_retry: RetryPolicy::fixed(3, Duration::from_secs(30)),
            readiness_retry: RetryPolicy::fixed(5, Duration::from_secs(30)),
            registration_retry: RetryPolicy::fixed(5, Duration::from_secs(2)),
        }
    }
}

impl MigrationOptions {
    pub fn from_config(config: &RetryConfig) -> ConfigResult<Self> {
        Ok(Self {
            discover_retry: config.discover.to_policy("retry.discover")?,
            resolve_retry: config.resolve.to_policy("retry.resolve")?,
            compatibility_retry: config.compatibility.to_policy("retry.compatibility")?,
            readiness_retry: config.readiness.to_policy("retry.readiness")?,
            registration_retry: config.registration.to_policy("retry.registration")?,
        })
    }

    /// Same policy for every step.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            discover_retry: policy,
            resolve_retry: policy,
            compatibility_retry: policy,
            readiness_retry: policy,
            registration_retry: policy,
        }
    }
}

/// Ledger view and catalog listing agreed on by the resolve step.
struct Resolved {
    current: SchemaVersion,
    available: Vec<AvailableVersion>,
}

pub struct MigrationOrchestrator {
    ledger: Arc<dyn SchemaLedger>,
    catalog: Arc<dyn SchemaCatalog>,
    bootstrapper: BaseSchemaBootstrapper,
    options: MigrationOptions,
    phase: watch::Sender<MigrationPhase>,
    events: broadcast::Sender<SchemaUpgraded>,
}

impl MigrationOrchestrator {
    pub fn new(
        ledger: Arc<dyn SchemaLedger>,
        catalog: Arc<dyn SchemaCatalog>,
        bootstrapper: BaseSchemaBootstrapper,
    ) -> Self {
        let options = MigrationOptions::default();
        let (phase, _) = watch::channel(MigrationPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            ledger,
            catalog,
            bootstrapper: bootstrapper.with_registration_retry(options.registration_retry),
            options,
            phase,
            events,
        }
    }

    pub fn with_options(mut self, options: MigrationOptions) -> Self {
        self.bootstrapper = self
            .bootstrapper
            .with_registration_retry(options.registration_retry);
        self.options = options;
        self
    }

    /// Receive a [`SchemaUpgraded`] for every version committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchemaUpgraded> {
        self.events.subscribe()
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase.borrow().clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<MigrationPhase> {
        self.phase.subscribe()
    }

    /// Live instances grouped by the version they last observed.
    pub async fn current_schema(&self) -> MigrateResult<Vec<CurrentVersionInformation>> {
        Ok(self.catalog.current_versions().await?)
    }

    /// Versions the catalog offers, starting at the current one.
    pub async fn available_schema(&self) -> MigrateResult<Vec<AvailableVersion>> {
        Ok(self.catalog.available_versions().await?)
    }

    /// Migrate to the version picked by `selector`.
    pub async fn apply_schema(
        &self,
        selector: TargetSelector,
        force: bool,
        shutdown: &watch::Receiver<bool>,
    ) -> MigrateResult<ApplyOutcome> {
        info!(%selector, force, "schema migration requested");
        let result = self.run(selector, force, shutdown).await;
        match &result {
            Ok(outcome) => {
                self.transition(MigrationPhase::Done);
                info!(?outcome, "schema migration finished");
            }
            Err(e) => {
                error!(error = %e, "schema migration failed");
                self.transition(MigrationPhase::Failed {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    fn transition(&self, next: MigrationPhase) {
        let prev = self.phase.send_replace(next.clone());
        debug!(from = %prev, to = %next, "migration phase");
    }

    async fn run(
        &self,
        selector: TargetSelector,
        force: bool,
        shutdown: &watch::Receiver<bool>,
    ) -> MigrateResult<ApplyOutcome> {
        self.transition(MigrationPhase::Bootstrapping);
        self.bootstrapper.ensure_base_schema_exists().await?;
        self.bootstrapper
            .ensure_instance_registration_exists(shutdown)
            .await?;

        self.transition(MigrationPhase::Discovering);
        let discovered = self.discover(shutdown).await?;
        debug!(count = discovered.len(), "catalog reachable");

        self.transition(MigrationPhase::Validating);
        let Resolved { current, available } = self.resolve(shutdown).await?;
        if available.len() <= 1 {
            info!(current, "schema is up to date");
            return Ok(ApplyOutcome::UpToDate { current });
        }

        let remaining = &available[1..];
        let target = select_target(selector, remaining)?;
        let first = remaining[0].id;
        if first != current + 1 {
            return Err(MigrateError::VersionNotAvailable {
                requested: current + 1,
                first,
                last: remaining.last().map_or(first, |v| v.id),
            });
        }

        self.check_compatibility(target, shutdown).await?;

        if first == 1 {
            return self.apply_snapshot(current, target, remaining, shutdown).await;
        }

        let mut applied = Vec::new();
        for version in first..=target {
            if !force {
                self.wait_for_instances(version - 1, shutdown).await?;
            }
            let uri = find(remaining, version)
                .and_then(|v| v.diff_uri.clone())
                .ok_or(MigrateError::ScriptUnavailable {
                    version,
                    kind: "diff",
                })?;
            self.apply_version(version, &uri, false, shutdown).await?;
            applied.push(version);
        }

        Ok(ApplyOutcome::Applied {
            from: current,
            to: target,
            applied,
            full_snapshot: false,
        })
    }

    async fn discover(&self, shutdown: &watch::Receiver<bool>) -> MigrateResult<Vec<AvailableVersion>> {
        let catalog = &self.catalog;
        Ok(self
            .options
            .discover_retry
            .run(shutdown, CatalogError::is_transient, move || {
                catalog.available_versions()
            })
            .await?)
    }

    /// Fetch the listing again until its head agrees with the ledger.
    async fn resolve(&self, shutdown: &watch::Receiver<bool>) -> MigrateResult<Resolved> {
        let (catalog, ledger) = (&self.catalog, &self.ledger);
        let retryable =
            |e: &MigrateError| matches!(e, MigrateError::StaleCatalog { .. }) || e.is_transient();

        Ok(self
            .options
            .resolve_retry
            .run(shutdown, retryable, move || async move {
                let available = catalog.available_versions().await?;
                let current = ledger.current_schema_version().await?;
                match available.first() {
                    Some(head) if head.id != current => Err(MigrateError::StaleCatalog {
                        catalog: head.id,
                        ledger: current,
                    }),
                    _ => Ok(Resolved { current, available }),
                }
            })
            .await?)
    }

    async fn check_compatibility(
        &self,
        target: SchemaVersion,
        shutdown: &watch::Receiver<bool>,
    ) -> MigrateResult<()> {
        let catalog = &self.catalog;
        let range: Option<CompatibleVersions> = self
            .options
            .compatibility_retry
            .run(shutdown, CatalogError::is_transient, move || {
                catalog.compatibility()
            })
            .await?;

        match range {
            Some(range) if target > range.max => {
                warn!(target, min = range.min, max = range.max, "target rejected by fleet");
                Err(MigrateError::VersionIncompatible {
                    target,
                    min: range.min,
                    max: range.max,
                })
            }
            Some(range) => {
                debug!(target, min = range.min, max = range.max, "target compatible with fleet");
                Ok(())
            }
            None => {
                warn!(target, "no live instances, fleet compatibility unknown; proceeding");
                Ok(())
            }
        }
    }

    /// Block until every live instance reports `expected`.
    async fn wait_for_instances(
        &self,
        expected: SchemaVersion,
        shutdown: &watch::Receiver<bool>,
    ) -> MigrateResult<()> {
        let catalog = &self.catalog;
        let retryable = |e: &MigrateError| {
            matches!(e, MigrateError::InstancesNotReady { .. }) || e.is_transient()
        };

        Ok(self
            .options
            .readiness_retry
            .run(shutdown, retryable, move || async move {
                let current = catalog.current_versions().await?;
                let waiting = lagging_instances(&current, expected);
                if waiting.is_empty() {
                    Ok(())
                } else {
                    Err(MigrateError::InstancesNotReady { expected, waiting })
                }
            })
            .await?)
    }

    async fn apply_snapshot(
        &self,
        current: SchemaVersion,
        target: SchemaVersion,
        remaining: &[AvailableVersion],
        shutdown: &watch::Receiver<bool>,
    ) -> MigrateResult<ApplyOutcome> {
        let uri = find(remaining, target)
            .and_then(|v| v.snapshot_uri.clone())
            .ok_or(MigrateError::ScriptUnavailable {
                version: target,
                kind: "snapshot",
            })?;
        info!(target, "fresh database, applying full snapshot");
        self.apply_version(target, &uri, true, shutdown).await?;

        Ok(ApplyOutcome::Applied {
            from: current,
            to: target,
            applied: vec![target],
            full_snapshot: true,
        })
    }

    /// Fetch, clear a previous failure, execute and announce one version.
    async fn apply_version(
        &self,
        version: SchemaVersion,
        uri: &str,
        is_full_snapshot: bool,
        shutdown: &watch::Receiver<bool>,
    ) -> MigrateResult<()> {
        self.transition(MigrationPhase::Applying { version });

        let catalog = &self.catalog;
        let script = self
            .options
            .discover_retry
            .run(shutdown, CatalogError::is_transient, move || catalog.script(uri))
            .await?;

        if self
            .ledger
            .delete_version_record(version, SchemaVersionStatus::Failed)
            .await?
        {
            info!(version, "cleared failed attempt");
        }

        self.ledger
            .execute_script_and_complete_version(&script, version, is_full_snapshot)
            .await
            .map_err(from_execution)?;
        info!(version, is_full_snapshot, "schema version applied");

        // Nobody listening is fine.
        let _ = self.events.send(SchemaUpgraded {
            version,
            is_full_snapshot,
        });
        Ok(())
    }
}

/// Pick the target among `remaining`, which must not be empty.
fn select_target(
    selector: TargetSelector,
    remaining: &[AvailableVersion],
) -> MigrateResult<SchemaVersion> {
    let first = remaining.first().map_or(0, |v| v.id);
    let last = remaining.last().map_or(0, |v| v.id);
    let target = match selector {
        TargetSelector::Next => first,
        TargetSelector::Latest => last,
        TargetSelector::Explicit(v) => v,
    };
    if target < first || target > last {
        return Err(MigrateError::VersionNotAvailable {
            requested: target,
            first,
            last,
        });
    }
    Ok(target)
}

fn find(available: &[AvailableVersion], version: SchemaVersion) -> Option<&AvailableVersion> {
    available.iter().find(|v| v.id == version)
}

/// Names of live instances that last observed something other than `expected`.
fn lagging_instances(current: &[CurrentVersionInformation], expected: SchemaVersion) -> Vec<String> {
    current
        .iter()
        .filter(|group| group.id != expected)
        .flat_map(|group| group.servers.iter().cloned())
        .collect()
}
