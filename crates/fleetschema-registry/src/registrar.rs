//! Instance registrar — keeps this process's registration alive.
//!
//! On start the registrar upserts its registration, retrying because the
//! ledger tables may not exist yet on a freshly bootstrapped database. It
//! then heartbeats on a fixed interval: each tick refreshes the lease and
//! purges expired registrations left behind by instances that went away
//! without deregistering.
//!
//! The database version observed on each heartbeat is published on a
//! `watch` channel so callers can gate behaviour on it without querying the
//! database per request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleetschema_core::shutdown::wait_for_shutdown;
use fleetschema_core::{RetryError, RetryPolicy};
use fleetschema_ledger::{SchemaLedger, SchemaVersion, VersionRange};

use crate::error::{RegistryError, RegistryResult};

/// Result of one heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOutcome {
    /// Database version recorded with this instance's registration.
    pub current_version: SchemaVersion,
    /// Expired registrations removed during this tick.
    pub purged: u64,
}

/// Heartbeat loop for one instance.
pub struct InstanceRegistrar {
    ledger: Arc<dyn SchemaLedger>,
    name: String,
    supported: VersionRange,
    heartbeat_interval: Duration,
    lease_ttl: Duration,
    registration_retry: RetryPolicy,
}

impl InstanceRegistrar {
    pub fn new(ledger: Arc<dyn SchemaLedger>, name: &str, supported: VersionRange) -> Self {
        Self {
            ledger,
            name: name.to_string(),
            supported,
            heartbeat_interval: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(120),
            registration_retry: RetryPolicy::fixed(5, Duration::from_secs(2)),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// How long a registration stays live without a heartbeat.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_registration_retry(mut self, policy: RetryPolicy) -> Self {
        self.registration_retry = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supported(&self) -> VersionRange {
        self.supported
    }

    /// Upsert this instance's registration, retrying on any ledger error.
    pub async fn register(&self, shutdown: &watch::Receiver<bool>) -> RegistryResult<SchemaVersion> {
        let result = self
            .registration_retry
            .run(shutdown, |_| true, || {
                self.ledger
                    .upsert_instance_registration(&self.name, self.supported, self.lease_ttl)
            })
            .await;

        match result {
            Ok(current) => {
                info!(
                    name = %self.name,
                    supported = %self.supported,
                    current,
                    "instance registered"
                );
                Ok(current)
            }
            Err(RetryError::Cancelled) => Err(RegistryError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => Err(RegistryError::RegistrationFailed {
                name: self.name.clone(),
                attempts,
                source: last,
            }),
            Err(RetryError::Aborted(e)) => Err(e.into()),
        }
    }

    /// One heartbeat: refresh the lease, then purge expired registrations.
    pub async fn tick(&self) -> RegistryResult<HeartbeatOutcome> {
        let current_version = self
            .ledger
            .upsert_instance_registration(&self.name, self.supported, self.lease_ttl)
            .await?;
        let purged = self.ledger.delete_expired_registrations().await?;
        debug!(name = %self.name, current_version, purged, "heartbeat");
        Ok(HeartbeatOutcome {
            current_version,
            purged,
        })
    }

    /// Register, then heartbeat until shutdown.
    ///
    /// Every observed database version is sent on `current`. Tick failures
    /// are logged and the loop carries on.
    pub async fn run(&self, current: watch::Sender<SchemaVersion>, mut shutdown: watch::Receiver<bool>) {
        match self.register(&shutdown).await {
            Ok(version) => {
                current.send_replace(version);
            }
            Err(RegistryError::Cancelled) => {
                info!(name = %self.name, "registrar cancelled before registering");
                return;
            }
            Err(e) => {
                // Later ticks keep trying; the lease simply starts late.
                error!(name = %self.name, error = %e, "initial registration failed");
            }
        }

        info!(name = %self.name, interval = ?self.heartbeat_interval, "heartbeat loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.heartbeat_interval) => {
                    match self.tick().await {
                        Ok(outcome) => {
                            let previous = current.send_replace(outcome.current_version);
                            if previous != outcome.current_version {
                                info!(
                                    name = %self.name,
                                    from = previous,
                                    to = outcome.current_version,
                                    "observed schema version change"
                                );
                            }
                            if outcome.purged > 0 {
                                info!(purged = outcome.purged, "purged expired registrations");
                            }
                        }
                        Err(e) => {
                            warn!(name = %self.name, error = %e, "heartbeat failed");
                        }
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!(name = %self.name, "heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    /// Run the heartbeat loop on a background task.
    ///
    /// Returns the task handle and a receiver for the observed version,
    /// which starts at `0` until the first registration lands.
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (JoinHandle<()>, watch::Receiver<SchemaVersion>) {
        let (current_tx, current_rx) = watch::channel(0);
        let handle = tokio::spawn(async move {
            self.run(current_tx, shutdown).await;
        });
        (handle, current_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleetschema_core::shutdown::never;
    use fleetschema_ledger::{EmbeddedLedger, ScriptRunner};

    struct NoopRunner;

    #[async_trait]
    impl ScriptRunner for NoopRunner {
        async fn run(&self, _script: &str) -> Result<(), String> {
            Ok(())
        }
    }

    fn test_ledger() -> Arc<EmbeddedLedger> {
        Arc::new(EmbeddedLedger::open_in_memory(Arc::new(NoopRunner)).unwrap())
    }

    fn range() -> VersionRange {
        VersionRange::new(1, 3).unwrap()
    }

    fn fast_registrar(ledger: Arc<EmbeddedLedger>, name: &str) -> InstanceRegistrar {
        InstanceRegistrar::new(ledger, name, range())
            .with_heartbeat_interval(Duration::from_millis(10))
            .with_registration_retry(RetryPolicy::fixed(3, Duration::from_millis(5)))
    }

    #[tokio::test]
    async fn register_fails_without_base_schema() {
        let ledger = test_ledger();
        let registrar = fast_registrar(ledger, "api-1");
        let err = registrar.register(&never()).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::RegistrationFailed { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn register_succeeds_once_base_schema_lands() {
        let ledger = test_ledger();
        let registrar = InstanceRegistrar::new(ledger.clone(), "api-1", range())
            .with_registration_retry(RetryPolicy::fixed(50, Duration::from_millis(5)));

        let bootstrapper = ledger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bootstrapper.initialize_base_schema().await.unwrap();
        });

        assert_eq!(registrar.register(&never()).await.unwrap(), 0);
        assert!(ledger.instance_registration_exists().await.unwrap());
    }

    #[tokio::test]
    async fn tick_refreshes_and_purges() {
        let ledger = test_ledger();
        ledger.initialize_base_schema().await.unwrap();

        // A peer whose lease has already run out.
        ledger
            .upsert_instance_registration("gone", range(), Duration::ZERO)
            .await
            .unwrap();
        ledger
            .execute_script_and_complete_version("CREATE TABLE a ();", 1, true)
            .await
            .unwrap();

        let registrar = fast_registrar(ledger.clone(), "api-1");
        let outcome = registrar.tick().await.unwrap();
        assert_eq!(
            outcome,
            HeartbeatOutcome {
                current_version: 1,
                purged: 1
            }
        );

        let live = ledger.live_registrations().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "api-1");
    }

    #[tokio::test]
    async fn run_publishes_version_and_stops_on_shutdown() {
        let ledger = test_ledger();
        ledger.initialize_base_schema().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mut current) = fast_registrar(ledger.clone(), "api-1").spawn(shutdown_rx);

        ledger
            .execute_script_and_complete_version("CREATE TABLE a ();", 2, true)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), current.wait_for(|v| *v == 2))
            .await
            .unwrap()
            .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_survives_tick_failures() {
        // No base schema: registration and every tick fail, the loop lives on.
        let ledger = test_ledger();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registrar = InstanceRegistrar::new(ledger, "api-1", range())
            .with_heartbeat_interval(Duration::from_millis(5))
            .with_registration_retry(RetryPolicy::once());
        let (handle, current) = registrar.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!handle.is_finished());
        assert_eq!(*current.borrow(), 0);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
