//! Base schema bootstrap — the database and its bookkeeping must exist.
//!
//! Both operations are idempotent and run at the start of every migration.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleetschema_core::{RetryError, RetryPolicy};
use fleetschema_ledger::{DatabaseProvisioner, SchemaLedger};

use crate::error::{MigrateError, MigrateResult};

static DATABASE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("database name regex is valid")
});

const SYSTEM_DATABASES: &[&str] = &[
    "postgres", "template0", "template1", "master", "model", "msdb", "tempdb",
];

/// Reject names that are not plain SQL identifiers or that belong to the server.
pub fn validate_database_name(name: &str) -> MigrateResult<()> {
    let invalid = |reason: &str| MigrateError::InvalidDatabaseName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if !DATABASE_NAME.is_match(name) {
        return Err(invalid(
            "must start with a letter or underscore and contain at most 63 letters, digits or underscores",
        ));
    }
    if SYSTEM_DATABASES.iter().any(|s| s.eq_ignore_ascii_case(name)) {
        return Err(invalid("system databases cannot be managed"));
    }
    Ok(())
}

pub struct BaseSchemaBootstrapper {
    ledger: Arc<dyn SchemaLedger>,
    provisioner: Arc<dyn DatabaseProvisioner>,
    registration_retry: RetryPolicy,
}

impl BaseSchemaBootstrapper {
    pub fn new(ledger: Arc<dyn SchemaLedger>, provisioner: Arc<dyn DatabaseProvisioner>) -> Self {
        Self {
            ledger,
            provisioner,
            registration_retry: RetryPolicy::fixed(5, Duration::from_secs(2)),
        }
    }

    /// How long to wait for the first registration to land.
    pub fn with_registration_retry(mut self, policy: RetryPolicy) -> Self {
        self.registration_retry = policy;
        self
    }

    /// Create the database if needed (and allowed), then the bookkeeping.
    pub async fn ensure_base_schema_exists(&self) -> MigrateResult<()> {
        let database = self.provisioner.database_name();
        validate_database_name(database)?;

        if !self.provisioner.database_exists().await? {
            if !self.provisioner.can_create_database().await? {
                return Err(MigrateError::InsufficientPermissions {
                    database: database.to_string(),
                });
            }
            info!(database, "database missing, creating it");
            self.provisioner.create_database().await?;
        }

        if self.ledger.base_schema_exists().await? {
            debug!(database, "base schema present");
        } else {
            info!(database, "installing base schema");
            self.ledger.initialize_base_schema().await?;
        }
        Ok(())
    }

    /// Wait until at least one instance registration row exists.
    pub async fn ensure_instance_registration_exists(
        &self,
        shutdown: &watch::Receiver<bool>,
    ) -> MigrateResult<()> {
        let ledger = &self.ledger;
        let result = self
            .registration_retry
            .run(
                shutdown,
                |_: &MigrateError| true,
                move || async move {
                    if ledger.instance_registration_exists().await? {
                        Ok(())
                    } else {
                        Err(MigrateError::NoRegisteredInstances { attempts: 1 })
                    }
                },
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Cancelled) => Err(MigrateError::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                warn!(attempts, error = %last, "no instance registration appeared");
                match last {
                    MigrateError::NoRegisteredInstances { .. } => {
                        Err(MigrateError::NoRegisteredInstances { attempts })
                    }
                    other => Err(other),
                }
            }
            Err(RetryError::Aborted(e)) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use fleetschema_core::shutdown;
    use fleetschema_ledger::{
        EmbeddedLedger, LedgerResult, ScriptRunner, VersionRange,
    };

    use super::*;

    struct NoopRunner;

    #[async_trait]
    impl ScriptRunner for NoopRunner {
        async fn run(&self, _script: &str) -> Result<(), String> {
            Ok(())
        }
    }

    struct FakeProvisioner {
        name: String,
        exists: AtomicBool,
        may_create: bool,
        created: Mutex<u32>,
    }

    impl FakeProvisioner {
        fn new(name: &str, exists: bool, may_create: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                exists: AtomicBool::new(exists),
                may_create,
                created: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl DatabaseProvisioner for FakeProvisioner {
        fn database_name(&self) -> &str {
            &self.name
        }

        async fn database_exists(&self) -> LedgerResult<bool> {
            Ok(self.exists.load(Ordering::SeqCst))
        }

        async fn can_create_database(&self) -> LedgerResult<bool> {
            Ok(self.may_create)
        }

        async fn create_database(&self) -> LedgerResult<()> {
            *self.created.lock().unwrap() += 1;
            self.exists.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ledger() -> Arc<EmbeddedLedger> {
        Arc::new(EmbeddedLedger::open_in_memory(Arc::new(NoopRunner)).unwrap())
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(5))
    }

    #[test]
    fn database_names() {
        for ok in ["fleet", "_fleet", "Fleet_2", &"a".repeat(63)] {
            assert!(validate_database_name(ok).is_ok(), "{ok}");
        }
        for bad in [
            "",
            "2fleet",
            "fleet-db",
            "fleet; DROP DATABASE x",
            "fleet\"",
            &"a".repeat(64),
            "postgres",
            "TEMPDB",
            "Template1",
        ] {
            assert!(
                matches!(
                    validate_database_name(bad),
                    Err(MigrateError::InvalidDatabaseName { .. })
                ),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn creates_database_and_base_schema() {
        let ledger = ledger();
        let provisioner = FakeProvisioner::new("fleet", false, true);
        let bootstrapper = BaseSchemaBootstrapper::new(ledger.clone(), provisioner.clone());

        bootstrapper.ensure_base_schema_exists().await.unwrap();
        assert_eq!(*provisioner.created.lock().unwrap(), 1);
        assert!(ledger.base_schema_exists().await.unwrap());

        // Second run is a no-op.
        bootstrapper.ensure_base_schema_exists().await.unwrap();
        assert_eq!(*provisioner.created.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_database_without_permission() {
        let ledger = ledger();
        let provisioner = FakeProvisioner::new("fleet", false, false);
        let bootstrapper = BaseSchemaBootstrapper::new(ledger.clone(), provisioner);

        let err = bootstrapper.ensure_base_schema_exists().await.unwrap_err();
        assert!(matches!(err, MigrateError::InsufficientPermissions { .. }));
        assert!(!ledger.base_schema_exists().await.unwrap());
    }

    #[tokio::test]
    async fn invalid_name_touches_nothing() {
        let provisioner = FakeProvisioner::new("master", false, true);
        let bootstrapper = BaseSchemaBootstrapper::new(ledger(), provisioner.clone());

        assert!(bootstrapper.ensure_base_schema_exists().await.is_err());
        assert_eq!(*provisioner.created.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn registration_wait_gives_up() {
        let ledger = ledger();
        ledger.initialize_base_schema().await.unwrap();
        let bootstrapper =
            BaseSchemaBootstrapper::new(ledger, FakeProvisioner::new("fleet", true, false))
                .with_registration_retry(fast_retry());

        let err = bootstrapper
            .ensure_instance_registration_exists(&shutdown::never())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NoRegisteredInstances { attempts: 3 }));
    }

    #[tokio::test]
    async fn registration_wait_sees_late_registration() {
        let ledger = ledger();
        ledger.initialize_base_schema().await.unwrap();
        let bootstrapper = BaseSchemaBootstrapper::new(
            ledger.clone(),
            FakeProvisioner::new("fleet", true, false),
        )
        .with_registration_retry(RetryPolicy::fixed(50, Duration::from_millis(10)));

        let writer = ledger.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer
                .upsert_instance_registration(
                    "late",
                    VersionRange::new(1, 1).unwrap(),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        });

        bootstrapper
            .ensure_instance_registration_exists(&shutdown::never())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn registration_wait_is_cancellable() {
        let ledger = ledger();
        ledger.initialize_base_schema().await.unwrap();
        let bootstrapper =
            BaseSchemaBootstrapper::new(ledger, FakeProvisioner::new("fleet", true, false))
                .with_registration_retry(RetryPolicy::fixed(10, Duration::from_secs(60)));

        let (tx, rx) = watch::channel(false);
        let wait = tokio::spawn(async move {
            bootstrapper.ensure_instance_registration_exists(&rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(MigrateError::Cancelled)));
    }
}
