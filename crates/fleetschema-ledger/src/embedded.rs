//! EmbeddedLedger — redb-backed ledger.
//!
//! Version and registration rows live in a local redb file (or an
//! in-memory backend for tests). Migration scripts are not interpreted by
//! the ledger; they are handed to a [`ScriptRunner`] and the status row is
//! written once the runner has finished.
//!
//! Until [`SchemaLedger::initialize_base_schema`] runs, the ledger behaves
//! like a freshly created database: the current version reads as `0` and
//! writes fail with [`LedgerError::MissingBaseSchema`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableError};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::ledger::{DatabaseProvisioner, SchemaLedger, ScriptRunner};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `LedgerError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| LedgerError::$variant(e.to_string())
    };
}

/// Thread-safe ledger backed by redb.
#[derive(Clone)]
pub struct EmbeddedLedger {
    db: Arc<Database>,
    runner: Arc<dyn ScriptRunner>,
    name: String,
}

impl EmbeddedLedger {
    /// Open (or create) a ledger file at the given path.
    pub fn open(path: &Path, runner: Arc<dyn ScriptRunner>) -> LedgerResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "embedded".to_string());
        debug!(?path, "embedded ledger opened");
        Ok(Self {
            db: Arc::new(db),
            runner,
            name,
        })
    }

    /// Create an ephemeral in-memory ledger (for testing).
    pub fn open_in_memory(runner: Arc<dyn ScriptRunner>) -> LedgerResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        debug!("in-memory ledger opened");
        Ok(Self {
            db: Arc::new(db),
            runner,
            name: "memory".to_string(),
        })
    }

    fn has_base_schema(&self) -> LedgerResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let Some(table) = optional_table(txn.open_table(META))? else {
            return Ok(false);
        };
        Ok(table.get(BASE_SCHEMA_KEY).map_err(map_err!(Read))?.is_some())
    }

    fn require_base_schema(&self) -> LedgerResult<()> {
        if self.has_base_schema()? {
            Ok(())
        } else {
            Err(LedgerError::MissingBaseSchema)
        }
    }

    /// Store `status` for `version` unless the row is already completed.
    /// Returns false when the completed row was kept.
    fn write_status(&self, version: SchemaVersion, status: SchemaVersionStatus) -> LedgerResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let written;
        {
            let mut table = txn.open_table(SCHEMA_VERSIONS).map_err(map_err!(Table))?;
            let completed = table
                .get(version)
                .map_err(map_err!(Read))?
                .is_some_and(|guard| guard.value() == SchemaVersionStatus::Completed.as_str());
            written = !completed;
            if written {
                table
                    .insert(version, status.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if written {
            debug!(version, %status, "schema version status stored");
        } else {
            debug!(version, %status, "version already completed, status not stored");
        }
        Ok(written)
    }

    fn is_completed(&self, version: SchemaVersion) -> LedgerResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let Some(table) = optional_table(txn.open_table(SCHEMA_VERSIONS))? else {
            return Ok(false);
        };
        Ok(table
            .get(version)
            .map_err(map_err!(Read))?
            .is_some_and(|guard| guard.value() == SchemaVersionStatus::Completed.as_str()))
    }

    fn read_registrations(&self) -> LedgerResult<Vec<InstanceRegistration>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let Some(table) = optional_table(txn.open_table(INSTANCE_SCHEMAS))? else {
            return Ok(Vec::new());
        };
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let reg: InstanceRegistration =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(reg);
        }
        Ok(results)
    }
}

/// Treat a missing table as absent data rather than an error.
fn optional_table<T>(result: Result<T, TableError>) -> LedgerResult<Option<T>> {
    match result {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(LedgerError::Table(e.to_string())),
    }
}

fn max_completed<T: ReadableTable<i32, &'static str>>(table: &T) -> LedgerResult<SchemaVersion> {
    let mut current = 0;
    for entry in table.iter().map_err(map_err!(Read))? {
        let (version, status) = entry.map_err(map_err!(Read))?;
        if status.value() == SchemaVersionStatus::Completed.as_str() {
            current = current.max(version.value());
        }
    }
    Ok(current)
}

#[async_trait]
impl SchemaLedger for EmbeddedLedger {
    async fn current_schema_version(&self) -> LedgerResult<SchemaVersion> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        match optional_table(txn.open_table(SCHEMA_VERSIONS))? {
            Some(table) => max_completed(&table),
            None => Ok(0),
        }
    }

    async fn execute_script_and_complete_version(
        &self,
        script: &str,
        version: SchemaVersion,
        is_full_snapshot: bool,
    ) -> LedgerResult<()> {
        self.require_base_schema()?;
        if self.is_completed(version)? {
            info!(version, "version already completed, script skipped");
            return Ok(());
        }
        if !is_full_snapshot {
            self.write_status(version, SchemaVersionStatus::Started)?;
        }

        match self.runner.run(script).await {
            Ok(()) => {
                self.write_status(version, SchemaVersionStatus::Completed)?;
                debug!(version, is_full_snapshot, "script applied");
                Ok(())
            }
            Err(message) => {
                warn!(version, error = %message, "script failed, marking version failed");
                self.write_status(version, SchemaVersionStatus::Failed)?;
                Err(LedgerError::Script { version, message })
            }
        }
    }

    async fn delete_version_record(
        &self,
        version: SchemaVersion,
        status: SchemaVersionStatus,
    ) -> LedgerResult<bool> {
        self.require_base_schema()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(SCHEMA_VERSIONS).map_err(map_err!(Table))?;
            let matches = table
                .get(version)
                .map_err(map_err!(Read))?
                .is_some_and(|guard| guard.value() == status.as_str());
            removed = matches && table.remove(version).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(version, %status, removed, "schema version record deleted");
        Ok(removed)
    }

    async fn version_records(&self) -> LedgerResult<Vec<SchemaVersionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let Some(table) = optional_table(txn.open_table(SCHEMA_VERSIONS))? else {
            return Ok(Vec::new());
        };
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (version, status) = entry.map_err(map_err!(Read))?;
            results.push(SchemaVersionRecord {
                version: version.value(),
                status: status.value().parse()?,
            });
        }
        Ok(results)
    }

    async fn base_schema_exists(&self) -> LedgerResult<bool> {
        self.has_base_schema()
    }

    async fn initialize_base_schema(&self) -> LedgerResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SCHEMA_VERSIONS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCE_SCHEMAS).map_err(map_err!(Table))?;
        {
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            meta.insert(BASE_SCHEMA_KEY, "1").map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!("embedded base schema initialized");
        Ok(())
    }

    async fn instance_registration_exists(&self) -> LedgerResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        match optional_table(txn.open_table(INSTANCE_SCHEMAS))? {
            Some(table) => Ok(!table.is_empty().map_err(map_err!(Read))?),
            None => Ok(false),
        }
    }

    async fn upsert_instance_registration(
        &self,
        name: &str,
        supported: VersionRange,
        ttl: Duration,
    ) -> LedgerResult<SchemaVersion> {
        self.require_base_schema()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current;
        {
            let versions = txn.open_table(SCHEMA_VERSIONS).map_err(map_err!(Table))?;
            current = max_completed(&versions)?;
        }
        {
            let reg = InstanceRegistration {
                name: name.to_string(),
                min_supported_version: supported.min(),
                max_supported_version: supported.max(),
                current_version: current,
                expires_at: epoch_secs() + ttl.as_secs(),
            };
            let value = serde_json::to_vec(&reg).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(INSTANCE_SCHEMAS).map_err(map_err!(Table))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, current, "instance registration stored");
        Ok(current)
    }

    async fn delete_expired_registrations(&self) -> LedgerResult<u64> {
        self.require_base_schema()?;
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut deleted = 0;
        {
            let mut table = txn.open_table(INSTANCE_SCHEMAS).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let reg: InstanceRegistration =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if !reg.is_live(now) {
                    expired.push(key.value().to_string());
                }
            }
            for key in &expired {
                if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
                    deleted += 1;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if deleted > 0 {
            debug!(deleted, "expired registrations purged");
        }
        Ok(deleted)
    }

    async fn live_registrations(&self) -> LedgerResult<Vec<InstanceRegistration>> {
        let now = epoch_secs();
        let mut live: Vec<_> = self
            .read_registrations()?
            .into_iter()
            .filter(|r| r.is_live(now))
            .collect();
        live.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(live)
    }
}

/// The embedded ledger owns its storage, so the database always exists.
#[async_trait]
impl DatabaseProvisioner for EmbeddedLedger {
    fn database_name(&self) -> &str {
        &self.name
    }

    async fn database_exists(&self) -> LedgerResult<bool> {
        Ok(true)
    }

    async fn can_create_database(&self) -> LedgerResult<bool> {
        Ok(true)
    }

    async fn create_database(&self) -> LedgerResult<()> {
        Ok(())
    }
}
