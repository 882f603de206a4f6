//! Ledger traits.
//!
//! `SchemaLedger` is the storage contract shared by the registrar, the
//! compatibility resolver and the migration orchestrator. The orchestrator
//! only writes version rows; the registrar only writes registration rows.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LedgerResult;
use crate::types::*;

#[async_trait]
pub trait SchemaLedger: Send + Sync {
    /// Highest completed version, or `0` when nothing has completed yet or
    /// the bookkeeping routines do not exist.
    async fn current_schema_version(&self) -> LedgerResult<SchemaVersion>;

    /// Run `script` and mark `version` completed as one transaction.
    ///
    /// On failure the transaction is rolled back, `version` is marked
    /// failed and the script error is returned as `LedgerError::Script`.
    /// Diff scripts get a `started` row before the transaction begins; a
    /// full snapshot goes straight to its final status.
    ///
    /// A version that is already completed is left as is and the script is
    /// not run. A completed row is never overwritten.
    async fn execute_script_and_complete_version(
        &self,
        script: &str,
        version: SchemaVersion,
        is_full_snapshot: bool,
    ) -> LedgerResult<()>;

    /// Delete the row for `version` if it has `status`. Returns true if a row
    /// was removed.
    async fn delete_version_record(
        &self,
        version: SchemaVersion,
        status: SchemaVersionStatus,
    ) -> LedgerResult<bool>;

    /// All version rows, ascending.
    async fn version_records(&self) -> LedgerResult<Vec<SchemaVersionRecord>>;

    async fn base_schema_exists(&self) -> LedgerResult<bool>;

    /// Create the bookkeeping tables and routines. Idempotent.
    async fn initialize_base_schema(&self) -> LedgerResult<()>;

    /// Whether any registration row exists, live or not.
    async fn instance_registration_exists(&self) -> LedgerResult<bool>;

    /// Insert or refresh `name`'s registration with `expires_at = now + ttl`.
    ///
    /// The row's `current_version` is set to the ledger's current version,
    /// which is also returned.
    async fn upsert_instance_registration(
        &self,
        name: &str,
        supported: VersionRange,
        ttl: Duration,
    ) -> LedgerResult<SchemaVersion>;

    /// Remove every expired registration. Returns how many were removed.
    async fn delete_expired_registrations(&self) -> LedgerResult<u64>;

    /// Registrations that have not expired, ordered by name.
    async fn live_registrations(&self) -> LedgerResult<Vec<InstanceRegistration>>;

    async fn current_versions(&self) -> LedgerResult<Vec<CurrentVersionInformation>> {
        let registrations = self.live_registrations().await?;
        let records = self.version_records().await?;
        Ok(group_current_versions(&registrations, &records))
    }
}

/// Server-level operations needed before the target database exists.
#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    fn database_name(&self) -> &str;

    async fn database_exists(&self) -> LedgerResult<bool>;

    /// Whether the connected role may create databases.
    async fn can_create_database(&self) -> LedgerResult<bool>;

    async fn create_database(&self) -> LedgerResult<()>;
}

/// Executes migration scripts for ledgers that do not own the target
/// database connection.
///
/// Implementations run the whole script atomically or not at all.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run(&self, script: &str) -> Result<(), String>;
}
