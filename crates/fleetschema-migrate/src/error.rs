//! Migration error types.

use fleetschema_catalog::CatalogError;
use fleetschema_core::RetryError;
use fleetschema_ledger::{LedgerError, SchemaVersion};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("schema version {requested} is not available (catalog offers {first}..={last})")]
    VersionNotAvailable {
        requested: SchemaVersion,
        first: SchemaVersion,
        last: SchemaVersion,
    },

    #[error("catalog has no {kind} script for version {version}")]
    ScriptUnavailable {
        version: SchemaVersion,
        kind: &'static str,
    },

    #[error("schema version {target} is incompatible with the fleet (compatible range [{min}, {max}])")]
    VersionIncompatible {
        target: SchemaVersion,
        min: SchemaVersion,
        max: SchemaVersion,
    },

    #[error("instances not yet on previous version {expected}: {}", .waiting.join(", "))]
    InstancesNotReady {
        expected: SchemaVersion,
        waiting: Vec<String>,
    },

    #[error("database {database} does not exist and the connected role may not create databases")]
    InsufficientPermissions { database: String },

    #[error("invalid database name {name:?}: {reason}")]
    InvalidDatabaseName { name: String, reason: String },

    #[error("no instance registered after {attempts} attempts")]
    NoRegisteredInstances { attempts: u32 },

    #[error("catalog reports current version {catalog} but the ledger is at {ledger}")]
    StaleCatalog {
        catalog: SchemaVersion,
        ledger: SchemaVersion,
    },

    #[error("script for version {version} failed: {message}")]
    ScriptExecution {
        version: SchemaVersion,
        message: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl MigrateError {
    /// Worth another attempt inside a retry loop.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, MigrateError::Catalog(e) if e.is_transient())
    }
}

impl From<RetryError<MigrateError>> for MigrateError {
    fn from(err: RetryError<MigrateError>) -> Self {
        err.into_inner().unwrap_or(MigrateError::Cancelled)
    }
}

impl From<RetryError<CatalogError>> for MigrateError {
    fn from(err: RetryError<CatalogError>) -> Self {
        err.into_inner()
            .map(MigrateError::Catalog)
            .unwrap_or(MigrateError::Cancelled)
    }
}

/// A script failure becomes `ScriptExecution`; anything else stays a ledger error.
pub(crate) fn from_execution(err: LedgerError) -> MigrateError {
    match err {
        LedgerError::Script { version, message } => MigrateError::ScriptExecution { version, message },
        other => MigrateError::Ledger(other),
    }
}

pub type MigrateResult<T> = Result<T, MigrateError>;
