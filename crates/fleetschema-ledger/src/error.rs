//! Error types for the version ledger.

use fleetschema_core::SchemaVersion;
use thiserror::Error;

/// Result type alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to connect to database: {0}")]
    Connect(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("base schema has not been created yet")]
    MissingBaseSchema,

    #[error("script for version {version} failed: {message}")]
    Script {
        version: SchemaVersion,
        message: String,
    },

    #[error("invalid connection settings: {0}")]
    Config(String),

    #[error("failed to open ledger: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("unknown schema version status: {0:?}")]
    UnknownStatus(String),
}
