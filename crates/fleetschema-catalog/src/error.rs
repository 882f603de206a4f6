//! Catalog error types.

use fleetschema_ledger::LedgerError;
use fleetschema_registry::RegistryError;
use thiserror::Error;

/// Errors returned by catalog implementations.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot reach catalog at {uri}: {reason}")]
    Connect { uri: String, reason: String },

    #[error("catalog request to {0} timed out")]
    Timeout(String),

    #[error("catalog returned {status} for {uri}")]
    Status { status: u16, uri: String },

    #[error("invalid catalog response from {uri}: {reason}")]
    Decode { uri: String, reason: String },

    #[error("invalid catalog uri: {0}")]
    InvalidUri(String),

    #[error("no script at {0}")]
    ScriptNotFound(String),

    #[error("invalid script file name: {0}")]
    InvalidScriptName(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("failed to read scripts: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Connectivity failures worth retrying, e.g. while the catalog starts.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Connect { .. } | CatalogError::Timeout(_) => true,
            CatalogError::Status { status, .. } => *status == 503,
            _ => false,
        }
    }
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connectivity_is_transient() {
        let connect = CatalogError::Connect {
            uri: "http://x".into(),
            reason: "refused".into(),
        };
        assert!(connect.is_transient());
        assert!(CatalogError::Timeout("http://x".into()).is_transient());
        assert!(
            CatalogError::Status {
                status: 503,
                uri: "http://x".into()
            }
            .is_transient()
        );
        assert!(
            !CatalogError::Status {
                status: 404,
                uri: "http://x".into()
            }
            .is_transient()
        );
        assert!(!CatalogError::ScriptNotFound("/x".into()).is_transient());
    }
}
