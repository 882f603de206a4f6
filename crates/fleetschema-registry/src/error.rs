//! Registry error types.

use fleetschema_ledger::LedgerError;
use thiserror::Error;

/// Errors that can occur in the registrar or the resolver.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("registration of {name} failed after {attempts} attempts: {source}")]
    RegistrationFailed {
        name: String,
        attempts: u32,
        source: LedgerError,
    },

    #[error("cancelled")]
    Cancelled,
}

pub type RegistryResult<T> = Result<T, RegistryError>;
