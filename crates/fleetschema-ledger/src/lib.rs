//! fleetschema-ledger — durable bookkeeping for fleet schema migrations.
//!
//! The ledger holds two kinds of rows:
//!
//! - one status row per schema version (`started`, `completed`, `failed`),
//!   written by the migration orchestrator;
//! - one TTL-bound registration row per running instance, written by that
//!   instance's heartbeat.
//!
//! # Backends
//!
//! - [`PostgresLedger`] keeps both tables in the target database itself and
//!   runs migration scripts inside a Postgres transaction.
//! - [`EmbeddedLedger`] keeps them in a redb file (or in memory, for tests)
//!   and hands scripts to a [`ScriptRunner`].

pub mod embedded;
pub mod error;
pub mod ledger;
pub mod postgres;
mod tables;
pub mod types;

pub use embedded::EmbeddedLedger;
pub use error::{LedgerError, LedgerResult};
pub use ledger::{DatabaseProvisioner, SchemaLedger, ScriptRunner};
pub use postgres::PostgresLedger;
pub use types::*;
