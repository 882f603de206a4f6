//! fleetschema-migrate — moving the shared database between versions.
//!
//! [`BaseSchemaBootstrapper`] makes sure the database and its bookkeeping
//! exist before anything else touches them. [`MigrationOrchestrator`] then
//! walks the database from its current version to a target, one committed
//! transaction per version, refusing targets the live fleet cannot speak
//! and, unless forced, waiting for every live instance to catch up before
//! each step.
//!
//! Each applied version is announced as a [`SchemaUpgraded`] event.

pub mod bootstrap;
pub mod error;
pub mod events;
pub mod orchestrator;

pub use bootstrap::{BaseSchemaBootstrapper, validate_database_name};
pub use error::{MigrateError, MigrateResult};
pub use events::SchemaUpgraded;
pub use orchestrator::{
    ApplyOutcome, MigrationOptions, MigrationOrchestrator, MigrationPhase, TargetSelector,
};
