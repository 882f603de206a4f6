//! redb table definitions for the embedded ledger.
//!
//! Registrations are JSON-serialized into `&[u8]` value columns keyed by
//! instance name.

use redb::TableDefinition;

/// Bookkeeping markers. Presence of [`BASE_SCHEMA_KEY`] means the base
/// schema has been initialized.
pub const META: TableDefinition<&str, &str> = TableDefinition::new("meta");

/// version → status string.
pub const SCHEMA_VERSIONS: TableDefinition<i32, &str> = TableDefinition::new("schema_versions");

/// instance name → JSON `InstanceRegistration`.
pub const INSTANCE_SCHEMAS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("instance_schemas");

pub const BASE_SCHEMA_KEY: &str = "base_schema";
