//! In-process upgrade notifications.

use serde::Serialize;

use fleetschema_ledger::SchemaVersion;

/// Sent after a version has been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchemaUpgraded {
    pub version: SchemaVersion,
    /// The version was built from a full snapshot instead of a diff.
    pub is_full_snapshot: bool,
}

/// Buffered events per subscriber before slow receivers start lagging.
pub const EVENT_CAPACITY: usize = 64;
