//! Ledger row types.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub use fleetschema_core::{SchemaVersion, VersionRange};

use crate::error::LedgerError;

/// Status of one attempt at a schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaVersionStatus {
    Started,
    Completed,
    Failed,
}

impl SchemaVersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersionStatus::Started => "started",
            SchemaVersionStatus::Completed => "completed",
            SchemaVersionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SchemaVersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchemaVersionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(SchemaVersionStatus::Started),
            "completed" => Ok(SchemaVersionStatus::Completed),
            "failed" => Ok(SchemaVersionStatus::Failed),
            other => Err(LedgerError::UnknownStatus(other.to_string())),
        }
    }
}

/// The ledger's record of a schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionRecord {
    pub version: SchemaVersion,
    pub status: SchemaVersionStatus,
}

/// A TTL-bound advertisement of one instance's supported version range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRegistration {
    pub name: String,
    pub min_supported_version: SchemaVersion,
    pub max_supported_version: SchemaVersion,
    /// Database version observed at the instance's last heartbeat.
    pub current_version: SchemaVersion,
    /// Unix timestamp (seconds) after which the row is logically absent.
    pub expires_at: u64,
}

impl InstanceRegistration {
    pub fn is_live(&self, now: u64) -> bool {
        self.expires_at > now
    }
}

/// Live instances grouped by the database version they last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentVersionInformation {
    pub id: SchemaVersion,
    /// Ledger status of `id`, if the ledger has a row for it.
    pub status: Option<SchemaVersionStatus>,
    pub servers: Vec<String>,
}

/// Build the current-version view from live registrations and version rows.
///
/// Output is ordered by version; server names within a group by name.
pub fn group_current_versions(
    registrations: &[InstanceRegistration],
    records: &[SchemaVersionRecord],
) -> Vec<CurrentVersionInformation> {
    let mut groups: BTreeMap<SchemaVersion, Vec<String>> = BTreeMap::new();
    for reg in registrations {
        groups
            .entry(reg.current_version)
            .or_default()
            .push(reg.name.clone());
    }

    groups
        .into_iter()
        .map(|(id, mut servers)| {
            servers.sort();
            let status = records.iter().find(|r| r.version == id).map(|r| r.status);
            CurrentVersionInformation {
                id,
                status,
                servers,
            }
        })
        .collect()
}

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(name: &str, current: SchemaVersion) -> InstanceRegistration {
        InstanceRegistration {
            name: name.to_string(),
            min_supported_version: 1,
            max_supported_version: 5,
            current_version: current,
            expires_at: u64::MAX,
        }
    }

    #[test]
    fn status_parses_and_displays() {
        for status in [
            SchemaVersionStatus::Started,
            SchemaVersionStatus::Completed,
            SchemaVersionStatus::Failed,
        ] {
            let parsed: SchemaVersionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("done".parse::<SchemaVersionStatus>().is_err());
    }

    #[test]
    fn registration_liveness_is_strict() {
        let mut r = reg("a", 1);
        r.expires_at = 100;
        assert!(r.is_live(99));
        assert!(!r.is_live(100));
    }

    #[test]
    fn groups_by_current_version() {
        let regs = vec![reg("web-2", 3), reg("web-1", 3), reg("worker", 2)];
        let records = vec![
            SchemaVersionRecord {
                version: 2,
                status: SchemaVersionStatus::Completed,
            },
            SchemaVersionRecord {
                version: 3,
                status: SchemaVersionStatus::Completed,
            },
        ];

        let groups = group_current_versions(&regs, &records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].id, 2);
        assert_eq!(groups[0].servers, vec!["worker"]);
        assert_eq!(groups[1].id, 3);
        assert_eq!(groups[1].servers, vec!["web-1", "web-2"]);
        assert_eq!(groups[1].status, Some(SchemaVersionStatus::Completed));
    }

    #[test]
    fn group_without_record_has_no_status() {
        let groups = group_current_versions(&[reg("a", 0)], &[]);
        assert_eq!(groups[0].status, None);
    }
}
