//! The catalog contract consumed by the migration orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleetschema_ledger::{CurrentVersionInformation, SchemaVersion};
use fleetschema_registry::CompatibleVersions;

use crate::error::{CatalogError, CatalogResult};

/// A version the catalog can serve, with where to fetch its scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableVersion {
    pub id: SchemaVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_uri: Option<String>,
}

/// Which script of a version a URI points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Snapshot,
    Diff,
}

impl ScriptKind {
    fn segment(&self) -> &'static str {
        match self {
            ScriptKind::Snapshot => "snapshot",
            ScriptKind::Diff => "diff",
        }
    }

    /// Relative URI of this script for `version`.
    pub fn uri(&self, version: SchemaVersion) -> String {
        format!("/schema/scripts/{version}/{}", self.segment())
    }

    /// Parse a URI produced by [`ScriptKind::uri`].
    pub fn parse_uri(uri: &str) -> CatalogResult<(SchemaVersion, ScriptKind)> {
        let invalid = || CatalogError::InvalidUri(uri.to_string());
        let rest = uri.strip_prefix("/schema/scripts/").ok_or_else(invalid)?;
        let (id, kind) = rest.split_once('/').ok_or_else(invalid)?;
        let version: SchemaVersion = id.parse().map_err(|_| invalid())?;
        let kind = match kind {
            "snapshot" => ScriptKind::Snapshot,
            "diff" => ScriptKind::Diff,
            _ => return Err(invalid()),
        };
        Ok((version, kind))
    }
}

#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Versions from the database's current one upward, ascending.
    async fn available_versions(&self) -> CatalogResult<Vec<AvailableVersion>>;

    /// Range every live instance supports; `None` when no instance is live.
    async fn compatibility(&self) -> CatalogResult<Option<CompatibleVersions>>;

    async fn current_versions(&self) -> CatalogResult<Vec<CurrentVersionInformation>>;

    /// Fetch a script by the URI advertised in [`AvailableVersion`].
    async fn script(&self, uri: &str) -> CatalogResult<String>;
}
