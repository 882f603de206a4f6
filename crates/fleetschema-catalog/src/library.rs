//! Script library — snapshot and diff scripts per version.
//!
//! On disk a library is a flat directory:
//!
//! ```text
//! schema/
//!   1.sql        snapshot of version 1
//!   2.sql        snapshot of version 2
//!   2.diff.sql   1 → 2
//!   3.diff.sql   2 → 3
//! ```
//!
//! Other files are ignored.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};

use fleetschema_ledger::SchemaVersion;

use crate::catalog::{AvailableVersion, ScriptKind};
use crate::error::{CatalogError, CatalogResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VersionScripts {
    snapshot: Option<String>,
    diff: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptLibrary {
    versions: BTreeMap<SchemaVersion, VersionScripts>,
}

impl ScriptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(mut self, version: SchemaVersion, script: &str) -> Self {
        self.insert(version, ScriptKind::Snapshot, script.to_string());
        self
    }

    pub fn with_diff(mut self, version: SchemaVersion, script: &str) -> Self {
        self.insert(version, ScriptKind::Diff, script.to_string());
        self
    }

    pub fn insert(&mut self, version: SchemaVersion, kind: ScriptKind, script: String) {
        let entry = self.versions.entry(version).or_default();
        match kind {
            ScriptKind::Snapshot => entry.snapshot = Some(script),
            ScriptKind::Diff => entry.diff = Some(script),
        }
    }

    /// Load every `{id}.sql` and `{id}.diff.sql` file in `dir`.
    pub fn load_dir(dir: &Path) -> CatalogResult<Self> {
        let mut library = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((version, kind)) = parse_file_name(file_name)? else {
                debug!(file = %file_name, "skipping non-script file");
                continue;
            };
            let script = std::fs::read_to_string(&path)?;
            library.insert(version, kind, script);
        }
        info!(
            dir = %dir.display(),
            versions = library.versions.len(),
            max = ?library.max_version(),
            "script library loaded"
        );
        Ok(library)
    }

    pub fn max_version(&self) -> Option<SchemaVersion> {
        self.versions.keys().next_back().copied()
    }

    pub fn script(&self, version: SchemaVersion, kind: ScriptKind) -> Option<&str> {
        let entry = self.versions.get(&version)?;
        match kind {
            ScriptKind::Snapshot => entry.snapshot.as_deref(),
            ScriptKind::Diff => entry.diff.as_deref(),
        }
    }

    /// Versions `current..=max`, ascending, with `current` always first.
    ///
    /// Stops at the first gap so callers never see a version they could
    /// only reach by skipping one.
    pub fn available_from(&self, current: SchemaVersion, max: SchemaVersion) -> Vec<AvailableVersion> {
        let mut available = vec![self.available_version(current)];
        for version in (current + 1)..=max {
            if !self.versions.contains_key(&version) {
                break;
            }
            available.push(self.available_version(version));
        }
        available
    }

    fn available_version(&self, version: SchemaVersion) -> AvailableVersion {
        let uri = |kind: ScriptKind| self.script(version, kind).map(|_| kind.uri(version));
        AvailableVersion {
            id: version,
            snapshot_uri: uri(ScriptKind::Snapshot),
            diff_uri: uri(ScriptKind::Diff),
        }
    }
}

/// `12.sql` → snapshot 12, `12.diff.sql` → diff 12, anything else → None.
fn parse_file_name(name: &str) -> CatalogResult<Option<(SchemaVersion, ScriptKind)>> {
    let Some(stem) = name.strip_suffix(".sql") else {
        return Ok(None);
    };
    let (id, kind) = match stem.strip_suffix(".diff") {
        Some(id) => (id, ScriptKind::Diff),
        None => (stem, ScriptKind::Snapshot),
    };
    if !id.chars().all(|c| c.is_ascii_digit()) || id.is_empty() {
        return Ok(None);
    }
    let version: SchemaVersion = id
        .parse()
        .map_err(|_| CatalogError::InvalidScriptName(name.to_string()))?;
    if version < 1 {
        return Err(CatalogError::InvalidScriptName(name.to_string()));
    }
    Ok(Some((version, kind)))
}
