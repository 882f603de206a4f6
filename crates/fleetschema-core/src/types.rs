//! Shared types used across fleetschema crates.

use serde::{Deserialize, Serialize};

/// A schema version number. `0` means no version has ever completed.
pub type SchemaVersion = i32;

/// The inclusive range of schema versions an instance build can run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawVersionRange")]
pub struct VersionRange {
    min: SchemaVersion,
    max: SchemaVersion,
}

#[derive(Deserialize)]
struct RawVersionRange {
    min: SchemaVersion,
    max: SchemaVersion,
}

impl TryFrom<RawVersionRange> for VersionRange {
    type Error = String;

    fn try_from(raw: RawVersionRange) -> Result<Self, Self::Error> {
        VersionRange::new(raw.min, raw.max)
    }
}

impl VersionRange {
    /// Build a range, rejecting `min > max` and non-positive bounds.
    pub fn new(min: SchemaVersion, max: SchemaVersion) -> Result<Self, String> {
        if min < 1 {
            return Err(format!("minimum supported version must be positive, got {min}"));
        }
        if min > max {
            return Err(format!(
                "minimum supported version {min} is greater than maximum {max}"
            ));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> SchemaVersion {
        self.min
    }

    pub fn max(&self) -> SchemaVersion {
        self.max
    }

    pub fn contains(&self, version: SchemaVersion) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

impl std::fmt::Display for VersionRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
