//! Compatibility resolver — the version range the whole fleet can speak.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use fleetschema_ledger::{InstanceRegistration, SchemaLedger, SchemaVersion};

use crate::error::RegistryResult;

/// Intersection of the supported ranges of all live instances.
///
/// `min > max` means the live instances share no version at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibleVersions {
    pub min: SchemaVersion,
    pub max: SchemaVersion,
}

impl CompatibleVersions {
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn allows(&self, version: SchemaVersion) -> bool {
        (self.min..=self.max).contains(&version)
    }
}

/// Intersect the advertised ranges. `None` when there is nothing to intersect.
pub fn intersect(registrations: &[InstanceRegistration]) -> Option<CompatibleVersions> {
    registrations.iter().fold(None, |acc, reg| {
        let (min, max) = (reg.min_supported_version, reg.max_supported_version);
        Some(match acc {
            None => CompatibleVersions { min, max },
            Some(c) => CompatibleVersions {
                min: c.min.max(min),
                max: c.max.min(max),
            },
        })
    })
}

/// Read-only view over live registrations.
#[derive(Clone)]
pub struct CompatibilityResolver {
    ledger: Arc<dyn SchemaLedger>,
}

impl CompatibilityResolver {
    pub fn new(ledger: Arc<dyn SchemaLedger>) -> Self {
        Self { ledger }
    }

    /// The fleet-wide compatible range, or `None` when no instance is live.
    ///
    /// `None` is "unknown", not an error: callers decide how cautious to be.
    pub async fn compatible_range(&self) -> RegistryResult<Option<CompatibleVersions>> {
        let live = self.ledger.live_registrations().await?;
        let range = intersect(&live);
        debug!(live = live.len(), ?range, "computed compatible range");
        Ok(range)
    }
}
