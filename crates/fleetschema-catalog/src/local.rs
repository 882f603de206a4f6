//! In-process catalog backed by a script library and the ledger.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fleetschema_ledger::{CurrentVersionInformation, SchemaLedger, SchemaVersion};
use fleetschema_registry::{CompatibilityResolver, CompatibleVersions};

use crate::catalog::{AvailableVersion, SchemaCatalog, ScriptKind};
use crate::error::{CatalogError, CatalogResult};
use crate::library::ScriptLibrary;

/// Serves versions from a [`ScriptLibrary`], reading the current version
/// and fleet state from the ledger on every call.
pub struct LocalCatalog {
    library: ScriptLibrary,
    ledger: Arc<dyn SchemaLedger>,
    resolver: CompatibilityResolver,
    max_version: Option<SchemaVersion>,
}

impl LocalCatalog {
    pub fn new(library: ScriptLibrary, ledger: Arc<dyn SchemaLedger>) -> Self {
        Self {
            library,
            resolver: CompatibilityResolver::new(ledger.clone()),
            ledger,
            max_version: None,
        }
    }

    /// Advertise nothing above `max`, even if the library has it.
    pub fn with_max_version(mut self, max: SchemaVersion) -> Self {
        self.max_version = Some(max);
        self
    }

    fn advertised_max(&self) -> SchemaVersion {
        let library_max = self.library.max_version().unwrap_or(0);
        match self.max_version {
            Some(cap) => library_max.min(cap),
            None => library_max,
        }
    }
}

#[async_trait]
impl SchemaCatalog for LocalCatalog {
    async fn available_versions(&self) -> CatalogResult<Vec<AvailableVersion>> {
        let current = self.ledger.current_schema_version().await?;
        let available = self.library.available_from(current, self.advertised_max());
        debug!(current, count = available.len(), "listed available versions");
        Ok(available)
    }

    async fn compatibility(&self) -> CatalogResult<Option<CompatibleVersions>> {
        Ok(self.resolver.compatible_range().await?)
    }

    async fn current_versions(&self) -> CatalogResult<Vec<CurrentVersionInformation>> {
        Ok(self.ledger.current_versions().await?)
    }

    async fn script(&self, uri: &str) -> CatalogResult<String> {
        let (version, kind) = ScriptKind::parse_uri(uri)?;
        if version > self.advertised_max() {
            return Err(CatalogError::ScriptNotFound(uri.to_string()));
        }
        self.library
            .script(version, kind)
            .map(str::to_string)
            .ok_or_else(|| CatalogError::ScriptNotFound(uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use fleetschema_ledger::{EmbeddedLedger, ScriptRunner, VersionRange};

    use super::*;

    struct NoopRunner;

    #[async_trait]
    impl ScriptRunner for NoopRunner {
        async fn run(&self, _script: &str) -> Result<(), String> {
            Ok(())
        }
    }

    async fn ledger() -> Arc<EmbeddedLedger> {
        let ledger = EmbeddedLedger::open_in_memory(Arc::new(NoopRunner)).unwrap();
        ledger.initialize_base_schema().await.unwrap();
        Arc::new(ledger)
    }

    fn library() -> ScriptLibrary {
        ScriptLibrary::new()
            .with_snapshot(1, "v1")
            .with_diff(2, "to v2")
            .with_diff(3, "to v3")
    }

    #[tokio::test]
    async fn available_versions_follow_the_ledger() {
        let ledger = ledger().await;
        let catalog = LocalCatalog::new(library(), ledger.clone());

        let ids: Vec<_> = catalog
            .available_versions()
            .await
            .unwrap()
            .iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        ledger
            .execute_script_and_complete_version("v1", 1, true)
            .await
            .unwrap();
        let available = catalog.available_versions().await.unwrap();
        assert_eq!(available[0].id, 1);
        assert_eq!(available.len(), 3);
    }

    #[tokio::test]
    async fn max_version_caps_listing_and_scripts() {
        let catalog = LocalCatalog::new(library(), ledger().await).with_max_version(2);

        let available = catalog.available_versions().await.unwrap();
        assert_eq!(available.last().map(|v| v.id), Some(2));
        assert!(matches!(
            catalog.script("/schema/scripts/3/diff").await,
            Err(CatalogError::ScriptNotFound(_))
        ));
        assert_eq!(catalog.script("/schema/scripts/2/diff").await.unwrap(), "to v2");
    }

    #[tokio::test]
    async fn missing_script_is_not_found() {
        let catalog = LocalCatalog::new(library(), ledger().await);
        assert!(matches!(
            catalog.script("/schema/scripts/2/snapshot").await,
            Err(CatalogError::ScriptNotFound(_))
        ));
        assert!(matches!(
            catalog.script("/elsewhere").await,
            Err(CatalogError::InvalidUri(_))
        ));
    }

    #[tokio::test]
    async fn compatibility_reflects_live_registrations() {
        let ledger = ledger().await;
        let catalog = LocalCatalog::new(library(), ledger.clone());
        assert_eq!(catalog.compatibility().await.unwrap(), None);

        let ttl = Duration::from_secs(60);
        ledger
            .upsert_instance_registration("a", VersionRange::new(1, 3).unwrap(), ttl)
            .await
            .unwrap();
        ledger
            .upsert_instance_registration("b", VersionRange::new(2, 4).unwrap(), ttl)
            .await
            .unwrap();

        assert_eq!(
            catalog.compatibility().await.unwrap(),
            Some(CompatibleVersions { min: 2, max: 3 })
        );
        let current = catalog.current_versions().await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].servers, vec!["a".to_string(), "b".to_string()]);
    }
}
