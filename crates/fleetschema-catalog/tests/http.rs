//! Catalog server and client talking over a real socket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use fleetschema_catalog::{
    CatalogError, HttpCatalogClient, LocalCatalog, SchemaCatalog, ScriptLibrary, build_router,
};
use fleetschema_ledger::{EmbeddedLedger, SchemaLedger, ScriptRunner, VersionRange};
use fleetschema_registry::CompatibleVersions;

struct NoopRunner;

#[async_trait]
impl ScriptRunner for NoopRunner {
    async fn run(&self, _script: &str) -> Result<(), String> {
        Ok(())
    }
}

async fn catalog() -> (Arc<EmbeddedLedger>, Arc<LocalCatalog>) {
    let ledger = Arc::new(EmbeddedLedger::open_in_memory(Arc::new(NoopRunner)).unwrap());
    ledger.initialize_base_schema().await.unwrap();
    let library = ScriptLibrary::new()
        .with_snapshot(1, "CREATE TABLE a ();")
        .with_diff(2, "ALTER TABLE a ADD b int;");
    let catalog = Arc::new(LocalCatalog::new(library, ledger.clone()));
    (ledger, catalog)
}

async fn serve(catalog: Arc<LocalCatalog>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(catalog)).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn router_serves_versions_json() {
    let (_ledger, catalog) = catalog().await;
    let resp = build_router(catalog)
        .oneshot(Request::get("/schema/versions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["data"][0]["id"], 0);
    assert_eq!(json["data"][1]["snapshot_uri"], "/schema/scripts/1/snapshot");
    assert_eq!(json["data"][2]["diff_uri"], "/schema/scripts/2/diff");
}

#[tokio::test]
async fn router_rejects_non_numeric_ids() {
    let (_ledger, catalog) = catalog().await;
    let resp = build_router(catalog)
        .oneshot(
            Request::get("/schema/scripts/latest/diff")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn client_round_trip() {
    let (ledger, catalog) = catalog().await;
    let client = HttpCatalogClient::new(&serve(catalog).await).unwrap();

    let available = client.available_versions().await.unwrap();
    let ids: Vec<_> = available.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);

    let uri = available[2].diff_uri.clone().unwrap();
    assert_eq!(client.script(&uri).await.unwrap(), "ALTER TABLE a ADD b int;");
    assert!(matches!(
        client.script("/schema/scripts/2/snapshot").await,
        Err(CatalogError::ScriptNotFound(_))
    ));

    assert_eq!(client.compatibility().await.unwrap(), None);
    ledger
        .upsert_instance_registration(
            "web-1",
            VersionRange::new(1, 2).unwrap(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
    assert_eq!(
        client.compatibility().await.unwrap(),
        Some(CompatibleVersions { min: 1, max: 2 })
    );

    let current = client.current_versions().await.unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].id, 0);
    assert_eq!(current[0].servers, vec!["web-1".to_string()]);
}

#[tokio::test]
async fn unreachable_catalog_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = HttpCatalogClient::new(&format!("http://{addr}"))
        .unwrap()
        .with_timeout(Duration::from_secs(2));
    let err = client.available_versions().await.unwrap_err();
    assert!(err.is_transient(), "{err}");
}
