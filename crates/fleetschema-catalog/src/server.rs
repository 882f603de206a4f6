//! axum handlers exposing a catalog over HTTP.
//!
//! JSON routes reply with `{"success", "data", "error"}`; script routes
//! reply with the script body as `text/plain`.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::warn;

use fleetschema_ledger::{LedgerError, SchemaVersion};
use fleetschema_registry::RegistryError;

use crate::catalog::{SchemaCatalog, ScriptKind};
use crate::error::CatalogError;

/// Shared state for catalog handlers.
#[derive(Clone)]
pub struct CatalogState {
    pub catalog: Arc<dyn SchemaCatalog>,
}

#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> (StatusCode, Json<ApiResponse<()>>) {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn status_for(err: &CatalogError) -> StatusCode {
    match err {
        CatalogError::ScriptNotFound(_) => StatusCode::NOT_FOUND,
        CatalogError::InvalidUri(_) => StatusCode::BAD_REQUEST,
        CatalogError::Ledger(LedgerError::Connect(_))
        | CatalogError::Registry(RegistryError::Ledger(LedgerError::Connect(_))) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        e if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: CatalogError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "catalog request failed");
    }
    error_response(&err.to_string(), status).into_response()
}

/// GET /schema/versions
pub async fn list_versions(State(state): State<CatalogState>) -> Response {
    match state.catalog.available_versions().await {
        Ok(versions) => ApiResponse::ok(versions).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /schema/versions/current
pub async fn current_versions(State(state): State<CatalogState>) -> Response {
    match state.catalog.current_versions().await {
        Ok(current) => ApiResponse::ok(current).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /schema/compatibility
pub async fn compatibility(State(state): State<CatalogState>) -> Response {
    match state.catalog.compatibility().await {
        Ok(range) => ApiResponse::ok(range).into_response(),
        Err(e) => failure(e),
    }
}

async fn script(state: CatalogState, id: SchemaVersion, kind: ScriptKind) -> Response {
    match state.catalog.script(&kind.uri(id)).await {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response(),
        Err(e) => failure(e),
    }
}

/// GET /schema/scripts/{id}/snapshot
pub async fn snapshot_script(
    State(state): State<CatalogState>,
    Path(id): Path<SchemaVersion>,
) -> Response {
    script(state, id, ScriptKind::Snapshot).await
}

/// GET /schema/scripts/{id}/diff
pub async fn diff_script(
    State(state): State<CatalogState>,
    Path(id): Path<SchemaVersion>,
) -> Response {
    script(state, id, ScriptKind::Diff).await
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

/// Build the catalog router.
pub fn build_router(catalog: Arc<dyn SchemaCatalog>) -> Router {
    let state = CatalogState { catalog };

    let schema_routes = Router::new()
        .route("/versions", get(list_versions))
        .route("/versions/current", get(current_versions))
        .route("/compatibility", get(compatibility))
        .route("/scripts/{id}/snapshot", get(snapshot_script))
        .route("/scripts/{id}/diff", get(diff_script))
        .with_state(state);

    Router::new()
        .nest("/schema", schema_routes)
        .route("/healthz", get(healthz))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use fleetschema_ledger::{EmbeddedLedger, SchemaLedger, ScriptRunner};

    use super::*;
    use crate::library::ScriptLibrary;
    use crate::local::LocalCatalog;

    struct NoopRunner;

    #[async_trait]
    impl ScriptRunner for NoopRunner {
        async fn run(&self, _script: &str) -> Result<(), String> {
            Ok(())
        }
    }

    async fn test_state() -> CatalogState {
        let ledger = EmbeddedLedger::open_in_memory(Arc::new(NoopRunner)).unwrap();
        ledger.initialize_base_schema().await.unwrap();
        let library = ScriptLibrary::new().with_snapshot(1, "v1").with_diff(2, "to v2");
        CatalogState {
            catalog: Arc::new(LocalCatalog::new(library, Arc::new(ledger))),
        }
    }

    #[tokio::test]
    async fn list_versions_ok() {
        let resp = list_versions(State(test_state().await)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn compatibility_unknown_is_ok() {
        let resp = compatibility(State(test_state().await)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn script_is_text() {
        let resp = diff_script(State(test_state().await), Path(2)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn missing_script_is_404() {
        let resp = snapshot_script(State(test_state().await), Path(2)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn ledger_connect_errors_are_unavailable() {
        let err = CatalogError::Ledger(LedgerError::Connect("refused".into()));
        assert_eq!(status_for(&err), StatusCode::SERVICE_UNAVAILABLE);
        let err = CatalogError::Ledger(LedgerError::MissingBaseSchema);
        assert_eq!(status_for(&err), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
