//! HTTP client for a remote catalog.
//!
//! Speaks plain HTTP/1.1 over a fresh TCP connection per request, the same
//! way the catalog's own health probes do. Responses use the catalog's JSON
//! envelope (`{"success": .., "data": .., "error": ..}`) except scripts,
//! which come back as text.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::Uri;
use http::header::{ACCEPT, HOST, USER_AGENT};
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use fleetschema_ledger::CurrentVersionInformation;
use fleetschema_registry::CompatibleVersions;

use crate::catalog::{AvailableVersion, SchemaCatalog};
use crate::error::{CatalogError, CatalogResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Where a request goes: TCP address, `Host` header and request path.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    address: String,
    host: String,
    path: String,
}

#[derive(Debug, Clone)]
pub struct HttpCatalogClient {
    base: Target,
    timeout: Duration,
}

impl HttpCatalogClient {
    /// `base_uri` is an `http://host[:port][/prefix]` URI.
    pub fn new(base_uri: &str) -> CatalogResult<Self> {
        let mut base = parse_target(base_uri)?;
        base.path = base.path.trim_end_matches('/').to_string();
        Ok(Self {
            base,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve a route or an advertised script URI against the base.
    fn target(&self, uri: &str) -> CatalogResult<Target> {
        if uri.starts_with('/') {
            Ok(Target {
                path: format!("{}{uri}", self.base.path),
                ..self.base.clone()
            })
        } else {
            parse_target(uri)
        }
    }

    async fn get(&self, uri: &str) -> CatalogResult<Bytes> {
        let target = self.target(uri)?;
        let display_uri = format!("http://{}{}", target.host, target.path);

        let result = tokio::time::timeout(self.timeout, async {
            let connect_err = |e: &dyn std::fmt::Display| CatalogError::Connect {
                uri: display_uri.clone(),
                reason: e.to_string(),
            };

            let stream = tokio::net::TcpStream::connect(target.address.as_str())
                .await
                .map_err(|e| connect_err(&e))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| connect_err(&e))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "catalog connection closed with error");
                }
            });

            let req = http::Request::builder()
                .method("GET")
                .uri(target.path.as_str())
                .header(HOST, target.host.as_str())
                .header(USER_AGENT, concat!("fleetschema/", env!("CARGO_PKG_VERSION")))
                .header(ACCEPT, "application/json, text/plain")
                .body(Empty::<Bytes>::new())
                .map_err(|e| CatalogError::InvalidUri(format!("{display_uri}: {e}")))?;

            let resp = sender.send_request(req).await.map_err(|e| connect_err(&e))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| connect_err(&e))?
                .to_bytes();

            if !status.is_success() {
                debug!(%status, uri = %display_uri, "catalog returned non-2xx");
                return Err(CatalogError::Status {
                    status: status.as_u16(),
                    uri: display_uri.clone(),
                });
            }
            Ok(body)
        })
        .await;

        match result {
            Ok(body) => body,
            Err(_) => {
                debug!(uri = %display_uri, "catalog request timed out");
                Err(CatalogError::Timeout(display_uri))
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> CatalogResult<T> {
        let body = self.get(uri).await?;
        decode_envelope(uri, &body)
    }
}

fn parse_target(uri: &str) -> CatalogResult<Target> {
    let invalid = |reason: &str| CatalogError::InvalidUri(format!("{uri}: {reason}"));
    let parsed: Uri = uri.parse().map_err(|_| invalid("not a uri"))?;

    match parsed.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(invalid(&format!("unsupported scheme {other}"))),
        None => return Err(invalid("missing scheme")),
    }
    let authority = parsed.authority().ok_or_else(|| invalid("missing host"))?;
    let port = authority.port_u16().unwrap_or(80);
    let path = parsed
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();

    Ok(Target {
        address: format!("{}:{port}", authority.host()),
        host: authority.as_str().to_string(),
        path,
    })
}

fn decode_envelope<T: DeserializeOwned>(uri: &str, body: &[u8]) -> CatalogResult<T> {
    let decode_err = |reason: String| CatalogError::Decode {
        uri: uri.to_string(),
        reason,
    };
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| decode_err(e.to_string()))?;
    if !envelope.success {
        return Err(decode_err(
            envelope.error.unwrap_or_else(|| "unsuccessful response".into()),
        ));
    }
    serde_json::from_value(envelope.data.unwrap_or(serde_json::Value::Null))
        .map_err(|e| decode_err(e.to_string()))
}

#[async_trait]
impl SchemaCatalog for HttpCatalogClient {
    async fn available_versions(&self) -> CatalogResult<Vec<AvailableVersion>> {
        self.get_json("/schema/versions").await
    }

    async fn compatibility(&self) -> CatalogResult<Option<CompatibleVersions>> {
        self.get_json("/schema/compatibility").await
    }

    async fn current_versions(&self) -> CatalogResult<Vec<CurrentVersionInformation>> {
        self.get_json("/schema/versions/current").await
    }

    async fn script(&self, uri: &str) -> CatalogResult<String> {
        let body = self.get(uri).await.map_err(|e| match e {
            CatalogError::Status { status: 404, uri } => CatalogError::ScriptNotFound(uri),
            other => other,
        })?;
        String::from_utf8(body.to_vec()).map_err(|e| CatalogError::Decode {
            uri: uri.to_string(),
            reason: e.to_string(),
        })
    }
}
