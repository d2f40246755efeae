//! Management API: loopback-only JSON control surface the
//! deployment coordinator drives during a deploy.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::model::{CertificateState, CertificateStatus, RoutingEntry};
use crate::proxy::acme::FailureBudget;
use crate::proxy::error::{ApiError, ApiErrorExt};
use crate::proxy::state::StateStore;
use crate::proxy::tls::CertResolver;

#[derive(Clone)]
pub struct ApiContext {
    pub state: Arc<StateStore>,
    pub acme_budget: Arc<FailureBudget>,
    /// `<statedir>/certs` — entries under `<certs_dir>/<hostname>/` are
    /// deleted when a routing entry is removed (spec §3: "a certificate
    /// ... deleted when the entry is removed").
    pub certs_dir: PathBuf,
    pub cert_resolver: Arc<CertResolver>,
}

pub fn router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/api/deploy", post(deploy))
        .route("/api/hosts", get(list_hosts))
        .route("/api/hosts/{host}", delete(remove_host).patch(switch_host))
        .route("/api/hosts/{host}/health", put(set_health))
        .route("/api/cert/renew/{host}", post(renew_cert))
        .route("/api/staging", put(set_staging))
        .route("/api/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn default_true() -> bool {
    true
}

fn default_response_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct DeployRequest {
    host: String,
    target: String,
    project: String,
    app: String,
    health_path: String,
    ssl: bool,
    #[serde(default = "default_true")]
    ssl_redirect: bool,
    #[serde(default = "default_true")]
    forward_headers: bool,
    #[serde(default = "default_response_timeout")]
    response_timeout_secs: u64,
}

/// `POST /api/deploy` — upsert a routing entry. Re-deploying an
/// existing hostname updates its target/health path in place rather than
/// resetting certificate progress.
async fn deploy(
    State(ctx): State<ApiContext>,
    Json(body): Json<DeployRequest>,
) -> Result<StatusCode, ApiError> {
    if body.host.trim().is_empty() {
        return Err(ApiError::bad_request("host must not be empty"));
    }

    let certificate = if body.ssl {
        match ctx.state.get(&body.host).await.and_then(|e| e.certificate) {
            Some(existing) => Some(existing),
            None => Some(CertificateStatus::pending()),
        }
    } else {
        None
    };

    let entry = RoutingEntry {
        hostname: body.host,
        target: body.target,
        project: body.project,
        app: body.app,
        health_path: body.health_path,
        ssl_enabled: body.ssl,
        ssl_redirect: body.ssl_redirect,
        forward_headers: body.forward_headers,
        response_timeout_secs: body.response_timeout_secs,
        certificate,
        healthy: false,
        last_health_check: None,
    };

    ctx.state.upsert(entry).await;
    Ok(StatusCode::OK)
}

/// `DELETE /api/hosts/:host` — removes the routing entry and, per spec §3
/// ("a certificate ... deleted when the entry is removed"), its
/// certificate files and cached SNI key.
async fn remove_host(
    State(ctx): State<ApiContext>,
    Path(host): Path<String>,
) -> Result<StatusCode, ApiError> {
    match ctx.state.remove(&host).await {
        Some(_) => {
            ctx.cert_resolver.evict(&host);
            let host_dir = ctx.certs_dir.join(&host);
            if let Err(e) = tokio::fs::remove_dir_all(&host_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(host, error = %e, dir = %host_dir.display(), "failed to remove certificate directory");
                }
            }
            Ok(StatusCode::OK)
        }
        None => Err(ApiError::not_found(format!("no routing entry for host '{host}'"))),
    }
}

/// `GET /api/hosts`.
async fn list_hosts(State(ctx): State<ApiContext>) -> Json<Vec<RoutingEntry>> {
    Json(ctx.state.list(None).await)
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    target: String,
}

/// `PATCH /api/hosts/:host` — atomic traffic switch.
async fn switch_host(
    State(ctx): State<ApiContext>,
    Path(host): Path<String>,
    Json(body): Json<SwitchRequest>,
) -> Result<Json<RoutingEntry>, ApiError> {
    ctx.state
        .switch(&host, &body.target)
        .await
        .map(Json)
        .map_err(|e| ApiError::not_found(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct HealthRequest {
    healthy: bool,
}

/// `PUT /api/hosts/:host/health` — used by the out-of-process
/// health checker and, in tests, to force a state transition directly.
async fn set_health(
    State(ctx): State<ApiContext>,
    Path(host): Path<String>,
    Json(body): Json<HealthRequest>,
) -> Result<StatusCode, ApiError> {
    ctx.state
        .update_health(&host, body.healthy)
        .await
        .map(|_| StatusCode::OK)
        .map_err(|e| ApiError::not_found(e.to_string()))
}

/// `POST /api/cert/renew/:host` — force a certificate back into
/// acquisition, bypassing the 30-day renewal window. 503 when
/// the hourly failure budget is already exhausted for this host.
async fn renew_cert(
    State(ctx): State<ApiContext>,
    Path(host): Path<String>,
) -> Result<StatusCode, ApiError> {
    let entry = ctx
        .state
        .get(&host)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no routing entry for host '{host}'")))?;

    if !entry.ssl_enabled {
        return Err(ApiError::bad_request("host does not have SSL enabled"));
    }

    if ctx.acme_budget.is_exhausted(&host, chrono::Utc::now()) {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            crate::model::ErrorKind::Acme,
            "hourly ACME failure budget exhausted for this host",
        ));
    }

    let mut cert = entry.certificate.unwrap_or_else(CertificateStatus::pending);
    cert.state = CertificateState::Acquiring;
    cert.attempt_count = 0;
    cert.next_attempt = None;
    ctx.state
        .set_certificate(&host, cert)
        .await
        .internal_err("persisting forced renewal state")?;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct StagingRequest {
    enabled: bool,
}

/// `PUT /api/staging` — toggles the ACME directory URL used by
/// the next acquisition attempt.
async fn set_staging(
    State(ctx): State<ApiContext>,
    Json(body): Json<StagingRequest>,
) -> StatusCode {
    ctx.state.set_staging(body.enabled).await;
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    host: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    staging: bool,
    hosts: Vec<RoutingEntry>,
}

/// `GET /api/status` / `GET /api/status?host=<h>`.
async fn status(
    State(ctx): State<ApiContext>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let staging = ctx.state.staging().await;
    let hosts = match query.host {
        Some(host) => {
            let entry = ctx
                .state
                .get(&host)
                .await
                .ok_or_else(|| ApiError::not_found(format!("no routing entry for host '{host}'")))?;
            vec![entry]
        }
        None => ctx.state.list(None).await,
    };
    Ok(Json(StatusResponse { staging, hosts }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn ctx() -> (ApiContext, tempfile::TempDir) {
        let certs_dir = tempfile::tempdir().unwrap();
        let api_ctx = ApiContext {
            state: Arc::new(StateStore::new("/tmp/iop-proxy-api-test.json")),
            acme_budget: Arc::new(FailureBudget::new(5)),
            certs_dir: certs_dir.path().to_path_buf(),
            cert_resolver: CertResolver::new(),
        };
        (api_ctx, certs_dir)
    }

    #[tokio::test]
    async fn deploy_then_list_round_trips() {
        let (ctx, _certs_dir) = ctx();
        let app = router(ctx);
        let body = serde_json::json!({
            "host": "example.com",
            "target": "myproj-web:3000",
            "project": "myproj",
            "app": "web",
            "health_path": "/up",
            "ssl": true
        });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/deploy")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::builder().uri("/api/hosts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let hosts: Vec<RoutingEntry> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].hostname, "example.com");
    }

    #[tokio::test]
    async fn switch_unknown_host_is_404() {
        let (ctx, _certs_dir) = ctx();
        let app = router(ctx);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("PATCH")
                    .uri("/api/hosts/nowhere.example.com")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"target":"x:1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    /// `remove_host` deletes the routing entry's certificate directory and
    /// evicts its cached SNI key, not just the in-memory entry (spec §3:
    /// "a certificate ... deleted when the entry is removed").
    #[tokio::test]
    async fn remove_host_deletes_certificate_directory() {
        let (ctx, certs_dir) = ctx();
        let host_dir = ctx.certs_dir.join("example.com");
        tokio::fs::create_dir_all(&host_dir).await.unwrap();
        tokio::fs::write(host_dir.join("cert.pem"), b"cert").await.unwrap();
        tokio::fs::write(host_dir.join("key.pem"), b"key").await.unwrap();

        let app = router(ctx);
        let body = serde_json::json!({
            "host": "example.com",
            "target": "myproj-web:3000",
            "project": "myproj",
            "app": "web",
            "health_path": "/up",
            "ssl": true
        });
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/deploy")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let resp = app
            .oneshot(Request::builder().method("DELETE").uri("/api/hosts/example.com").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!host_dir.exists());
        drop(certs_dir);
    }
}
