//! Router: per-request host lookup, health gate, SSL-redirect,
//! and reverse-proxying with connection draining.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::model::CertificateState;
use crate::proxy::challenge;
use crate::proxy::state::StateStore;

const NOT_FOUND_BODY: &str = "404 not found\n";
const UNHEALTHY_BODY: &str = "503 service unavailable\n";
const BAD_GATEWAY_BODY: &str = "502 bad gateway\n";

/// A snapshot of the upstream to dial for one request, captured once at
/// lookup time. Because the snapshot is immutable for the lifetime of the
/// request, a request that began proxying to `T_old` keeps dialing
/// `T_old` even after a later `switch` rewrites the routing entry's
/// `target` — this is the whole of the draining mechanism: no explicit "drain" signal is needed.
#[derive(Clone)]
struct UpstreamHandle {
    target: String,
    client: reqwest::Client,
}

/// Per-hostname cache of the most recently resolved upstream, invalidated
/// (replaced) under a write lock whenever `target` changes.
#[derive(Default)]
pub struct UpstreamCache {
    entries: RwLock<HashMap<String, UpstreamHandle>>,
}

impl UpstreamCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get_or_create(&self, hostname: &str, target: &str) -> UpstreamHandle {
        {
            let read = self.entries.read().await;
            if let Some(handle) = read.get(hostname) {
                if handle.target == target {
                    return handle.clone();
                }
            }
        }

        let mut write = self.entries.write().await;
        if let Some(handle) = write.get(hostname) {
            if handle.target == target {
                return handle.clone();
            }
        }

        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("building reverse-proxy HTTP client");
        let handle = UpstreamHandle {
            target: target.to_string(),
            client,
        };
        write.insert(hostname.to_string(), handle.clone());
        handle
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Clone)]
pub struct RouterContext {
    pub state: Arc<StateStore>,
    pub upstreams: Arc<UpstreamCache>,
    pub https_port: u16,
}

/// Build the axum `Router` for the plaintext (port 80) listener: ACME
/// challenges, then SSL redirects / plain HTTP pass-through.
pub fn http_router(ctx: RouterContext, challenges: challenge::ChallengeStore) -> axum::Router {
    axum::Router::new()
        .merge(challenge::router(challenges))
        .fallback(axum::routing::any(http_fallback))
        .with_state(ctx)
}

/// Build the axum `Router` for the TLS-terminated (port 443) listener:
/// health gate + reverse proxy only (no redirect logic — the connection
/// already arrived over HTTPS).
pub fn https_router(ctx: RouterContext) -> axum::Router {
    axum::Router::new()
        .fallback(axum::routing::any(https_fallback))
        .with_state(ctx)
}

async fn http_fallback(State(ctx): State<RouterContext>, req: Request) -> Response {
    handle(&ctx, Scheme::Http, req).await
}

async fn https_fallback(State(ctx): State<RouterContext>, req: Request) -> Response {
    handle(&ctx, Scheme::Https, req).await
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::HOST)?.to_str().ok()?;
    Some(raw.split(':').next().unwrap_or(raw).to_string())
}

async fn handle(ctx: &RouterContext, scheme: Scheme, req: Request) -> Response {
    let Some(hostname) = host_header(req.headers()) else {
        return (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response();
    };

    // Step 2: host lookup.
    let Some(entry) = ctx.state.get(&hostname).await else {
        return (StatusCode::NOT_FOUND, NOT_FOUND_BODY).into_response();
    };

    // Step 3: SSL redirect, HTTP listener only. A certificate that has
    // fallen out of `Active` (renewal exhausted past its window) drops the
    // redirect so the host keeps serving over plain HTTP rather than
    // sending clients to a TLS listener with a stale or absent cert.
    let cert_active = entry
        .certificate
        .as_ref()
        .is_some_and(|c| c.state == CertificateState::Active);
    if scheme == Scheme::Http && entry.ssl_redirect && entry.ssl_enabled && cert_active {
        return redirect_to_https(&hostname, ctx.https_port, req.uri());
    }

    // Step 4: health gate — no upstream connection opened when unhealthy.
    if !entry.healthy {
        return (StatusCode::SERVICE_UNAVAILABLE, UNHEALTHY_BODY).into_response();
    }

    // Snapshot the target for this request only (draining mechanism).
    let handle = ctx.upstreams.get_or_create(&hostname, &entry.target).await;

    proxy_request(handle, entry.forward_headers, entry.response_timeout_secs, req).await
}

fn redirect_to_https(hostname: &str, https_port: u16, uri: &Uri) -> Response {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let authority = if https_port == 443 {
        hostname.to_string()
    } else {
        format!("{hostname}:{https_port}")
    };
    let location = format!("https://{authority}{path_and_query}");
    Redirect::permanent(&location).into_response()
}

async fn proxy_request(
    handle: UpstreamHandle,
    forward_headers: bool,
    response_timeout_secs: u64,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let client_ip = parts
        .extensions
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let url = format!("http://{}{path_and_query}", handle.target);

    let mut headers = parts.headers.clone();
    if forward_headers {
        apply_forwarding_headers(&mut headers, client_ip.as_deref());
    }
    // Preserve the client-supplied Host header to the backend.

    let body_stream = body.into_data_stream().map(|chunk| chunk.map_err(std::io::Error::other));
    let upstream_body = reqwest::Body::wrap_stream(body_stream);

    let request = handle
        .client
        .request(method, &url)
        .headers(headers)
        .body(upstream_body)
        .timeout(Duration::from_secs(response_timeout_secs));

    match request.send().await {
        Ok(resp) => stream_response(resp),
        Err(e) => {
            warn!(target = %handle.target, error = %e, "upstream request failed");
            (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response()
        }
    }
}

fn stream_response(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let headers = resp.headers().clone();
    let stream = resp.bytes_stream();
    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response())
}

fn apply_forwarding_headers(headers: &mut HeaderMap, client_ip: Option<&str>) {
    if let Some(ip) = client_ip {
        if let Ok(value) = HeaderValue::from_str(ip) {
            headers.insert(header::HeaderName::from_static("x-real-ip"), value.clone());

            let forwarded_for = match headers.get(header::HeaderName::from_static("x-forwarded-for")) {
                Some(existing) => format!("{}, {ip}", existing.to_str().unwrap_or_default()),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(header::HeaderName::from_static("x-forwarded-for"), value);
            }
        }
    }

    headers.insert(
        header::HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("https"),
    );

    if let Some(host) = headers.get(header::HOST).cloned() {
        headers.insert(header::HeaderName::from_static("x-forwarded-host"), host);
    }

    info!("forwarding headers applied");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CertificateStatus, RoutingEntry};

    fn entry(hostname: &str, healthy: bool, ssl_redirect: bool) -> RoutingEntry {
        RoutingEntry {
            hostname: hostname.to_string(),
            target: "myproj-web:3000".to_string(),
            project: "myproj".to_string(),
            app: "web".to_string(),
            health_path: "/up".to_string(),
            ssl_enabled: true,
            ssl_redirect,
            forward_headers: true,
            response_timeout_secs: 30,
            certificate: Some(CertificateStatus::pending()),
            healthy,
            last_health_check: None,
        }
    }

    async fn handle_http(entry: RoutingEntry) -> Response {
        let store = StateStore::new("/tmp/unused.json");
        store.upsert(entry).await;
        let ctx = RouterContext {
            state: Arc::new(store),
            upstreams: Arc::new(UpstreamCache::new()),
            https_port: 443,
        };
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "redirect.example.com")
            .body(Body::empty())
            .unwrap();
        handle(&ctx, Scheme::Http, req).await
    }

    #[tokio::test]
    async fn http_redirects_when_certificate_is_active() {
        let mut e = entry("redirect.example.com", true, true);
        e.certificate = Some(CertificateStatus {
            state: CertificateState::Active,
            ..CertificateStatus::pending()
        });
        let resp = handle_http(e).await;
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn http_redirect_suppressed_without_active_certificate() {
        // healthy=false so a suppressed redirect falls through to the
        // health gate instead of attempting a real upstream connection.
        let e = entry("redirect.example.com", false, true);
        let resp = handle_http(e).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn upstream_cache_snapshots_target_per_request() {
        let cache = UpstreamCache::new();
        let first = cache.get_or_create("example.com", "myproj-web-blue:3000").await;
        assert_eq!(first.target, "myproj-web-blue:3000");

        // Simulate an atomic switch: subsequent lookups see the new target...
        let second = cache.get_or_create("example.com", "myproj-web-green:3000").await;
        assert_eq!(second.target, "myproj-web-green:3000");

        // ...but the handle captured before the switch is untouched (drain).
        assert_eq!(first.target, "myproj-web-blue:3000");
    }

    #[test]
    fn redirect_preserves_path_and_query() {
        let uri: Uri = "/p?q=1".parse().unwrap();
        let resp = redirect_to_https("example.com", 443, &uri);
        let location = resp.headers().get(header::LOCATION).unwrap();
        assert_eq!(location, "https://example.com/p?q=1");
    }

    #[test]
    fn redirect_keeps_nonstandard_https_port() {
        let uri: Uri = "/".parse().unwrap();
        let resp = redirect_to_https("example.com", 8443, &uri);
        let location = resp.headers().get(header::LOCATION).unwrap();
        assert_eq!(location, "https://example.com:8443/");
    }

    #[tokio::test]
    async fn unhealthy_entry_gates_before_upstream() {
        let store = StateStore::new("/tmp/unused.json");
        store.upsert(entry("down.example.com", false, false)).await;
        let ctx = RouterContext {
            state: Arc::new(store),
            upstreams: Arc::new(UpstreamCache::new()),
            https_port: 443,
        };
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "down.example.com")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&ctx, Scheme::Https, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_host_is_404() {
        let store = StateStore::new("/tmp/unused.json");
        let ctx = RouterContext {
            state: Arc::new(store),
            upstreams: Arc::new(UpstreamCache::new()),
            https_port: 443,
        };
        let req = Request::builder()
            .uri("/")
            .header(header::HOST, "nowhere.example.com")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&ctx, Scheme::Https, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
