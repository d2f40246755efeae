//! Typed client for the edge proxy's management API,
//! called from the coordinator side of the fence.
//!
//! The API only binds to `127.0.0.1:8080` on the remote host, so every call here is a `curl`
//! invocation executed over the host's SSH session
//! ([`HostExecutor::management_api_request`]) rather than a direct TCP
//! connection from the operator's machine — the same "reuse the one
//! channel you already trust" idiom the rest of the host executor follows.

use serde::{Deserialize, Serialize};

use crate::host::HostExecutor;
use crate::model::{CoreError, ErrorKind, RoutingEntry};

#[derive(Debug, Serialize)]
struct DeployRequest<'a> {
    host: &'a str,
    target: &'a str,
    project: &'a str,
    app: &'a str,
    health_path: &'a str,
    ssl: bool,
    ssl_redirect: bool,
    forward_headers: bool,
    response_timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct SwitchRequest<'a> {
    target: &'a str,
}

#[derive(Debug, Serialize)]
struct HealthRequest {
    healthy: bool,
}

#[derive(Debug, Serialize)]
struct StagingRequest {
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    staging: bool,
    hosts: Vec<RoutingEntry>,
}

/// The request shape for a first-time `deploy(...)` call.
pub struct DeployParams<'a> {
    pub host: &'a str,
    pub target: &'a str,
    pub project: &'a str,
    pub app: &'a str,
    pub health_path: &'a str,
    pub ssl: bool,
    pub ssl_redirect: bool,
    pub forward_headers: bool,
    pub response_timeout_secs: u64,
}

/// `curl` response split into a parsed HTTP status and raw body, since
/// `-w '\n%{http_code}'` is how the status is surfaced over the shell
/// (see [`HostExecutor::management_api_request`]).
fn split_status(raw_stdout: &str) -> (u16, &str) {
    match raw_stdout.rsplit_once('\n') {
        Some((body, code)) => (code.trim().parse().unwrap_or(0), body),
        None => (raw_stdout.trim().parse().unwrap_or(0), ""),
    }
}

fn expect_status(
    host_name: &str,
    operation: &str,
    raw_stdout: &str,
    expected: &[u16],
) -> Result<String, CoreError> {
    let (code, body) = split_status(raw_stdout);
    if !expected.contains(&code) {
        return Err(CoreError::new(
            ErrorKind::Transport,
            format!("host '{host_name}': management API {operation} returned HTTP {code}: {body}"),
        ));
    }
    Ok(body.to_string())
}

/// `POST /api/deploy` — upsert a routing entry.
pub async fn deploy(executor: &HostExecutor, management_port: u16, params: DeployParams<'_>) -> Result<(), CoreError> {
    let body = serde_json::to_string(&DeployRequest {
        host: params.host,
        target: params.target,
        project: params.project,
        app: params.app,
        health_path: params.health_path,
        ssl: params.ssl,
        ssl_redirect: params.ssl_redirect,
        forward_headers: params.forward_headers,
        response_timeout_secs: params.response_timeout_secs,
    })
    .expect("DeployRequest is always serializable");

    let output = executor
        .management_api_request(management_port, "POST", "/api/deploy", Some(&body))
        .await?;
    expect_status(&executor.host_name, "deploy", &output.stdout, &[200])?;
    Ok(())
}

/// `PATCH /api/hosts/:host` — atomic traffic switch.
pub async fn switch(executor: &HostExecutor, management_port: u16, host: &str, target: &str) -> Result<(), CoreError> {
    let body = serde_json::to_string(&SwitchRequest { target }).expect("SwitchRequest is always serializable");
    let path = format!("/api/hosts/{host}");
    let output = executor
        .management_api_request(management_port, "PATCH", &path, Some(&body))
        .await?;
    expect_status(&executor.host_name, "switch", &output.stdout, &[200])?;
    Ok(())
}

/// `PUT /api/hosts/:host/health` — used as the coordinator's explicit
/// pre-switch health gate.
pub async fn set_health(executor: &HostExecutor, management_port: u16, host: &str, healthy: bool) -> Result<(), CoreError> {
    let body = serde_json::to_string(&HealthRequest { healthy }).expect("HealthRequest is always serializable");
    let path = format!("/api/hosts/{host}/health");
    let output = executor
        .management_api_request(management_port, "PUT", &path, Some(&body))
        .await?;
    expect_status(&executor.host_name, "set_health", &output.stdout, &[200])?;
    Ok(())
}

/// `DELETE /api/hosts/:host`.
pub async fn remove_host(executor: &HostExecutor, management_port: u16, host: &str) -> Result<(), CoreError> {
    let path = format!("/api/hosts/{host}");
    let output = executor.management_api_request(management_port, "DELETE", &path, None).await?;
    expect_status(&executor.host_name, "remove_host", &output.stdout, &[200, 404])?;
    Ok(())
}

/// `PUT /api/staging`.
pub async fn set_staging(executor: &HostExecutor, management_port: u16, enabled: bool) -> Result<(), CoreError> {
    let body = serde_json::to_string(&StagingRequest { enabled }).expect("StagingRequest is always serializable");
    let output = executor
        .management_api_request(management_port, "PUT", "/api/staging", Some(&body))
        .await?;
    expect_status(&executor.host_name, "set_staging", &output.stdout, &[200])?;
    Ok(())
}

/// `GET /api/status[?host=]` — used both by `iop status` and by
/// the coordinator's `list_hosts`/`status` CLI subcommands.
pub async fn status(executor: &HostExecutor, management_port: u16, host: Option<&str>) -> Result<(bool, Vec<RoutingEntry>), CoreError> {
    let path = match host {
        Some(h) => format!("/api/status?host={h}"),
        None => "/api/status".to_string(),
    };
    let output = executor.management_api_request(management_port, "GET", &path, None).await?;
    let body = expect_status(&executor.host_name, "status", &output.stdout, &[200])?;
    let parsed: StatusResponse = serde_json::from_str(&body).map_err(|e| {
        CoreError::from_anyhow(ErrorKind::Transport, e.into(), format!("host '{}': parsing status response", executor.host_name))
    })?;
    Ok((parsed.staging, parsed.hosts))
}
