//! Error kinds shared by the coordinator and the proxy.
//!
//! `ErrorKind` is the tag surfaced to operators (CLI summary line) and to
//! management-API clients (`{kind, message}` bodies, spec §6). `CoreError`
//! carries the tag plus an underlying `anyhow::Error` chain for logging,
//! mirroring the split the teacher keeps between a public message and a
//! logged source chain (`server/error.rs::ServerError`).

use std::fmt;

/// One of the seven error kinds the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any remote action (bad app/service config).
    Config,
    /// SSH/network I/O failure talking to a host.
    Transport,
    /// A remote `docker` invocation returned non-zero.
    Docker,
    /// A backend did not become ready within its deadline.
    HealthCheck,
    /// Certificate acquisition failed, possibly rate-limited.
    Acme,
    /// State-store snapshot write failed (logged, not fatal).
    Persistence,
    /// Duplicate deployment, reserved name, or port clash.
    Conflict,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::Transport => "transport",
            ErrorKind::Docker => "docker",
            ErrorKind::HealthCheck => "health_check",
            ErrorKind::Acme => "acme",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// A tagged error carrying the spec-§7 kind plus the full source chain.
///
/// Per spec §7, persistence failures degrade silently to best-effort and
/// must never abort a caller; callers that only want to log-and-continue
/// should match on `kind` rather than propagating this type with `?`.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_anyhow(kind: ErrorKind, source: anyhow::Error, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }
}

/// Extension trait mirroring the teacher's `ServerErrorExt`: convert any
/// `anyhow`-compatible error into a tagged `CoreError` at the call site.
pub trait CoreErrorExt<T> {
    fn tag(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, CoreError>;
}

impl<T, E> CoreErrorExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn tag(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, CoreError> {
        self.map_err(|e| CoreError::from_anyhow(kind, e.into(), message))
    }
}
