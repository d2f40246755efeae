//! Project / App / Service / Release data model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_replicas() -> u32 {
    1
}

fn default_health_path() -> String {
    "/up".to_string()
}

fn default_response_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// A named deployment unit: a set of apps and services sharing a project
/// network. Identity is `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default)]
    pub apps: Vec<App>,
    #[serde(default)]
    pub services: Vec<Service>,
}

/// Reserved names that can never be used for an app or a service.
pub const RESERVED_NAMES: &[&str] = &["init", "status", "proxy"];

impl Project {
    /// Reject reserved names and duplicate app/service names up front,
    /// before any remote action is taken.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let mut seen = std::collections::HashSet::new();
        for name in self.apps.iter().map(|a| &a.name).chain(self.services.iter().map(|s| &s.name)) {
            if RESERVED_NAMES.contains(&name.as_str()) {
                anyhow::bail!("'{name}' is a reserved name and cannot be used for an app or service");
            }
            if !seen.insert(name.clone()) {
                anyhow::bail!("duplicate app/service name '{name}' within project '{}'", self.name);
            }
        }
        Ok(())
    }
}

/// Environment variables: plain values plus references to secrets resolved
/// locally by the collaborator that parses the secrets file (out of scope
/// here; this struct only carries the already-resolved shape the
/// coordinator needs downstream).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Env {
    #[serde(default)]
    pub plain: BTreeMap<String, String>,
    /// Secret name -> resolved value. Never persisted to disk on the host
    /// beyond the container's own environment.
    #[serde(default)]
    pub secret: BTreeMap<String, String>,
}

impl Env {
    /// All variables in deterministic (sorted) order, for fingerprinting
    /// and for building the container's `--env` arguments.
    pub fn sorted_pairs(&self) -> Vec<(String, String)> {
        self.plain
            .iter()
            .chain(self.secret.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A local port bound on the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortSpec {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_tcp")]
    pub protocol: String,
}

fn default_tcp() -> String {
    "tcp".to_string()
}

/// A host-path -> container-path bind mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct VolumeSpec {
    pub host_path: String,
    pub container_path: String,
}

/// How an app's image is produced (external build collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Directory containing the build context, relative to the project
    /// config file.
    pub context: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
    /// Base image reference, without the release tag (the coordinator
    /// appends `:<release>`).
    pub image: String,
}

/// Proxy-facing configuration for an app/service exposed through the edge
/// proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySpec {
    pub hostnames: Vec<String>,
    pub backend_port: u16,
    #[serde(default = "default_true")]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub ssl_redirect: bool,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub forward_headers: bool,
}

/// Health-check configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSpec {
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            path: default_health_path(),
        }
    }
}

/// An application requiring zero-downtime, TLS-fronted deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub build: BuildSpec,
    pub hosts: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub env: Env,
    pub proxy: ProxySpec,
    #[serde(default)]
    pub health: HealthSpec,
}

/// An auxiliary container (database, cache, ...). Same shape as `App` minus
/// `build`, plus optional `ports`/`volumes`. Services without a `proxy` spec
/// are deployed stop-start rather than blue-green.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: String,
    pub hosts: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub env: Env,
    #[serde(default)]
    pub proxy: Option<ProxySpec>,
    #[serde(default)]
    pub health: HealthSpec,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

impl Service {
    pub fn is_blue_green(&self) -> bool {
        self.proxy.is_some()
    }
}

/// An immutable release identifier: source-control short hash, or an
/// epoch-millisecond fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release(pub String);

impl Release {
    pub fn from_git_short_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn from_epoch_millis(millis: u128) -> Self {
        Self(millis.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<image>:<release>` — the tag the build stage applies.
    pub fn tag(&self, image: &str) -> String {
        format!("{image}:{}", self.0)
    }
}

impl std::fmt::Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_names() {
        let project = Project {
            name: "demo".into(),
            apps: vec![App {
                name: "status".into(),
                build: BuildSpec {
                    context: ".".into(),
                    dockerfile: None,
                    image: "demo/status".into(),
                },
                hosts: vec!["h1".into()],
                replicas: 1,
                env: Env::default(),
                proxy: ProxySpec {
                    hostnames: vec!["example.com".into()],
                    backend_port: 3000,
                    ssl: true,
                    ssl_redirect: true,
                    response_timeout_secs: 30,
                    forward_headers: true,
                },
                health: HealthSpec::default(),
            }],
            services: vec![],
        };
        assert!(project.validate().is_err());
    }

    #[test]
    fn release_tag_format() {
        let release = Release::from_git_short_hash("a1b2c3d");
        assert_eq!(release.tag("myproj/web"), "myproj/web:a1b2c3d");
    }
}
