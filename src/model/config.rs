//! Minimal project config the coordinator consumes: apps, services, and
//! their build/deploy shape, plus the host registry and SSH connection
//! parameters the host executor needs. Schema validation beyond what the
//! coordinator uses to make decisions is out of scope — this is not a
//! general-purpose config parser.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::Project;

fn default_ssh_port() -> u16 {
    22
}

fn default_management_port() -> u16 {
    8080
}

/// SSH connection parameters for one target host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConnection {
    /// `user@host` or `host`, passed straight to the SSH transport.
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
    /// Loopback management-API port on the remote edge proxy; the
    /// coordinator reaches it by executing a local `curl` over the same SSH
    /// session, since the API is not exposed off-host.
    #[serde(default = "default_management_port")]
    pub management_port: u16,
}

/// The whole deployable unit: one project plus the hosts it targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub project: Project,
    pub hosts: BTreeMap<String, HostConnection>,
}

impl DeployConfig {
    pub fn host(&self, name: &str) -> anyhow::Result<&HostConnection> {
        self.hosts
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no host connection configured for '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_host_errors() {
        let config = DeployConfig {
            project: Project {
                name: "demo".into(),
                apps: vec![],
                services: vec![],
            },
            hosts: BTreeMap::new(),
        };
        assert!(config.host("h1").is_err());
    }
}
