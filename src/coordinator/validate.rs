//! Stage 2 of the deployment coordinator: "reject reserved
//! app/service names ... detect intra-project host-port conflicts; reject
//! malformed port specs." Runs entirely before any remote action, so a
//! config mistake never leaves a half-deployed host behind.

use std::collections::HashMap;

use crate::model::{CoreError, ErrorKind, Project};

/// Validate a project's shape before any build or SSH call is made.
pub fn validate_project(project: &Project) -> Result<(), CoreError> {
    project
        .validate()
        .map_err(|e| CoreError::from_anyhow(ErrorKind::Config, e, "project validation failed"))?;

    check_port_conflicts(project)?;
    Ok(())
}

/// Two services bound to the same host-port on the same target host can
/// never both listen; catch that before a deploy reaches the host.
fn check_port_conflicts(project: &Project) -> Result<(), CoreError> {
    let mut bindings: HashMap<(String, u16, String), String> = HashMap::new();

    for service in &project.services {
        for port in &service.ports {
            for host in &service.hosts {
                let key = (host.clone(), port.host_port, port.protocol.clone());
                if let Some(existing) = bindings.insert(key, service.name.clone()) {
                    if existing != service.name {
                        return Err(CoreError::new(
                            ErrorKind::Conflict,
                            format!(
                                "port {}/{} on host '{host}' is claimed by both '{existing}' and '{}'",
                                port.host_port, port.protocol, service.name
                            ),
                        ));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Env, HealthSpec, PortSpec, Service};

    fn service(name: &str, host_port: u16, hosts: &[&str]) -> Service {
        Service {
            name: name.into(),
            image: "redis:7".into(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            replicas: 1,
            env: Env::default(),
            proxy: None,
            health: HealthSpec::default(),
            ports: vec![PortSpec {
                host_port,
                container_port: 6379,
                protocol: "tcp".into(),
            }],
            volumes: vec![],
        }
    }

    #[test]
    fn detects_conflicting_ports_on_same_host() {
        let project = Project {
            name: "demo".into(),
            apps: vec![],
            services: vec![service("cache-a", 6379, &["h1"]), service("cache-b", 6379, &["h1"])],
        };
        assert!(validate_project(&project).is_err());
    }

    #[test]
    fn same_port_on_different_hosts_is_fine() {
        let project = Project {
            name: "demo".into(),
            apps: vec![],
            services: vec![service("cache-a", 6379, &["h1"]), service("cache-b", 6379, &["h2"])],
        };
        assert!(validate_project(&project).is_ok());
    }
}
