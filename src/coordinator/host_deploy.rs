//! Per-host, per-app execution of deployment coordinator stage 4 (spec
//! §4.G steps a-g). Each host/app pair runs independently; failures here
//! never abort a sibling host.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::coordinator::management_client::{self, DeployParams};
use crate::coordinator::DeployUnit;
use crate::host::{ContainerSpec, DeployLock, HostExecutor, KeyedLocks};
use crate::model::{
    app_alias, container_name, network_name, project_alias, Color, ContainerLabels, CoreError, ErrorKind,
    HostConnection, PortSpec, VolumeSpec,
};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_GATE_DEADLINE: Duration = Duration::from_secs(90);
const RETIRE_GRACEFUL_TIMEOUT_SECS: u32 = 30;
/// Stable name for the edge proxy container on every host.
const PROXY_CONTAINER_NAME: &str = "iop-proxy";
/// Image the operator is expected to have built/pulled during `init`; the
/// coordinator only ensures the container is running, not the image build
/// (that belongs to project bootstrap, out of scope per spec §1).
const PROXY_IMAGE: &str = "iop-proxy:latest";
const PROXY_STATE_DIR: &str = "/var/lib/iop-proxy";

pub enum HostAppOutcome {
    Deployed { release: String },
    Skipped,
}

/// Run stages a-g of spec §4.G for one app on one host.
pub async fn deploy_unit_to_host(
    host_name: &str,
    conn: &HostConnection,
    project: &str,
    unit: &DeployUnit<'_>,
    release_id: &str,
    image_tag: &str,
    image_tar: &[u8],
    fingerprint: &str,
    locks: &KeyedLocks,
    force: bool,
) -> Result<HostAppOutcome, CoreError> {
    let executor = HostExecutor::connect(host_name, conn).await?;
    let deploy_lock = DeployLock::acquire(&executor, locks, project, unit.name)
        .await
        .map_err(|e| CoreError::new(ErrorKind::Conflict, e.to_string()))?;

    let result = run_stages(&executor, project, unit, release_id, image_tag, image_tar, fingerprint, conn, force).await;

    if let Err(e) = deploy_lock.release(&executor).await {
        warn!(host = host_name, app = unit.name, error = %e, "failed to release remote deploy lock");
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn run_stages(
    executor: &HostExecutor,
    project: &str,
    unit: &DeployUnit<'_>,
    release_id: &str,
    image_tag: &str,
    image_tar: &[u8],
    fingerprint: &str,
    conn: &HostConnection,
    force: bool,
) -> Result<HostAppOutcome, CoreError> {
    // a. Ensure infrastructure.
    let network = network_name(project);
    executor.network_create(&network).await?;
    ensure_proxy_running(executor, &network, conn.management_port).await?;

    // b. Transfer image to host.
    executor.docker_load_stream(image_tar.to_vec()).await?;

    // c. Determine current active color. Docker never lets us mutate the
    // `active` label of an already-running container (DESIGN.md Open
    // Question 5), so that label is written once at creation time and
    // never flipped — it cannot be used to find the currently-serving
    // color. The currently-serving container is instead the one still
    // *running* under this project/app (the project alias is the traffic
    // source of truth; the previous color is stopped and removed by
    // `retire_old_color` once a switch completes, so at most one color is
    // running here in steady state).
    let existing = executor.list_labeled_containers(project, unit.name).await?;
    let current_active = find_current_active(&existing);
    let current_color: Option<Color> = current_active.and_then(|c| c.labels.get("color")).and_then(|c| c.parse().ok());
    let new_color = current_color.map(Color::opposite).unwrap_or_else(Color::first);

    // Fingerprint-based skip.
    if !force {
        if let Some(active) = current_active {
            if active.labels.get("fingerprint").map(String::as_str) == Some(fingerprint) {
                info!(host = %executor.host_name, app = unit.name, "up-to-date, skipped");
                return Ok(HostAppOutcome::Skipped);
            }
        }
    }

    // d. Create the new color's container(s).
    let project_alias_name = project_alias(project, unit.name);
    let app_alias_name = app_alias(unit.name);
    let mut new_containers = Vec::with_capacity(unit.replicas as usize);

    for replica in 1..=unit.replicas {
        let name = container_name(project, unit.name, new_color, if unit.replicas == 1 { None } else { Some(replica) });
        let labels = ContainerLabels {
            project: project.to_string(),
            app: unit.name.to_string(),
            color: new_color,
            replica,
            release: release_id.to_string(),
            active: false,
            fingerprint: fingerprint.to_string(),
        };
        let spec = ContainerSpec {
            name: name.clone(),
            image: image_tag.to_string(),
            network: network.clone(),
            aliases: vec![app_alias_name.clone(), project_alias_name.clone()],
            labels: labels_to_map(&labels),
            env: unit.env.sorted_pairs(),
            ports: unit.ports.to_vec(),
            volumes: unit.volumes.to_vec(),
        };

        if let Err(e) = executor.container_run(&spec).await {
            cleanup_new_containers(executor, &new_containers).await;
            return Err(e);
        }
        new_containers.push(name);
    }

    let Some(proxy) = unit.proxy else {
        // Services without a proxy spec never reach step e-g here; the
        // stop-start path in `coordinator::mod` handles them directly.
        return Ok(HostAppOutcome::Deployed {
            release: release_id.to_string(),
        });
    };

    // e. Gate on health: every replica must become healthy.
    for name in &new_containers {
        if let Err(e) = wait_for_replica_health(executor, name, proxy.backend_port, &unit.health.path).await {
            cleanup_new_containers(executor, &new_containers).await;
            return Err(e);
        }
    }

    // f. Atomic switch, once per hostname this unit is exposed on.
    let target = format!("{project_alias_name}:{}", proxy.backend_port);
    for hostname in &proxy.hostnames {
        let existing_entries = match management_client::status(executor, conn.management_port, Some(hostname)).await {
            Ok((_, hosts)) => hosts,
            Err(_) => vec![],
        };

        if existing_entries.is_empty() {
            management_client::deploy(
                executor,
                conn.management_port,
                DeployParams {
                    host: hostname,
                    target: &target,
                    project,
                    app: unit.name,
                    health_path: &unit.health.path,
                    ssl: proxy.ssl,
                    ssl_redirect: proxy.ssl_redirect,
                    forward_headers: proxy.forward_headers,
                    response_timeout_secs: proxy.response_timeout_secs,
                },
            )
            .await?;
        } else {
            management_client::switch(executor, conn.management_port, hostname, &target).await?;
        }
    }

    // g. Retire the old color (failures here are logged, not fatal — the
    // new color is already authoritative).
    if let Some(old) = current_active {
        retire_old_color(executor, &network, &app_alias_name, old).await;
    }

    Ok(HostAppOutcome::Deployed {
        release: release_id.to_string(),
    })
}

/// The container currently serving traffic for a project/app, found by
/// *running* state rather than by the `active` label (see the comment in
/// `run_stages` step c): at most one color is running in steady state, and
/// that is the one holding the project alias.
fn find_current_active(existing: &[crate::host::ContainerInspect]) -> Option<&crate::host::ContainerInspect> {
    existing.iter().find(|c| c.running)
}

fn labels_to_map(labels: &ContainerLabels) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert("project".to_string(), labels.project.clone());
    map.insert("app".to_string(), labels.app.clone());
    map.insert("color".to_string(), labels.color.to_string());
    map.insert("replica".to_string(), labels.replica.to_string());
    map.insert("release".to_string(), labels.release.clone());
    map.insert("active".to_string(), labels.active.to_string());
    map.insert("fingerprint".to_string(), labels.fingerprint.clone());
    map
}

async fn wait_for_replica_health(
    executor: &HostExecutor,
    container_name: &str,
    backend_port: u16,
    health_path: &str,
) -> Result<(), CoreError> {
    let deadline = Instant::now() + HEALTH_GATE_DEADLINE;
    let url = format!("http://localhost:{backend_port}{health_path}");

    loop {
        let output = executor
            .exec_in_container(container_name, &["curl", "-sf", "-o", "/dev/null", "-w", "%{http_code}", &url])
            .await;

        if let Ok(output) = output {
            if output.success {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            return Err(CoreError::new(
                ErrorKind::HealthCheck,
                format!("container '{container_name}' did not become healthy within {:?}", HEALTH_GATE_DEADLINE),
            ));
        }
        sleep(HEALTH_POLL_INTERVAL).await;
    }
}

async fn cleanup_new_containers(executor: &HostExecutor, names: &[String]) {
    for name in names {
        if let Err(e) = executor.container_rm(name).await {
            warn!(container = %name, error = %e, "failed to remove unhealthy container during rollback");
        }
    }
}

async fn retire_old_color(
    executor: &HostExecutor,
    network: &str,
    app_alias_name: &str,
    old: &crate::host::ContainerInspect,
) {
    // `docker stop`/`rm`/network operations all accept a container id in
    // place of a name.
    let old_ref = &old.id;

    if let Err(e) = executor.drop_project_alias(network, old_ref, app_alias_name).await {
        warn!(container = %old_ref, error = %e, "failed to drop project alias from retiring container");
    }
    if let Err(e) = executor.container_stop(old_ref, RETIRE_GRACEFUL_TIMEOUT_SECS).await {
        warn!(container = %old_ref, error = %e, "failed to stop retiring container");
    }
    if let Err(e) = executor.container_rm(old_ref).await {
        warn!(container = %old_ref, error = %e, "failed to remove retiring container");
    }
}

/// Install/update the edge proxy container on this host if missing (spec
/// §4.G step 4.a). The proxy image itself is built/pulled during `init`
/// (out of scope here, spec §1); this only ensures the container exists,
/// is attached to the project network, and is running.
async fn ensure_proxy_running(executor: &HostExecutor, network: &str, management_port: u16) -> Result<(), CoreError> {
    if let Some(existing) = executor.container_inspect(PROXY_CONTAINER_NAME).await? {
        if existing.running {
            executor.network_connect(network, PROXY_CONTAINER_NAME, &[]).await?;
            return Ok(());
        }
    }

    let spec = ContainerSpec {
        name: PROXY_CONTAINER_NAME.to_string(),
        image: PROXY_IMAGE.to_string(),
        network: network.to_string(),
        aliases: vec![],
        labels: BTreeMap::new(),
        env: vec![(
            "IOP_PROXY__MANAGEMENT_PORT".to_string(),
            management_port.to_string(),
        )],
        ports: vec![
            PortSpec {
                host_port: 80,
                container_port: 80,
                protocol: "tcp".into(),
            },
            PortSpec {
                host_port: 443,
                container_port: 443,
                protocol: "tcp".into(),
            },
        ],
        volumes: vec![VolumeSpec {
            host_path: PROXY_STATE_DIR.to_string(),
            container_path: "/var/lib/iop-proxy".to_string(),
        }],
    };
    executor.container_run(&spec).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ContainerInspect;

    fn inspect(running: bool, color: &str, fingerprint: &str) -> ContainerInspect {
        let mut labels = BTreeMap::new();
        labels.insert("color".to_string(), color.to_string());
        labels.insert("fingerprint".to_string(), fingerprint.to_string());
        labels.insert("active".to_string(), "false".to_string());
        ContainerInspect {
            id: format!("id-{color}"),
            running,
            health: None,
            labels,
        }
    }

    #[test]
    fn no_containers_means_no_active_color() {
        assert!(find_current_active(&[]).is_none());
    }

    #[test]
    fn finds_the_running_container_even_though_active_label_is_always_false() {
        let containers = vec![inspect(true, "blue", "fp1")];
        let active = find_current_active(&containers).expect("blue is running");
        assert_eq!(active.labels.get("color").map(String::as_str), Some("blue"));
    }

    #[test]
    fn ignores_stopped_leftover_containers() {
        // A stopped, not-yet-cleaned-up old color must never be mistaken
        // for the currently-serving one.
        let containers = vec![inspect(false, "blue", "fp1"), inspect(true, "green", "fp2")];
        let active = find_current_active(&containers).expect("green is running");
        assert_eq!(active.labels.get("color").map(String::as_str), Some("green"));
    }
}
