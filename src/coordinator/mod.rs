//! Deployment Coordinator: "Orchestrates a release across all
//! target hosts." This module is the top of the `cli`-feature dependency
//! graph — it owns stage 1-3 (resolve release, validate, build) and fans
//! stage 4 out across hosts, bounded and in parallel, each host
//! progressing independently per spec §5 "cooperative within the
//! deployment coordinator (bounded parallel fan-out across hosts, each
//! host sequential)".

pub mod fingerprint;
pub mod host_deploy;
pub mod management_client;
pub mod progress;
pub mod release;
pub mod validate;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::build;
use crate::host::{ContainerSpec, HostExecutor, KeyedLocks};
use crate::model::{
    app_alias, container_name, network_name, Color, ContainerLabels, CoreError, DeployConfig, Env, ErrorKind,
    HealthSpec, PortSpec, Project, ProxySpec, Release, VolumeSpec,
};

pub use progress::{Outcome, OutcomeRow};

/// The small bounded-concurrency caps spec §4.G calls for ("Parallel
/// across apps bounded by a small concurrency", "in parallel, bounded"
/// per host).
const BUILD_CONCURRENCY: usize = 4;
const HOST_CONCURRENCY: usize = 8;

/// Everything the per-host pipeline (`host_deploy`) needs, abstracted over
/// whether it came from an `App` or a blue-green `Service`.
pub struct DeployUnit<'a> {
    pub name: &'a str,
    pub replicas: u32,
    pub env: &'a Env,
    pub proxy: Option<&'a ProxySpec>,
    pub health: &'a HealthSpec,
    pub ports: &'a [PortSpec],
    pub volumes: &'a [VolumeSpec],
}

/// Outcome of a full `deploy_project` run.
pub struct DeployOutcome {
    pub release: Release,
    pub rows: Vec<OutcomeRow>,
}

impl DeployOutcome {
    pub fn any_failed(&self) -> bool {
        self.rows.iter().any(|r| matches!(r.outcome, Outcome::Failed { .. }))
    }
}

/// Run the whole deploy: stages 1-3 once, stage 4 fanned out per host.
pub async fn deploy_project(config: &DeployConfig, project_root: &Path, force: bool) -> Result<DeployOutcome, CoreError> {
    // Stage 2: configuration validation (stage 1, release resolution,
    // doesn't depend on validation succeeding first, but nothing downstream
    // should run against an invalid project).
    validate::validate_project(&config.project)?;

    // Stage 1: resolve release id.
    let release = release::resolve_release(project_root).await;
    let locks = Arc::new(KeyedLocks::new());
    let mut rows = Vec::new();

    // Stage 3: build images, one per app, bounded concurrency.
    let built_apps = build_apps(&config.project, project_root, &release).await;

    for (app, built) in config.project.apps.iter().zip(built_apps.into_iter()) {
        let (image_tag, image_tar) = match built {
            Ok(pair) => pair,
            Err(e) => {
                for host in &app.hosts {
                    progress::failed(host, &app.name, "build", e.kind, &e.message);
                    rows.push(OutcomeRow {
                        host: host.clone(),
                        app: app.name.clone(),
                        outcome: Outcome::Failed {
                            stage: "build".to_string(),
                            message: e.message.clone(),
                        },
                    });
                }
                continue;
            }
        };

        let unit = DeployUnit {
            name: &app.name,
            replicas: app.replicas,
            env: &app.env,
            proxy: Some(&app.proxy),
            health: &app.health,
            ports: &[],
            volumes: &[],
        };
        let fp = fingerprint::app_fingerprint(app, &image_tag);

        let host_rows = deploy_unit_across_hosts(config, &app.hosts, &unit, &release, &image_tag, &image_tar, &fp, &locks, force).await;
        rows.extend(host_rows);
    }

    for service in &config.project.services {
        if service.is_blue_green() {
            let image_tar = match build::save_image(&service.image).await {
                Ok(tar) => tar,
                Err(e) => {
                    for host in &service.hosts {
                        rows.push(failed_row(host, &service.name, "transfer", &e));
                    }
                    continue;
                }
            };
            let unit = DeployUnit {
                name: &service.name,
                replicas: service.replicas,
                env: &service.env,
                proxy: service.proxy.as_ref(),
                health: &service.health,
                ports: &service.ports,
                volumes: &service.volumes,
            };
            let fp = fingerprint::service_fingerprint(service, &service.image);
            let host_rows =
                deploy_unit_across_hosts(config, &service.hosts, &unit, &release, &service.image, &image_tar, &fp, &locks, force).await;
            rows.extend(host_rows);
        } else {
            let host_rows = deploy_service_stop_start(config, service, &release, &locks, force).await;
            rows.extend(host_rows);
        }
    }

    Ok(DeployOutcome { release, rows })
}

/// Order-preserving (so the caller can `zip` results back against
/// `project.apps`), but still bounded to `BUILD_CONCURRENCY` concurrent
/// builds via `buffered` rather than `buffer_unordered`.
async fn build_apps(
    project: &Project,
    project_root: &Path,
    release: &Release,
) -> Vec<Result<(String, Vec<u8>), CoreError>> {
    stream::iter(project.apps.iter())
        .map(|app| async move {
            let built = build::build_image(project_root, &app.build, release).await?;
            let tar = build::save_image(&built.tag).await?;
            Ok((built.tag, tar))
        })
        .buffered(BUILD_CONCURRENCY)
        .collect::<Vec<_>>()
        .await
}

#[allow(clippy::too_many_arguments)]
async fn deploy_unit_across_hosts(
    config: &DeployConfig,
    hosts: &[String],
    unit: &DeployUnit<'_>,
    release: &Release,
    image_tag: &str,
    image_tar: &[u8],
    fingerprint_hash: &str,
    locks: &Arc<KeyedLocks>,
    force: bool,
) -> Vec<OutcomeRow> {
    let results: Vec<(String, Result<host_deploy::HostAppOutcome, CoreError>)> = stream::iter(hosts.iter())
        .map(|host_name| {
            let locks = Arc::clone(locks);
            async move {
                let outcome = match config.host(host_name) {
                    Ok(conn) => {
                        progress::stage(host_name, unit.name, "deploying");
                        host_deploy::deploy_unit_to_host(
                            host_name,
                            conn,
                            &config.project.name,
                            unit,
                            release.as_str(),
                            image_tag,
                            image_tar,
                            fingerprint_hash,
                            &locks,
                            force,
                        )
                        .await
                    }
                    Err(e) => Err(CoreError::new(ErrorKind::Config, e.to_string())),
                };
                (host_name.clone(), outcome)
            }
        })
        .buffer_unordered(HOST_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    results
        .into_iter()
        .map(|(host, result)| match result {
            Ok(host_deploy::HostAppOutcome::Deployed { release }) => {
                progress::succeeded(&host, unit.name, &release);
                OutcomeRow {
                    host,
                    app: unit.name.to_string(),
                    outcome: Outcome::Deployed { release },
                }
            }
            Ok(host_deploy::HostAppOutcome::Skipped) => {
                progress::skipped(&host, unit.name);
                OutcomeRow {
                    host,
                    app: unit.name.to_string(),
                    outcome: Outcome::Skipped,
                }
            }
            Err(e) => {
                progress::failed(&host, unit.name, "deploy", e.kind, &e.message);
                OutcomeRow {
                    host: host.clone(),
                    app: unit.name.to_string(),
                    outcome: Outcome::Failed {
                        stage: "deploy".to_string(),
                        message: e.message,
                    },
                }
            }
        })
        .collect()
}

fn failed_row(host: &str, app: &str, stage: &str, e: &CoreError) -> OutcomeRow {
    progress::failed(host, app, stage, e.kind, &e.message);
    OutcomeRow {
        host: host.to_string(),
        app: app.to_string(),
        outcome: Outcome::Failed {
            stage: stage.to_string(),
            message: e.message.clone(),
        },
    }
}

/// Stages d-g replaced by a stop-start replacement on the same container
/// name, for services without a proxy spec.
async fn deploy_service_stop_start(
    config: &DeployConfig,
    service: &crate::model::Service,
    release: &Release,
    locks: &Arc<KeyedLocks>,
    force: bool,
) -> Vec<OutcomeRow> {
    let project = &config.project.name;
    let fp = fingerprint::service_fingerprint(service, &service.image);

    stream::iter(service.hosts.iter())
        .map(|host_name| {
            let locks = Arc::clone(locks);
            let fp = fp.clone();
            async move {
                let outcome = stop_start_one_host(config, host_name, project, service, release, &fp, &locks, force).await;
                (host_name.clone(), outcome)
            }
        })
        .buffer_unordered(HOST_CONCURRENCY)
        .collect::<Vec<(String, Result<host_deploy::HostAppOutcome, CoreError>)>>()
        .await
        .into_iter()
        .map(|(host, result)| match result {
            Ok(host_deploy::HostAppOutcome::Deployed { release }) => {
                progress::succeeded(&host, &service.name, &release);
                OutcomeRow {
                    host,
                    app: service.name.clone(),
                    outcome: Outcome::Deployed { release },
                }
            }
            Ok(host_deploy::HostAppOutcome::Skipped) => {
                progress::skipped(&host, &service.name);
                OutcomeRow {
                    host,
                    app: service.name.clone(),
                    outcome: Outcome::Skipped,
                }
            }
            Err(e) => failed_row(&host, &service.name, "deploy", &e),
        })
        .collect()
}

async fn stop_start_one_host(
    config: &DeployConfig,
    host_name: &str,
    project: &str,
    service: &crate::model::Service,
    release: &Release,
    fingerprint_hash: &str,
    locks: &Arc<KeyedLocks>,
    force: bool,
) -> Result<host_deploy::HostAppOutcome, CoreError> {
    let conn = config.host(host_name).map_err(|e| CoreError::new(ErrorKind::Config, e.to_string()))?;
    let executor = HostExecutor::connect(host_name, conn).await?;
    let deploy_lock = crate::host::DeployLock::acquire(&executor, locks, project, &service.name)
        .await
        .map_err(|e| CoreError::new(ErrorKind::Conflict, e.to_string()))?;

    let network = network_name(project);
    let name = container_name(project, &service.name, Color::first(), None);

    let result = async {
        executor.network_create(&network).await?;

        if !force {
            if let Some(existing) = executor.container_inspect(&name).await? {
                if existing.labels.get("fingerprint").map(String::as_str) == Some(fingerprint_hash) {
                    return Ok(host_deploy::HostAppOutcome::Skipped);
                }
            }
        }

        let image_tar = build::save_image(&service.image).await?;
        executor.docker_load_stream(image_tar).await?;

        executor.container_stop(&name, 30).await?;
        executor.container_rm(&name).await?;

        let labels = ContainerLabels {
            project: project.to_string(),
            app: service.name.clone(),
            color: Color::first(),
            replica: 1,
            release: release.as_str().to_string(),
            active: true,
            fingerprint: fingerprint_hash.to_string(),
        };
        let spec = ContainerSpec {
            name: name.clone(),
            image: service.image.clone(),
            network: network.clone(),
            aliases: vec![app_alias(&service.name)],
            labels: {
                let mut map = BTreeMap::new();
                map.insert("project".to_string(), labels.project.clone());
                map.insert("app".to_string(), labels.app.clone());
                map.insert("release".to_string(), labels.release.clone());
                map.insert("fingerprint".to_string(), labels.fingerprint.clone());
                map
            },
            env: service.env.sorted_pairs(),
            ports: service.ports.clone(),
            volumes: service.volumes.clone(),
        };
        executor.container_run(&spec).await?;

        Ok(host_deploy::HostAppOutcome::Deployed {
            release: release.as_str().to_string(),
        })
    }
    .await;

    if let Err(e) = deploy_lock.release(&executor).await {
        warn!(host = host_name, app = %service.name, error = %e, "failed to release remote deploy lock");
    }

    result
}

/// `iop status` / `iop proxy status`: query every
/// configured host's management API and merge the results.
pub async fn collect_status(config: &DeployConfig) -> Vec<(String, Result<(bool, Vec<crate::model::RoutingEntry>), CoreError>)> {
    stream::iter(config.hosts.iter())
        .map(|(host_name, conn)| async move {
            let result = async {
                let executor = HostExecutor::connect(host_name, conn).await?;
                management_client::status(&executor, conn.management_port, None).await
            }
            .await;
            (host_name.clone(), result)
        })
        .buffer_unordered(HOST_CONCURRENCY)
        .collect()
        .await
}
