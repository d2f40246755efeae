//! Command-line front-end: a thin collaborator that parses arguments,
//! loads the project config, and calls into [`crate::coordinator`] — none
//! of the deployment logic lives here.
//!
//! Follows `rise-cli/src/main.rs`'s `Cli`/`Commands` derive shape and its
//! exit-code convention.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing::error;

use crate::coordinator::{self, progress};
use crate::host::HostExecutor;
use crate::model::{App, BuildSpec, DeployConfig, Env, HealthSpec, HostConnection, Project, ProxySpec};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

/// `iop` — blue-green deployment coordinator, status, proxy {...}.
#[derive(Parser, Debug)]
#[command(name = "iop", version, about = "Blue-green deployment coordinator for Docker-on-SSH fleets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the project config file (default: `./iop.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Repeatable: `-v` for debug, `-vv` for trace.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scaffold a starter project config in the current directory.
    Init,
    /// Build, transfer, and blue-green switch every app/service (the
    /// default action when no subcommand is given).
    Deploy {
        /// Deploy services only, skipping apps.
        #[arg(long)]
        services_only: bool,
        /// Ignore the fingerprint skip and redeploy unconditionally.
        #[arg(long)]
        force: bool,
    },
    /// Print routing/certificate status from every configured host.
    Status,
    /// Operate directly on a host's edge proxy.
    Proxy {
        #[command(subcommand)]
        command: ProxyCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProxyCommand {
    /// Show one host's routing table (bypassing the coordinator's deploy path).
    Status {
        /// SSH host key from the project config to query.
        host: String,
    },
    /// Toggle the ACME staging directory on a host.
    Update {
        host: String,
        #[arg(long)]
        staging: bool,
    },
    /// Remove a routing entry (and its certificate) from a host's proxy.
    DeleteHost {
        host: String,
        /// External hostname to remove.
        hostname: String,
    },
    /// Tail the edge proxy container's logs on a host.
    Logs {
        host: String,
        #[arg(long)]
        follow: bool,
    },
}

fn default_config_path() -> PathBuf {
    PathBuf::from("iop.toml")
}

fn load_config(path: &Path) -> anyhow::Result<DeployConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == IoErrorKind::NotFound {
            anyhow::anyhow!("no project config at '{}' (run `iop init` first)", path.display())
        } else {
            anyhow::Error::new(e).context(format!("reading '{}'", path.display()))
        }
    })?;
    let config: DeployConfig = toml::from_str(&contents).map_err(|e| anyhow::Error::new(e).context("parsing project config"))?;
    Ok(config)
}

/// Entry point called from `main`.
pub async fn run(cli: Cli) -> ExitCode {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let result = tokio::select! {
        result = dispatch(&cli, &config_path) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("interrupted");
            return ExitCode::from(EXIT_INTERRUPTED);
        }
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn dispatch(cli: &Cli, config_path: &Path) -> anyhow::Result<u8> {
    match &cli.command {
        None | Some(Command::Deploy { .. }) => {
            let (services_only, force) = match &cli.command {
                Some(Command::Deploy { services_only, force }) => (*services_only, *force),
                _ => (false, false),
            };
            run_deploy(config_path, services_only, force).await
        }
        Some(Command::Init) => run_init(config_path),
        Some(Command::Status) => run_status(config_path).await,
        Some(Command::Proxy { command }) => run_proxy_command(config_path, command).await,
    }
}

async fn run_deploy(config_path: &Path, services_only: bool, force: bool) -> anyhow::Result<u8> {
    let mut config = load_config(config_path)?;
    if services_only {
        config.project.apps.clear();
    }

    let project_root = config_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let outcome = coordinator::deploy_project(&config, &project_root, force)
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.kind, e.message))?;

    progress::print_summary(&outcome.rows);
    println!("release {}", outcome.release);

    if outcome.any_failed() {
        Ok(EXIT_FAILURE)
    } else {
        Ok(EXIT_SUCCESS)
    }
}

fn run_init(config_path: &Path) -> anyhow::Result<u8> {
    if config_path.exists() {
        anyhow::bail!("'{}' already exists", config_path.display());
    }

    let starter = DeployConfig {
        project: Project {
            name: "myproject".to_string(),
            apps: vec![App {
                name: "web".to_string(),
                build: BuildSpec {
                    context: ".".to_string(),
                    dockerfile: None,
                    image: "myproject/web".to_string(),
                },
                hosts: vec!["h1".to_string()],
                replicas: 1,
                env: Env::default(),
                proxy: ProxySpec {
                    hostnames: vec!["example.com".to_string()],
                    backend_port: 3000,
                    ssl: true,
                    ssl_redirect: true,
                    response_timeout_secs: 30,
                    forward_headers: true,
                },
                health: HealthSpec::default(),
            }],
            services: vec![],
        },
        hosts: [(
            "h1".to_string(),
            HostConnection {
                address: "deploy@h1.example.com".to_string(),
                port: 22,
                identity_file: None,
                management_port: 8080,
            },
        )]
        .into_iter()
        .collect(),
    };

    let toml = toml::to_string_pretty(&starter)?;
    std::fs::write(config_path, toml)?;
    println!("wrote {}", config_path.display());
    Ok(EXIT_SUCCESS)
}

async fn run_status(config_path: &Path) -> anyhow::Result<u8> {
    let config = load_config(config_path)?;
    let results = coordinator::collect_status(&config).await;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["host", "hostname", "target", "healthy", "cert"]);

    let mut any_failed = false;
    for (host, result) in results {
        match result {
            Ok((_, entries)) => {
                for entry in entries {
                    let cert = entry
                        .certificate
                        .map(|c| format!("{:?}", c.state))
                        .unwrap_or_else(|| "none".to_string());
                    table.add_row(vec![host.clone(), entry.hostname, entry.target, entry.healthy.to_string(), cert]);
                }
            }
            Err(e) => {
                any_failed = true;
                eprintln!("host '{host}': {}: {}", e.kind, e.message);
            }
        }
    }

    println!("{table}");
    Ok(if any_failed { EXIT_FAILURE } else { EXIT_SUCCESS })
}

async fn run_proxy_command(config_path: &Path, command: &ProxyCommand) -> anyhow::Result<u8> {
    let config = load_config(config_path)?;

    match command {
        ProxyCommand::Status { host } => {
            let conn = config.host(host)?;
            let executor = HostExecutor::connect(host, conn).await?;
            let (staging, entries) = coordinator::management_client::status(&executor, conn.management_port, None).await?;
            println!("staging: {staging}");
            for entry in entries {
                println!("{} -> {} (healthy={})", entry.hostname, entry.target, entry.healthy);
            }
            Ok(EXIT_SUCCESS)
        }
        ProxyCommand::Update { host, staging } => {
            let conn = config.host(host)?;
            let executor = HostExecutor::connect(host, conn).await?;
            coordinator::management_client::set_staging(&executor, conn.management_port, *staging).await?;
            println!("staging set to {staging} on '{host}'");
            Ok(EXIT_SUCCESS)
        }
        ProxyCommand::DeleteHost { host, hostname } => {
            let conn = config.host(host)?;
            let executor = HostExecutor::connect(host, conn).await?;
            coordinator::management_client::remove_host(&executor, conn.management_port, hostname).await?;
            println!("removed '{hostname}' from '{host}'");
            Ok(EXIT_SUCCESS)
        }
        ProxyCommand::Logs { host, follow } => {
            let conn = config.host(host)?;
            let executor = HostExecutor::connect(host, conn).await?;
            let args: Vec<&str> = if *follow { vec!["logs", "-f", "iop-proxy"] } else { vec!["logs", "--tail", "200", "iop-proxy"] };
            let output = executor.exec("docker", &args).await.map_err(|e| anyhow::anyhow!("{}: {}", e.kind, e.message))?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(if output.success { EXIT_SUCCESS } else { EXIT_FAILURE })
        }
    }
}
