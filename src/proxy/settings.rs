//! Proxy process settings.
//!
//! Loaded the way `server/settings.rs` loads `Settings`: a typed
//! `Deserialize` struct with `#[serde(default = "...")]` helpers,
//! populated by the `config` crate layered over a TOML file and
//! `IOP_PROXY_`-prefixed environment overrides.

use serde::Deserialize;
use std::path::PathBuf;

fn default_state_dir() -> String {
    "~/.iop/iop-proxy".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_management_port() -> u16 {
    8080
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_renewal_scan_interval_secs() -> u64 {
    12 * 3600
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_health_check_timeout_secs() -> u64 {
    5
}

fn default_health_check_connect_timeout_secs() -> u64 {
    3
}

fn default_acme_retry_interval_secs() -> u64 {
    600
}

fn default_acme_max_attempts() -> u32 {
    144
}

fn default_acme_step_timeout_secs() -> u64 {
    30
}

fn default_acme_hourly_failure_budget() -> u32 {
    5
}

fn default_contact_email() -> Option<String> {
    None
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default)]
    pub acme: AcmeSettings,
    #[serde(default)]
    pub health_check: HealthCheckSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcmeSettings {
    #[serde(default)]
    pub staging: bool,
    #[serde(default = "default_contact_email")]
    pub contact_email: Option<String>,
    #[serde(default = "default_acme_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_acme_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_acme_step_timeout_secs")]
    pub step_timeout_secs: u64,
    #[serde(default = "default_renewal_scan_interval_secs")]
    pub renewal_scan_interval_secs: u64,
    #[serde(default = "default_acme_hourly_failure_budget")]
    pub hourly_failure_budget: u32,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            staging: false,
            contact_email: default_contact_email(),
            retry_interval_secs: default_acme_retry_interval_secs(),
            max_attempts: default_acme_max_attempts(),
            step_timeout_secs: default_acme_step_timeout_secs(),
            renewal_scan_interval_secs: default_renewal_scan_interval_secs(),
            hourly_failure_budget: default_acme_hourly_failure_budget(),
        }
    }
}

impl AcmeSettings {
    /// Staging/production toggle resolves to the matching ACME directory
    /// URL.
    pub fn directory_url(&self) -> &'static str {
        if self.staging {
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        } else {
            "https://acme-v02.api.letsencrypt.org/directory"
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default = "default_health_check_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_check_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_check_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_health_check_interval_secs(),
            timeout_secs: default_health_check_timeout_secs(),
            connect_timeout_secs: default_health_check_connect_timeout_secs(),
        }
    }
}

impl ProxySettings {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        } else {
            builder = builder.add_source(config::File::with_name("iop-proxy").required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("IOP_PROXY").separator("__"));
        let settings: ProxySettings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    pub fn state_dir_path(&self) -> PathBuf {
        expand_home(&self.state_dir)
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.state_dir_path().join("certs")
    }

    pub fn account_key_path(&self) -> PathBuf {
        self.certs_dir().join("account.key")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir_path().join("state.json")
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
