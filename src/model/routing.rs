//! State-store wire types: routing entries and certificate status
//!.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Certificate lifecycle states. Transitions are validated by
/// [`is_valid_transition`], mirroring the teacher's deployment state
/// machine (`server/deployment/state_machine.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    Pending,
    Acquiring,
    Active,
    Renewing,
    Failed,
    Expired,
}

/// Whether a transition between two certificate states is legal.
pub fn is_valid_transition(from: CertificateState, to: CertificateState) -> bool {
    use CertificateState::*;
    matches!(
        (from, to),
        (Pending, Acquiring)
            | (Acquiring, Active)
            | (Acquiring, Failed)
            | (Acquiring, Pending) // transient network error, retry scheduled
            | (Active, Renewing)
            | (Active, Acquiring) // operator forced renew via the management API while still valid
            | (Active, Expired) // cert file went missing/unparseable on disk
            | (Renewing, Acquiring) // renewal scan flags it, acquisition worker picks it up
            | (Renewing, Active)
            | (Renewing, Failed)
            | (Renewing, Pending) // attempt failed, retry scheduled under the original flow
            | (Renewing, Renewing)
            | (Failed, Acquiring) // operator forced renew, or attempt budget reset
            | (Expired, Acquiring)
            | (Expired, Pending)
            | (Pending, Pending) // retry reschedule, or a redundant deploy() upsert
            | (Acquiring, Acquiring) // forced renew while already acquiring
    )
}

pub fn validate_transition(from: CertificateState, to: CertificateState) -> anyhow::Result<()> {
    if !is_valid_transition(from, to) {
        anyhow::bail!("invalid certificate state transition from {from:?} to {to:?}");
    }
    Ok(())
}

/// Per-hostname certificate status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateStatus {
    pub state: CertificateState,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub next_attempt: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> u32 {
    144
}

impl CertificateStatus {
    pub fn pending() -> Self {
        Self {
            state: CertificateState::Pending,
            acquired_at: None,
            expires_at: None,
            cert_file: None,
            key_file: None,
            attempt_count: 0,
            max_attempts: default_max_attempts(),
            next_attempt: None,
        }
    }

    /// Within 30 days of expiry.
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, CertificateState::Active)
            && self
                .expires_at
                .is_some_and(|expires_at| expires_at - now <= chrono::Duration::days(30))
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// A single hostname's routing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub hostname: String,
    /// `<host-alias>:<port>` — never an IP (spec invariant 2).
    pub target: String,
    pub project: String,
    pub app: String,
    pub health_path: String,
    pub ssl_enabled: bool,
    pub ssl_redirect: bool,
    pub forward_headers: bool,
    pub response_timeout_secs: u64,
    pub certificate: Option<CertificateStatus>,
    pub healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl RoutingEntry {
    /// Host portion of `target`, e.g. `myproject-web` from `myproject-web:3000`.
    pub fn target_host(&self) -> &str {
        self.target.split(':').next().unwrap_or(&self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_happy_path() {
        validate_transition(CertificateState::Pending, CertificateState::Acquiring).unwrap();
        validate_transition(CertificateState::Acquiring, CertificateState::Active).unwrap();
        validate_transition(CertificateState::Active, CertificateState::Renewing).unwrap();
        validate_transition(CertificateState::Renewing, CertificateState::Active).unwrap();
    }

    #[test]
    fn cannot_skip_acquiring() {
        assert!(validate_transition(CertificateState::Pending, CertificateState::Active).is_err());
    }

    #[test]
    fn needs_renewal_within_30_days() {
        let now = Utc::now();
        let mut status = CertificateStatus::pending();
        status.state = CertificateState::Active;
        status.expires_at = Some(now + chrono::Duration::days(10));
        assert!(status.needs_renewal(now));
        status.expires_at = Some(now + chrono::Duration::days(60));
        assert!(!status.needs_renewal(now));
    }
}
