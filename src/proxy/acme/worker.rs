//! Long-running ACME tasks: acquisition/retry and renewal scanning,
//! shaped like `DomainVerificationLoop`
//! (`server/domain/verification_loop.rs`): an `Arc<Self>` owner,
//! `start(self: Arc<Self>)` spawning a single `tokio::spawn`, and a
//! `tokio::time::interval` ticker inside.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::model::{CertificateState, CertificateStatus};
use crate::proxy::acme::{write_certificate_files, AcmeClient, FailureBudget};
use crate::proxy::settings::AcmeSettings;
use crate::proxy::state::StateStore;

/// Scans for pending/due certificates roughly once a minute and drives each
/// through the acquisition/retry flow, respecting each entry's own
/// `next_attempt` schedule and the per-hostname hourly failure budget.
pub fn spawn_acquisition_worker(
    state: Arc<StateStore>,
    client: Arc<AcmeClient>,
    settings: AcmeSettings,
    budget: Arc<FailureBudget>,
    certs_dir: std::path::PathBuf,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let due = state.hostnames_due_for_acme(now).await;
            for hostname in due {
                if let Err(e) = attempt_one(&state, &client, &settings, &budget, &certs_dir, &hostname).await
                {
                    error!(hostname = %hostname, error = %e, "ACME attempt failed");
                }
            }
        }
    });
}

/// Every 12h, flags any `active` certificate expiring within 30 days for
/// renewal by transitioning it to `renewing`;
/// the acquisition worker's frequent tick then picks it up.
pub fn spawn_renewal_worker(state: Arc<StateStore>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            for entry in state.list(None).await {
                let Some(cert) = entry.certificate else { continue };
                if cert.needs_renewal(now) {
                    info!(hostname = %entry.hostname, "certificate due for renewal");
                    let mut renewing = cert;
                    renewing.state = CertificateState::Renewing;
                    renewing.attempt_count = 0;
                    renewing.next_attempt = None;
                    if let Err(e) = state.set_certificate(&entry.hostname, renewing).await {
                        warn!(hostname = %entry.hostname, error = %e, "failed to flag certificate for renewal");
                    }
                }
            }
        }
    });
}

async fn attempt_one(
    state: &StateStore,
    client: &AcmeClient,
    settings: &AcmeSettings,
    budget: &FailureBudget,
    certs_dir: &std::path::Path,
    hostname: &str,
) -> anyhow::Result<()> {
    let now = Utc::now();

    if budget.is_exhausted(hostname, now) {
        warn!(hostname, "hourly ACME failure budget exhausted, waiting out the window");
        return Ok(());
    }

    let Some(entry) = state.get(hostname).await else {
        return Ok(());
    };
    let mut cert = entry.certificate.unwrap_or_else(CertificateStatus::pending);
    if cert.state == CertificateState::Active {
        return Ok(());
    }
    cert.state = CertificateState::Acquiring;
    state.set_certificate(hostname, cert.clone()).await?;

    let staging = state.staging().await;
    info!(hostname, staging, "starting ACME acquisition attempt");

    match client.acquire_certificate(hostname, settings, staging).await {
        Ok((cert_chain_pem, private_key_pem)) => {
            let (cert_path, key_path) =
                write_certificate_files(certs_dir, hostname, &cert_chain_pem, &private_key_pem).await?;
            let acquired_at = Utc::now();
            cert.state = CertificateState::Active;
            cert.acquired_at = Some(acquired_at);
            cert.expires_at = Some(acquired_at + chrono::Duration::days(90));
            cert.cert_file = Some(cert_path.display().to_string());
            cert.key_file = Some(key_path.display().to_string());
            cert.attempt_count = 0;
            cert.next_attempt = None;
            state.set_certificate(hostname, cert).await?;
            info!(hostname, "certificate acquired");
            Ok(())
        }
        Err(e) => {
            budget.record_failure(hostname, now);
            cert.attempt_count += 1;
            if cert.attempts_exhausted() {
                cert.state = CertificateState::Failed;
                error!(
                    hostname,
                    attempts = cert.attempt_count,
                    "certificate acquisition failed permanently, serving HTTP-only"
                );
            } else {
                cert.state = CertificateState::Pending;
                cert.next_attempt = Some(now + chrono::Duration::seconds(settings.retry_interval_secs as i64));
                warn!(hostname, attempt = cert.attempt_count, error = %e, "certificate acquisition attempt failed, will retry");
            }
            state.set_certificate(hostname, cert).await?;
            Err(e)
        }
    }
}
