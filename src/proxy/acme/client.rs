use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::proxy::challenge::ChallengeStore;
use crate::proxy::settings::AcmeSettings;

/// Serializes every ACME operation across the whole process, and rebuilds the
/// account against the currently configured directory URL on each call so
/// a staging/production toggle takes effect on the next operation.
pub struct AcmeClient {
    lock: Mutex<()>,
    account_key_dir: PathBuf,
    challenges: ChallengeStore,
}

impl AcmeClient {
    pub fn new(account_key_dir: PathBuf, challenges: ChallengeStore) -> Self {
        Self {
            lock: Mutex::new(()),
            account_key_dir,
            challenges,
        }
    }

    fn account_key_path(&self, staging: bool) -> PathBuf {
        let name = if staging { "account-staging.json" } else { "account.json" };
        self.account_key_dir.join(name)
    }

    /// Step 1: ensure an ACME account exists for the given directory,
    /// generating and registering one if it does not.
    async fn load_or_register_account(
        &self,
        directory_url: &str,
        staging: bool,
        contact_email: Option<&str>,
        step_timeout: Duration,
    ) -> Result<Account> {
        let key_path = self.account_key_path(staging);

        if let Ok(bytes) = tokio::fs::read(&key_path).await {
            let credentials: AccountCredentials =
                serde_json::from_slice(&bytes).context("parsing ACME account credentials")?;
            let account = Account::from_credentials(credentials)
                .await
                .context("restoring ACME account from saved credentials")?;
            return Ok(account);
        }

        info!(directory_url, "registering new ACME account");
        let contact = contact_email.map(|email| format!("mailto:{email}"));
        let contact_refs: Vec<&str> = contact.iter().map(|s| s.as_str()).collect();

        let (account, credentials) = timeout(
            step_timeout,
            Account::create(
                &NewAccount {
                    contact: &contact_refs,
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory_url,
                None,
            ),
        )
        .await
        .context("ACME account registration timed out")??;

        if let Some(parent) = key_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let serialized = serde_json::to_vec_pretty(&credentials)?;
        tokio::fs::write(&key_path, serialized).await.context("saving ACME account credentials")?;

        Ok(account)
    }

    /// Run the full acquisition flow for one hostname.
    /// Returns the PEM-encoded certificate chain and private key.
    pub async fn acquire_certificate(
        &self,
        hostname: &str,
        settings: &AcmeSettings,
        staging: bool,
    ) -> Result<(String, String)> {
        let _guard = self.lock.lock().await;
        let step_timeout = Duration::from_secs(settings.step_timeout_secs);
        let directory_url = if staging {
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        } else {
            "https://acme-v02.api.letsencrypt.org/directory"
        };

        let account = self
            .load_or_register_account(
                directory_url,
                staging,
                settings.contact_email.as_deref(),
                step_timeout,
            )
            .await?;

        let identifier = Identifier::Dns(hostname.to_string());
        let mut order = timeout(
            step_timeout,
            account.new_order(&NewOrder {
                identifiers: &[identifier],
            }),
        )
        .await
        .context("ACME order creation timed out")??;

        let authorizations = timeout(step_timeout, order.authorizations())
            .await
            .context("fetching ACME authorizations timed out")??;

        for authz in &authorizations {
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .context("no HTTP-01 challenge offered for this order")?;

            let key_authorization = order.key_authorization(challenge);
            self.challenges
                .publish(challenge.token.clone(), key_authorization.as_str().to_string())
                .await;

            timeout(step_timeout, order.set_challenge_ready(&challenge.url))
                .await
                .context("notifying ACME server of challenge readiness timed out")??;
        }

        let poll_result = self.poll_order_ready(&mut order, step_timeout).await;

        for authz in &authorizations {
            if let Some(challenge) = authz.challenges.iter().find(|c| c.r#type == ChallengeType::Http01) {
                self.challenges.retract(&challenge.token).await;
            }
        }
        poll_result?;

        let private_key_pem = rcgen::KeyPair::generate().context("generating certificate keypair")?;
        let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()])
            .context("building certificate signing request params")?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params
            .serialize_request(&private_key_pem)
            .context("serializing CSR")?;

        timeout(step_timeout, order.finalize(csr.der()))
            .await
            .context("ACME order finalization timed out")??;

        let cert_chain_pem = self.poll_certificate(&mut order, step_timeout).await?;
        let private_key_pem = private_key_pem.serialize_pem();

        Ok((cert_chain_pem, private_key_pem))
    }

    async fn poll_order_ready(
        &self,
        order: &mut instant_acme::Order,
        step_timeout: Duration,
    ) -> Result<()> {
        for attempt in 0..24 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let state = timeout(step_timeout, order.refresh())
                .await
                .context("polling ACME order status timed out")??;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => anyhow::bail!("ACME order became invalid"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    debug!(attempt, status = ?state.status, "ACME order still pending");
                }
            }
        }
        anyhow::bail!("ACME order validation timed out after repeated polling")
    }

    async fn poll_certificate(
        &self,
        order: &mut instant_acme::Order,
        step_timeout: Duration,
    ) -> Result<String> {
        for attempt in 0..30 {
            let state = timeout(step_timeout, order.refresh())
                .await
                .context("polling ACME order status timed out")??;
            match state.status {
                OrderStatus::Valid => {
                    let pem = timeout(step_timeout, order.certificate())
                        .await
                        .context("downloading ACME certificate timed out")??
                        .context("certificate not yet available")?;
                    return Ok(pem);
                }
                OrderStatus::Invalid => anyhow::bail!("ACME order became invalid during finalization"),
                _ => {
                    debug!(attempt, status = ?state.status, "waiting for certificate");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        anyhow::bail!("timed out waiting for ACME certificate")
    }
}

/// Write `cert.pem`/`key.pem` atomically to `<statedir>/certs/<hostname>/`.
pub async fn write_certificate_files(
    certs_dir: &std::path::Path,
    hostname: &str,
    cert_chain_pem: &str,
    private_key_pem: &str,
) -> Result<(PathBuf, PathBuf)> {
    let host_dir = certs_dir.join(hostname);
    tokio::fs::create_dir_all(&host_dir).await?;

    let cert_path = host_dir.join("cert.pem");
    let key_path = host_dir.join("key.pem");

    atomic_write(&cert_path, cert_chain_pem.as_bytes(), 0o644).await?;
    atomic_write(&key_path, private_key_pem.as_bytes(), 0o600).await?;

    Ok((cert_path, key_path))
}

async fn atomic_write(path: &std::path::Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let parent = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(contents)?;
    tmp.as_file().set_permissions(std::fs::Permissions::from_mode(mode))?;
    tmp.persist(path).with_context(|| format!("persisting {}", path.display()))?;
    Ok(())
}