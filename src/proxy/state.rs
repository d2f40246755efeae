//! State Store: durable, in-memory-first mapping of
//! hostname -> routing entry, plus ACME configuration, snapshotted to disk.
//!
//! Hostnames are globally unique, so the authoritative map is flat
//! (`hostname -> RoutingEntry`) rather than nested under project; each
//! entry still carries its own `project`/`app` fields for reporting and
//! project-scoped listing. All mutation methods take and return owned
//! copies, never references into the lock, matching the
//! `Arc<RwLock<HashMap<...>>>` idiom `server/auth/jwt.rs`'s `jwks_cache`
//! uses, and its "operations return copies" discipline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::model::{routing::validate_transition, CertificateState, CertificateStatus, RoutingEntry};

const SNAPSHOT_VERSION: u32 = 1;

/// On-disk snapshot envelope. `extra` preserves unknown fields across
/// versions, so older/newer writers round-trip a snapshot without
/// dropping fields they don't recognize.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<RoutingEntry>,
    acme_staging: bool,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, RoutingEntry>,
    acme_staging: bool,
}

pub struct StateStore {
    inner: RwLock<Inner>,
    dirty: AtomicBool,
    snapshot_path: PathBuf,
}

impl StateStore {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            dirty: AtomicBool::new(false),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Load a snapshot from disk if present.
    /// Certificate files referenced by an `active` entry that are missing
    /// or unparseable transition to `pending` (invariant 6).
    pub async fn load(snapshot_path: impl Into<PathBuf>) -> Result<Self> {
        let snapshot_path = snapshot_path.into();
        let store = Self::new(snapshot_path.clone());

        let raw = match fs::read(&snapshot_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no snapshot at {}, starting empty", snapshot_path.display());
                return Ok(store);
            }
            Err(e) => return Err(e).context("reading state snapshot"),
        };

        let snapshot: Snapshot =
            serde_json::from_slice(&raw).context("parsing state snapshot")?;
        if snapshot.version != SNAPSHOT_VERSION {
            warn!(
                "snapshot version {} differs from current {SNAPSHOT_VERSION}, loading best-effort",
                snapshot.version
            );
        }

        let mut inner = Inner {
            entries: HashMap::new(),
            acme_staging: snapshot.acme_staging,
        };

        for mut entry in snapshot.entries {
            if let Some(cert) = entry.certificate.as_mut() {
                if cert.state == CertificateState::Active && !certificate_files_valid(cert).await {
                    warn!(
                        hostname = %entry.hostname,
                        "certificate files missing or unparseable on restart, reverting to pending"
                    );
                    *cert = CertificateStatus::pending();
                }
            }
            entry.last_health_check = None;
            entry.healthy = false;
            inner.entries.insert(entry.hostname.clone(), entry);
        }

        *store.inner.write().await = inner;
        Ok(store)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Serialize to a temp file and rename atomically over the snapshot
    /// path.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let (entries, acme_staging) = {
            let inner = self.inner.read().await;
            (
                inner.entries.values().cloned().collect::<Vec<_>>(),
                inner.acme_staging,
            )
        };

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
            acme_staging,
            extra: serde_json::Map::new(),
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent).await.ok();
        }

        let mut tmp = tempfile::NamedTempFile::new_in(
            self.snapshot_path
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        )?;
        use std::io::Write;
        tmp.write_all(&bytes)?;
        tmp.persist(&self.snapshot_path)
            .context("renaming snapshot into place")?;
        debug!(path = %self.snapshot_path.display(), "state snapshot flushed");
        Ok(())
    }

    /// Long-running snapshot writer: flushes at most once per
    /// `interval_secs` while dirty.
    pub fn spawn_snapshot_writer(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if let Err(e) = self.flush().await {
                    warn!("snapshot flush failed (best-effort, retrying next tick): {e}");
                }
            }
        });
    }

    pub async fn staging(&self) -> bool {
        self.inner.read().await.acme_staging
    }

    pub async fn set_staging(&self, enabled: bool) {
        self.inner.write().await.acme_staging = enabled;
        self.mark_dirty();
    }

    /// Upsert a routing entry.
    pub async fn upsert(&self, entry: RoutingEntry) {
        let mut inner = self.inner.write().await;
        inner.entries.insert(entry.hostname.clone(), entry);
        drop(inner);
        self.mark_dirty();
    }

    /// Remove an entry. Returns the removed entry, if any.
    pub async fn remove(&self, hostname: &str) -> Option<RoutingEntry> {
        let removed = self.inner.write().await.entries.remove(hostname);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    pub async fn get(&self, hostname: &str) -> Option<RoutingEntry> {
        self.inner.read().await.entries.get(hostname).cloned()
    }

    pub async fn list(&self, project: Option<&str>) -> Vec<RoutingEntry> {
        let inner = self.inner.read().await;
        inner
            .entries
            .values()
            .filter(|e| project.is_none_or(|p| e.project == p))
            .cloned()
            .collect()
    }

    /// Atomic traffic switch: update only `target`. Returns an
    /// error if the hostname is unknown.
    pub async fn switch(&self, hostname: &str, new_target: &str) -> Result<RoutingEntry> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(hostname)
            .with_context(|| format!("no routing entry for host '{hostname}'"))?;
        entry.target = new_target.to_string();
        let updated = entry.clone();
        drop(inner);
        self.mark_dirty();
        Ok(updated)
    }

    pub async fn update_health(&self, hostname: &str, healthy: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(hostname)
            .with_context(|| format!("no routing entry for host '{hostname}'"))?;
        entry.healthy = healthy;
        entry.last_health_check = Some(Utc::now());
        drop(inner);
        self.mark_dirty();
        Ok(())
    }

    /// Validates the requested state transition against the certificate
    /// state machine before applying it (a no-op check when the entry has
    /// no certificate yet, e.g. the first `pending` set alongside a new
    /// `ssl_enabled` entry).
    pub async fn set_certificate(&self, hostname: &str, certificate: CertificateStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(hostname)
            .with_context(|| format!("no routing entry for host '{hostname}'"))?;
        if let Some(current) = &entry.certificate {
            validate_transition(current.state, certificate.state)?;
        }
        entry.certificate = Some(certificate);
        drop(inner);
        self.mark_dirty();
        Ok(())
    }

    /// All hostnames with a certificate not yet `active`/`failed` and due
    /// for an attempt, plus any `active` certificate due for renewal.
    pub async fn hostnames_due_for_acme(&self, now: chrono::DateTime<Utc>) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .entries
            .values()
            .filter(|e| e.ssl_enabled)
            .filter(|e| {
                let Some(cert) = &e.certificate else {
                    return false;
                };
                match cert.state {
                    CertificateState::Pending => true,
                    CertificateState::Acquiring | CertificateState::Renewing => {
                        cert.next_attempt.is_none_or(|next| next <= now)
                    }
                    CertificateState::Active => cert.needs_renewal(now),
                    CertificateState::Failed | CertificateState::Expired => false,
                }
            })
            .map(|e| e.hostname.clone())
            .collect()
    }
}

async fn certificate_files_valid(cert: &CertificateStatus) -> bool {
    let (Some(cert_file), Some(key_file)) = (&cert.cert_file, &cert.key_file) else {
        return false;
    };
    let Ok(cert_bytes) = fs::read(cert_file).await else {
        return false;
    };
    let Ok(key_bytes) = fs::read(key_file).await else {
        return false;
    };
    let mut cert_reader = std::io::Cursor::new(cert_bytes);
    let mut key_reader = std::io::Cursor::new(key_bytes);
    let certs_parse = rustls_pemfile::certs(&mut cert_reader).next().is_some();
    let key_parse = rustls_pemfile::private_key(&mut key_reader).is_ok();
    certs_parse && key_parse
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(hostname: &str) -> RoutingEntry {
        RoutingEntry {
            hostname: hostname.to_string(),
            target: "myproj-web:3000".to_string(),
            project: "myproj".to_string(),
            app: "web".to_string(),
            health_path: "/up".to_string(),
            ssl_enabled: true,
            ssl_redirect: true,
            forward_headers: true,
            response_timeout_secs: 30,
            certificate: Some(CertificateStatus::pending()),
            healthy: false,
            last_health_check: None,
        }
    }

    #[tokio::test]
    async fn set_certificate_rejects_illegal_transition() {
        let store = StateStore::new("/tmp/does-not-matter.json");
        store.upsert(sample_entry("example.com")).await;

        let mut active = CertificateStatus::pending();
        active.state = CertificateState::Active;
        // Pending -> Active skips Acquiring and must be rejected.
        assert!(store.set_certificate("example.com", active).await.is_err());
    }

    #[tokio::test]
    async fn set_certificate_allows_forced_renew_from_active() {
        let store = StateStore::new("/tmp/does-not-matter.json");
        let mut entry = sample_entry("example.com");
        entry.certificate = Some(CertificateStatus {
            state: CertificateState::Active,
            ..CertificateStatus::pending()
        });
        store.upsert(entry).await;

        let mut forced = CertificateStatus::pending();
        forced.state = CertificateState::Acquiring;
        assert!(store.set_certificate("example.com", forced).await.is_ok());
    }

    #[tokio::test]
    async fn switch_updates_only_target() {
        let store = StateStore::new("/tmp/does-not-matter.json");
        store.upsert(sample_entry("example.com")).await;
        let updated = store.switch("example.com", "myproj-web:4000").await.unwrap();
        assert_eq!(updated.target, "myproj-web:4000");
        assert_eq!(updated.project, "myproj");
        let listed = store.get("example.com").await.unwrap();
        assert_eq!(listed.target, "myproj-web:4000");
    }

    #[tokio::test]
    async fn switch_unknown_host_errors() {
        let store = StateStore::new("/tmp/does-not-matter.json");
        assert!(store.switch("nope.example.com", "x:1").await.is_err());
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        store.upsert(sample_entry("a.example.com")).await;
        store.upsert(sample_entry("b.example.com")).await;
        store.update_health("a.example.com", true).await.unwrap();
        store.flush().await.unwrap();

        let reloaded = StateStore::load(&path).await.unwrap();
        let mut before = store.list(None).await;
        let mut after = reloaded.list(None).await;
        before.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        after.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.hostname, a.hostname);
            assert_eq!(b.target, a.target);
            // last_health_check is re-derived, not part of the equality check.
        }
    }
}
