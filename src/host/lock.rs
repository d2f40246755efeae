//! Per-container-name and per-deployment keyed locks.
//!
//! Two layers, matching the `Arc<Mutex<HashMap<...>>>` idiom
//! `server/deployment/controller/docker.rs`'s `PortAllocator` uses for a
//! shared counter: an in-process keyed mutex guards concurrent operations
//! from this one coordinator process, and a remote `mkdir`-based lockfile
//! (atomic on any POSIX filesystem, unlike `test -e && touch`) guards
//! against a second coordinator invocation targeting the same
//! project/app/host.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;

use crate::host::executor::HostExecutor;

#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

/// Held for the duration of one deployment to one project/app on one host.
/// Dropping it releases the in-process guard; the remote lockfile is
/// removed explicitly by [`DeployLock::release`] (best-effort on drop is not
/// possible for the remote side since cleanup requires an async SSH round
/// trip).
pub struct DeployLock {
    _local_guard: tokio::sync::OwnedMutexGuard<()>,
    lock_path: String,
    released: bool,
}

impl DeployLock {
    /// Acquire the lock for `<project>-<app>` on this host: creates a
    /// remote lock directory with `mkdir` (atomic — fails if it already
    /// exists) under the state directory, after taking the matching
    /// in-process mutex.
    pub async fn acquire(
        executor: &HostExecutor,
        locks: &KeyedLocks,
        project: &str,
        app: &str,
    ) -> Result<Self> {
        let key = format!("{project}-{app}");
        let mutex = locks.lock_for(&key).await;
        let guard = mutex
            .try_lock_owned()
            .map_err(|_| anyhow::anyhow!("deployment already in progress for '{key}' on this host (local)"))?;

        let lock_path = format!("/tmp/iop-deploy-{key}.lock");
        let output = executor
            .exec("mkdir", &[&lock_path])
            .await
            .context("creating remote deployment lockfile")?;
        if !output.success {
            bail!("deployment already in progress for '{key}' on this host (remote lock held)");
        }

        Ok(Self {
            _local_guard: guard,
            lock_path,
            released: false,
        })
    }

    pub async fn release(mut self, executor: &HostExecutor) -> Result<()> {
        executor.exec("rmdir", &[&self.lock_path]).await?;
        self.released = true;
        Ok(())
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                lock_path = %self.lock_path,
                "deploy lock dropped without explicit release; remote lockfile left in place"
            );
        }
    }
}
