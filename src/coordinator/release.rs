//! Release-id resolution: "source-control short hash;
//! fall back to current epoch milliseconds if unavailable."
//!
//! Grounded on `rise-cli/src/deploy.rs`'s `handle_deploy()`, which shells
//! out rather than linking a git library for the same one-shot lookup.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::process::Command;
use tracing::debug;

use crate::model::Release;

/// Resolve the release id for `project_root`: `git rev-parse --short HEAD`
/// if the directory is inside a git work tree and the command succeeds,
/// else the current epoch-millisecond timestamp.
pub async fn resolve_release(project_root: &Path) -> Release {
    match git_short_hash(project_root).await {
        Some(hash) => Release::from_git_short_hash(hash),
        None => Release::from_epoch_millis(epoch_millis()),
    }
}

async fn git_short_hash(project_root: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(project_root)
        .arg("rev-parse")
        .arg("--short")
        .arg("HEAD")
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        debug!("not a git work tree or no commits yet, falling back to epoch-ms release id");
        return None;
    }

    let hash = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if hash.is_empty() {
        None
    } else {
        Some(hash)
    }
}

fn epoch_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_millis_is_monotonic_enough() {
        let a = epoch_millis();
        let b = epoch_millis();
        assert!(b >= a);
    }
}
