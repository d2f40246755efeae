//! Build collaborator: shells out to `docker build` once per app needing
//! a new image, streaming its output straight to the operator's terminal,
//! then captures `docker save` into memory for the host executor to
//! stream over SSH. No registry push is ever performed.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, instrument};

use crate::model::{BuildSpec, CoreError, ErrorKind, Release};

/// One locally built, tagged image ready for transfer.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub tag: String,
}

/// Build `<image>:<release>` from `build.context` (resolved relative to
/// `project_root`). Stdio is inherited so the operator sees the same
/// `docker build` output they'd see running it by hand.
#[instrument(skip(build), fields(image = %build.image))]
pub async fn build_image(project_root: &Path, build: &BuildSpec, release: &Release) -> Result<BuiltImage, CoreError> {
    let tag = release.tag(&build.image);
    let context = resolve_context(project_root, &build.context);

    let mut cmd = Command::new("docker");
    cmd.arg("build").arg("-t").arg(&tag);
    if let Some(dockerfile) = &build.dockerfile {
        cmd.arg("-f").arg(resolve_context(project_root, dockerfile));
    }
    cmd.arg(&context);

    info!(context = %context.display(), tag = %tag, "building image");
    let status = cmd
        .status()
        .await
        .map_err(|e| CoreError::from_anyhow(ErrorKind::Config, e.into(), format!("spawning docker build for '{tag}'")))?;

    if !status.success() {
        return Err(CoreError::new(
            ErrorKind::Config,
            format!("docker build failed for '{tag}' (exit {:?})", status.code()),
        ));
    }

    Ok(BuiltImage { tag })
}

/// `docker save <tag>`, captured into memory as an uncompressed tar. The
/// host executor gzip-compresses this in flight while streaming it to the
/// remote `docker load`.
#[instrument]
pub async fn save_image(tag: &str) -> Result<Vec<u8>, CoreError> {
    let output = Command::new("docker")
        .arg("save")
        .arg(tag)
        .output()
        .await
        .map_err(|e| CoreError::from_anyhow(ErrorKind::Config, e.into(), format!("spawning docker save for '{tag}'")))?;

    if !output.status.success() {
        return Err(CoreError::new(
            ErrorKind::Config,
            format!(
                "docker save failed for '{tag}': {}",
                String::from_utf8_lossy(&output.stderr)
            ),
        ));
    }

    Ok(output.stdout)
}

fn resolve_context(project_root: &Path, context: &str) -> PathBuf {
    let path = Path::new(context);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_context_against_project_root() {
        let root = Path::new("/srv/myproj");
        assert_eq!(resolve_context(root, "apps/web"), PathBuf::from("/srv/myproj/apps/web"));
        assert_eq!(resolve_context(root, "/abs/path"), PathBuf::from("/abs/path"));
    }
}
