//! Local container daemon fallback
//!
//! When a reference cannot be resolved remotely (typical for images that
//! only exist in the developer's daemon), the image is exported with
//! `docker save` and loaded through the tarball path. The export is streamed
//! straight to disk so multi-gigabyte images never sit in memory.

use oci_distribution::manifest::OciImageManifest;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{OciError, Result};
use crate::layout::OciLayout;
use crate::tarball;

/// Export `reference` from the local daemon and load it into the layout.
pub async fn load_from_daemon(
    reference: &str,
    layout: &OciLayout,
    staging_dir: &Path,
) -> Result<OciImageManifest> {
    info!(reference, "falling back to the local container daemon");

    let binary = detect_daemon_cli();
    let tar_path = staging_dir.join(format!(
        "daemon-{}.tar",
        reference.replace(['/', ':', '@'], "-")
    ));

    let mut child = tokio::process::Command::new(binary)
        .args(["save", reference])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OciError::Daemon {
            reference: reference.to_string(),
            message: format!("failed to spawn {binary}: {e}"),
        })?;

    // Stream stdout to disk; buffering the whole export would OOM on large
    // images.
    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut out = tokio::fs::File::create(&tar_path).await?;
    tokio::io::copy(&mut stdout, &mut out).await?;
    out.flush().await?;

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let _ = tokio::fs::remove_file(&tar_path).await;
        return Err(OciError::Daemon {
            reference: reference.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let manifest = tarball::load_into_layout(&tar_path, layout)?;
    if let Err(e) = std::fs::remove_file(&tar_path) {
        warn!(path = %tar_path.display(), error = %e, "failed to remove daemon export");
    }
    Ok(manifest)
}

/// Prefer docker, fall back to podman.
fn detect_daemon_cli() -> &'static str {
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        if dir.join("docker").exists() {
            return "docker";
        }
    }
    "podman"
}
