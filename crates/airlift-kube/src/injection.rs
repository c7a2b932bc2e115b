//! Data injection
//!
//! Streams a local file or directory into a running container: wait for a
//! pod matching the target selector to be ready, exec `tar` in the receiving
//! container with the payload streamed over stdin, then write a sentinel
//! file next to the destination and poll until the container sees it.

use airlift_core::DataInjection;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::Client;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{KubeError, Result};

/// Sentinel file name marking a completed injection.
pub const INJECTION_SENTINEL: &str = ".airlift-injection-complete";

const POD_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SENTINEL_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Perform one data injection from an extracted component directory.
pub async fn inject(client: &Client, injection: &DataInjection, source_root: &Path) -> Result<()> {
    let target = &injection.target;
    let source = source_root.join(&injection.source);
    if !source.exists() {
        return Err(KubeError::Injection {
            namespace: target.namespace.clone(),
            selector: target.selector.clone(),
            message: format!("source payload {} does not exist", source.display()),
        });
    }

    let pods: Api<Pod> = Api::namespaced(client.clone(), &target.namespace);
    let pod = wait_for_ready_pod(&pods, &target.namespace, &target.selector).await?;
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default().to_string();
    info!(
        pod = %pod_name,
        container = %target.container,
        path = %target.path,
        "injecting data"
    );

    // The receiving path must exist before tar unpacks into it.
    let mkdir = format!("mkdir -p '{}'", target.path);
    exec_in_container(&pods, &pod_name, &target.container, &["sh", "-c", mkdir.as_str()])
        .await
        .map_err(|e| injection_error(injection, format!("failed to prepare target dir: {e}")))?;

    let payload = build_tar(&source, injection.compress)?;
    stream_tar(
        &pods,
        &pod_name,
        &target.container,
        &target.path,
        injection.compress,
        payload,
    )
    .await
    .map_err(|e| injection_error(injection, format!("tar stream failed: {e}")))?;

    // Mark completion and poll until the container observes the sentinel;
    // the receiving workload keys off the same file.
    let sentinel = format!("{}/{INJECTION_SENTINEL}", target.path.trim_end_matches('/'));
    let touch = format!("touch '{sentinel}'");
    exec_in_container(&pods, &pod_name, &target.container, &["sh", "-c", touch.as_str()])
        .await
        .map_err(|e| injection_error(injection, format!("failed to write sentinel: {e}")))?;

    let deadline = Instant::now() + SENTINEL_TIMEOUT;
    let probe = format!("test -f '{sentinel}'");
    loop {
        let seen =
            exec_in_container(&pods, &pod_name, &target.container, &["sh", "-c", probe.as_str()])
                .await
                .is_ok();
        if seen {
            debug!(pod = %pod_name, "injection confirmed");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(injection_error(
                injection,
                "sentinel never became visible".to_string(),
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn injection_error(injection: &DataInjection, message: String) -> KubeError {
    KubeError::Injection {
        namespace: injection.target.namespace.clone(),
        selector: injection.target.selector.clone(),
        message,
    }
}

/// Wait until a pod matching the selector is Ready.
async fn wait_for_ready_pod(pods: &Api<Pod>, namespace: &str, selector: &str) -> Result<Pod> {
    let deadline = Instant::now() + POD_WAIT_TIMEOUT;
    let params = ListParams::default().labels(selector);

    loop {
        let list = pods.list(&params).await?;
        if let Some(pod) = list.items.into_iter().find(is_pod_ready) {
            return Ok(pod);
        }
        if Instant::now() >= deadline {
            return Err(KubeError::Injection {
                namespace: namespace.to_string(),
                selector: selector.to_string(),
                message: "no ready pod matched the selector".to_string(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Tar up the payload in memory; directories recurse, single files land at
/// the archive root.
fn build_tar(source: &Path, compress: bool) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut raw);
        if source.is_dir() {
            builder.append_dir_all(".", source)?;
        } else {
            let name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "payload".to_string());
            let mut file = std::fs::File::open(source)?;
            builder.append_file(name, &mut file)?;
        }
        builder.finish()?;
    }

    if compress {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    } else {
        Ok(raw)
    }
}

/// Exec `tar` in the container and feed it the payload over stdin.
async fn stream_tar(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    dest: &str,
    compressed: bool,
    payload: Vec<u8>,
) -> Result<()> {
    let flags = if compressed { "-xzf" } else { "-xf" };
    let params = AttachParams::default()
        .container(container)
        .stdin(true)
        .stdout(false)
        .stderr(true);

    let mut process = pods
        .exec(pod, ["tar", flags, "-", "-C", dest], &params)
        .await?;

    let mut stdin = process
        .stdin()
        .ok_or_else(|| KubeError::Apply("exec stdin unavailable".to_string()))?;
    stdin.write_all(&payload).await?;
    stdin.flush().await?;
    drop(stdin);

    process
        .join()
        .await
        .map_err(|e| KubeError::Apply(format!("tar exec did not complete: {e}")))?;
    Ok(())
}

/// Exec a command and require exit success.
async fn exec_in_container(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    command: &[&str],
) -> Result<()> {
    let params = AttachParams::default()
        .container(container)
        .stdin(false)
        .stdout(true)
        .stderr(true);

    let mut process = pods.exec(pod, command.iter().copied(), &params).await?;
    let status = process.take_status();
    process
        .join()
        .await
        .map_err(|e| KubeError::Apply(format!("exec did not complete: {e}")))?;

    if let Some(status_future) = status {
        if let Some(status) = status_future.await {
            if status.status.as_deref() == Some("Failure") {
                return Err(KubeError::Apply(
                    status.message.unwrap_or_else(|| "exec failed".to_string()),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tar_of_directory_contains_entries() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("seed.sql"), b"select 1;").unwrap();

        let raw = build_tar(temp.path(), false).unwrap();
        let mut archive = tar::Archive::new(std::io::Cursor::new(raw));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("seed.sql")));
    }

    #[test]
    fn compressed_tar_is_gzip() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("f"), b"x").unwrap();
        let gz = build_tar(temp.path(), true).unwrap();
        assert_eq!(&gz[..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn pod_readiness_requires_ready_condition() {
        let ready: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }))
        .unwrap();
        assert!(is_pod_ready(&ready));

        let pending: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "p"},
            "status": {"conditions": [{"type": "Ready", "status": "False"}]}
        }))
        .unwrap();
        assert!(!is_pod_ready(&pending));
    }
}
