//! Push staged images into the cluster registry
//!
//! Reads the layout index written by the pull phase, rewrites each image's
//! reference into the cluster registry namespace and pushes it with bounded
//! parallelism. Pushes are idempotent: registries deduplicate blobs by
//! digest, so re-entry after a partial failure only moves the missing bytes.

use oci_distribution::client::{Client, ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::secrets::RegistryAuth;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{OciError, Result};
use crate::layout::{OciLayout, REF_NAME_ANNOTATION};
use crate::reference::ImageRef;

/// Configuration for pushing a layout into the cluster registry
pub struct PushConfig {
    /// `host:port` of the cluster registry
    pub registry: String,
    /// Registry credentials
    pub auth: RegistryAuth,
    /// Talk plain HTTP (the in-cluster registry usually is)
    pub plain_http: bool,
    /// Skip TLS certificate verification
    pub insecure_skip_tls: bool,
    /// Attempts per image
    pub retries: u32,
    /// Bounded worker count
    pub concurrency: usize,
}

impl PushConfig {
    pub fn new(registry: &str) -> Self {
        Self {
            registry: registry.to_string(),
            auth: RegistryAuth::Anonymous,
            plain_http: true,
            insecure_skip_tls: false,
            retries: 3,
            concurrency: crate::pull::DEFAULT_CONCURRENCY,
        }
    }
}

/// A pushed image: original reference and its in-cluster rewrite.
#[derive(Debug, Clone)]
pub struct PushedImage {
    pub original: String,
    pub target: String,
}

/// Push every image in the layout to the cluster registry.
pub async fn push(layout_dir: &Path, config: &PushConfig) -> Result<Vec<PushedImage>> {
    let layout = Arc::new(OciLayout::open(layout_dir)?);
    let index = layout.index().await;
    if index.manifests.is_empty() {
        return Ok(Vec::new());
    }
    info!(
        count = index.manifests.len(),
        registry = %config.registry,
        "pushing images to cluster registry"
    );

    let client = Arc::new(Client::new(ClientConfig {
        protocol: if config.plain_http {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        },
        accept_invalid_certificates: config.insecure_skip_tls,
        ..Default::default()
    }));

    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut join_set: JoinSet<Result<PushedImage>> = JoinSet::new();

    for descriptor in index.manifests {
        let original = descriptor
            .annotations
            .as_ref()
            .and_then(|a| a.get(REF_NAME_ANNOTATION))
            .cloned()
            .ok_or_else(|| OciError::Layout {
                path: layout_dir.to_path_buf(),
                message: format!(
                    "index entry {} carries no source reference annotation",
                    descriptor.digest
                ),
            })?;

        let layout = layout.clone();
        let client = client.clone();
        let semaphore = semaphore.clone();
        let registry = config.registry.clone();
        let auth = config.auth.clone();
        let retries = config.retries.max(1);

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            push_one(&layout, &client, &auth, &registry, &original, &descriptor, retries).await
        });
    }

    let mut pushed = Vec::new();
    while let Some(result) = join_set.join_next().await {
        pushed.push(result.expect("push task panicked")?);
    }
    Ok(pushed)
}

async fn push_one(
    layout: &OciLayout,
    client: &Client,
    auth: &RegistryAuth,
    registry: &str,
    original: &str,
    descriptor: &oci_distribution::manifest::OciDescriptor,
    retries: u32,
) -> Result<PushedImage> {
    let manifest = layout.read_manifest(descriptor)?;
    let image = ImageRef::new(original, &std::collections::HashMap::new());
    let target = image.cluster_target(registry)?;

    // Assemble layers and config from the layout blobs.
    let mut layers = Vec::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        layout.check_blob(layer)?;
        layers.push(ImageLayer {
            data: layout.read_blob(&layer.digest)?,
            media_type: layer.media_type.clone(),
            annotations: None,
        });
    }
    let config_blob = Config {
        data: layout.read_blob(&manifest.config.digest)?,
        media_type: manifest.config.media_type.clone(),
        annotations: None,
    };

    let mut last_error = None;
    for attempt in 1..=retries {
        match client
            .push(&target, &layers, config_blob.clone(), auth, Some(manifest.clone()))
            .await
        {
            Ok(response) => {
                debug!(image = original, url = %response.manifest_url, "image pushed");
                return Ok(PushedImage {
                    original: original.to_string(),
                    target: target.whole(),
                });
            }
            Err(e) => {
                warn!(image = original, attempt, error = %e, "push attempt failed");
                last_error = Some(e.to_string());
                if attempt < retries {
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
            }
        }
    }

    Err(OciError::PushFailed {
        reference: original.to_string(),
        attempts: retries,
        message: last_error.unwrap_or_else(|| "unknown error".to_string()),
    })
}
