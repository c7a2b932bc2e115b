//! Image pull pipeline
//!
//! Staging images into the on-disk OCI layout happens in two bounded
//! phases. The info-fetch phase resolves every reference to a concrete
//! single-platform manifest (rejecting ambiguous index digests and falling
//! back to the local daemon for refs the registries do not know). The save
//! phase writes blobs into the layout, first with a concurrent strategy and
//! then sequentially for whatever the concurrent pass could not finish.
//! Completed images are dropped from the retry set, so partial progress is
//! never repeated.

use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{only_image_layers, LayerCache};
use crate::error::{OciError, Result};
use crate::layout::OciLayout;
use crate::reference::ImageRef;
use crate::{daemon, tarball};

/// Workers per phase; matches the save and fetch pool sizes.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Attempts per save strategy.
const SAVE_ATTEMPTS: u32 = 2;

/// Configuration for a pull run
pub struct PullConfig {
    /// Image references as the bundle listed them
    pub images: Vec<String>,
    /// Layout destination directory
    pub destination: PathBuf,
    /// Shared layer cache; disabled when `None`
    pub cache_dir: Option<PathBuf>,
    /// Registry-prefix rewrites applied before resolution
    pub registry_overrides: HashMap<String, String>,
    /// Platform architecture used to disambiguate bare-tag index refs
    pub arch: String,
    /// Talk plain HTTP to registries
    pub plain_http: bool,
    /// Skip TLS certificate verification
    pub insecure_skip_tls: bool,
    /// Registry credentials
    pub auth: RegistryAuth,
    /// Bounded worker count for both phases
    pub concurrency: usize,
}

impl PullConfig {
    pub fn new(images: Vec<String>, destination: PathBuf, arch: &str) -> Self {
        Self {
            images,
            destination,
            cache_dir: None,
            registry_overrides: HashMap::new(),
            arch: arch.to_string(),
            plain_http: false,
            insecure_skip_tls: false,
            auth: RegistryAuth::Anonymous,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// A successfully staged image
#[derive(Debug, Clone)]
pub struct PulledImage {
    pub image: ImageRef,
    pub manifest: OciImageManifest,
    /// manifest + config + layers, for progress accounting
    pub total_bytes: i64,
}

/// Where a resolved image's bytes come from
enum ImageSource {
    Remote {
        reference: Reference,
        manifest: OciImageManifest,
    },
    Tarball {
        path: PathBuf,
    },
    Daemon,
}

struct ResolvedImage {
    image: ImageRef,
    source: ImageSource,
}

/// Pull every configured image into the destination layout.
pub async fn pull(config: PullConfig) -> Result<Vec<PulledImage>> {
    let layout = Arc::new(OciLayout::open(&config.destination)?);
    let cache = match &config.cache_dir {
        Some(dir) => Some(Arc::new(LayerCache::new(dir)?)),
        None => None,
    };
    let client = Arc::new(Client::new(ClientConfig {
        protocol: if config.plain_http {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        },
        accept_invalid_certificates: config.insecure_skip_tls,
        ..Default::default()
    }));

    info!(count = config.images.len(), "fetching image info");
    let resolved = fetch_info(&config, client.clone()).await?;

    let total: i64 = resolved
        .iter()
        .map(|r| match &r.source {
            ImageSource::Remote { manifest, .. } => size_of(manifest),
            _ => 0,
        })
        .sum();
    info!(count = resolved.len(), bytes = total, "pulling images");

    // Concurrent save with retries; whatever is left falls back to the
    // sequential strategy with its own retries.
    let mut remaining: Vec<ResolvedImage> = resolved;
    let mut saved: Vec<PulledImage> = Vec::new();

    let mut attempt = 0;
    while !remaining.is_empty() && attempt < SAVE_ATTEMPTS {
        attempt += 1;
        let (done, failed) = save_concurrent(
            &config,
            client.clone(),
            layout.clone(),
            cache.clone(),
            remaining,
        )
        .await;
        saved.extend(done);
        remaining = failed;
        if !remaining.is_empty() {
            warn!(
                remaining = remaining.len(),
                attempt, "concurrent save left images behind, retrying"
            );
        }
    }

    if !remaining.is_empty() {
        warn!(
            remaining = remaining.len(),
            "falling back to sequential image save"
        );
        let mut attempt = 0;
        while !remaining.is_empty() && attempt < SAVE_ATTEMPTS {
            attempt += 1;
            let mut failed = Vec::new();
            let mut last_error = None;
            for image in remaining {
                match save_one(&config, &client, &layout, cache.as_deref(), &image).await {
                    Ok(pulled) => saved.push(pulled),
                    Err(e) => {
                        warn!(image = %image.image, error = %e, "sequential save failed");
                        last_error = Some(e);
                        failed.push(image);
                    }
                }
            }
            remaining = failed;
            if !remaining.is_empty() && attempt == SAVE_ATTEMPTS {
                return Err(last_error.expect("failed images imply an error"));
            }
        }
    }

    // Compensates for daemon-loaded configs filed under stale names.
    let repaired = layout.repair_blobs()?;
    if repaired > 0 {
        debug!(repaired, "repaired mis-named layout blobs");
    }

    Ok(saved)
}

/// Phase 1: resolve every reference, bounded by the worker pool.
async fn fetch_info(config: &PullConfig, client: Arc<Client>) -> Result<Vec<ResolvedImage>> {
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut join_set: JoinSet<Result<(usize, ResolvedImage)>> = JoinSet::new();

    for (position, original) in config.images.iter().enumerate() {
        let image = ImageRef::new(original, &config.registry_overrides);
        let client = client.clone();
        let semaphore = semaphore.clone();
        let auth = config.auth.clone();
        let arch = config.arch.clone();

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            debug!(image = %image, "fetching image info");

            if image.is_tarball() {
                let path = PathBuf::from(&image.effective);
                return Ok((
                    position,
                    ResolvedImage {
                        image,
                        source: ImageSource::Tarball { path },
                    },
                ));
            }

            match resolve_remote(&client, &auth, &image, &arch).await {
                Ok((reference, manifest)) => Ok((
                    position,
                    ResolvedImage {
                        image,
                        source: ImageSource::Remote {
                            reference,
                            manifest,
                        },
                    },
                )),
                // Integrity errors and exhausted rate limits must not
                // degrade into a daemon load.
                Err(e @ OciError::IndexRejected { .. })
                | Err(e @ OciError::PlatformNotFound { .. })
                | Err(e @ OciError::InvalidReference { .. })
                | Err(e @ OciError::RateLimited { .. }) => Err(e),
                Err(e) => {
                    warn!(image = %image, error = %e, "remote resolution failed, will try the local daemon");
                    Ok((
                        position,
                        ResolvedImage {
                            image,
                            source: ImageSource::Daemon,
                        },
                    ))
                }
            }
        });
    }

    let mut resolved: Vec<Option<ResolvedImage>> = Vec::new();
    resolved.resize_with(config.images.len(), || None);
    while let Some(result) = join_set.join_next().await {
        let (position, image) = result.expect("info-fetch task panicked")?;
        resolved[position] = Some(image);
    }
    Ok(resolved.into_iter().flatten().collect())
}

/// Resolve a remote reference to a single-platform manifest, retrying
/// transient registry failures.
async fn resolve_remote(
    client: &Client,
    auth: &RegistryAuth,
    image: &ImageRef,
    arch: &str,
) -> Result<(Reference, OciImageManifest)> {
    let reference = image.parsed()?;

    let manifest = fetch_manifest_with_retry(client, auth, &reference, image).await?;
    match manifest {
        OciManifest::Image(manifest) => Ok((reference, manifest)),
        OciManifest::ImageIndex(index) => {
            if image.has_digest() {
                // The bundle pinned an index digest: there is no platform to
                // select implicitly, so enumerate the choices and abort.
                let name = format!("{}/{}", reference.registry(), reference.repository());
                let options = index
                    .manifests
                    .iter()
                    .map(|entry| {
                        let platform = entry
                            .platform
                            .as_ref()
                            .map(|p| format!("{}/{}", p.os, p.architecture))
                            .unwrap_or_else(|| "unknown".to_string());
                        format!("{name}@{} ({platform})", entry.digest)
                    })
                    .collect();
                return Err(OciError::IndexRejected {
                    reference: image.original.clone(),
                    options,
                });
            }

            let entry = index
                .manifests
                .iter()
                .find(|entry| {
                    entry
                        .platform
                        .as_ref()
                        .map(|p| p.architecture == arch && p.os == "linux")
                        .unwrap_or(false)
                })
                .ok_or_else(|| OciError::PlatformNotFound {
                    reference: image.original.clone(),
                    platform: format!("linux/{arch}"),
                })?;

            let pinned = Reference::with_digest(
                reference.registry().to_string(),
                reference.repository().to_string(),
                entry.digest.clone(),
            );
            match fetch_manifest_with_retry(client, auth, &pinned, image).await? {
                OciManifest::Image(manifest) => Ok((pinned, manifest)),
                OciManifest::ImageIndex(_) => Err(OciError::Registry {
                    reference: image.original.clone(),
                    message: "index entry resolved to another index".to_string(),
                }),
            }
        }
    }
}

async fn fetch_manifest_with_retry(
    client: &Client,
    auth: &RegistryAuth,
    reference: &Reference,
    image: &ImageRef,
) -> Result<OciManifest> {
    let mut last = None;
    for attempt in 1..=3u32 {
        match client.pull_manifest(reference, auth).await {
            Ok((manifest, _digest)) => return Ok(manifest),
            Err(e) => {
                let error = classify_registry_error(&image.original, &e.to_string());
                if error.is_transient() && attempt < 3 {
                    warn!(image = %image, attempt, error = %error, "manifest fetch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    last = Some(error);
                    continue;
                }
                return Err(error);
            }
        }
    }
    Err(last.expect("loop exits via return"))
}

fn classify_registry_error(reference: &str, message: &str) -> OciError {
    if message.contains("429") || message.contains("Too Many Requests") {
        OciError::RateLimited {
            reference: reference.to_string(),
        }
    } else {
        OciError::Registry {
            reference: reference.to_string(),
            message: message.to_string(),
        }
    }
}

/// Phase 2, concurrent strategy: save each image under the bounded pool.
/// Returns the images that made it and the ones to retry.
async fn save_concurrent(
    config: &PullConfig,
    client: Arc<Client>,
    layout: Arc<OciLayout>,
    cache: Option<Arc<LayerCache>>,
    images: Vec<ResolvedImage>,
) -> (Vec<PulledImage>, Vec<ResolvedImage>) {
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut join_set: JoinSet<std::result::Result<PulledImage, ResolvedImage>> = JoinSet::new();
    let auth = config.auth.clone();

    for image in images {
        let client = client.clone();
        let layout = layout.clone();
        let cache = cache.clone();
        let semaphore = semaphore.clone();
        let auth = auth.clone();

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            match save_resolved(&client, &layout, cache.as_deref(), &auth, &image).await {
                Ok(pulled) => Ok(pulled),
                Err(e) => {
                    warn!(image = %image.image, error = %e, "concurrent save failed");
                    Err(image)
                }
            }
        });
    }

    let mut done = Vec::new();
    let mut failed = Vec::new();
    while let Some(result) = join_set.join_next().await {
        match result.expect("save task panicked") {
            Ok(pulled) => done.push(pulled),
            Err(image) => failed.push(image),
        }
    }
    (done, failed)
}

async fn save_one(
    config: &PullConfig,
    client: &Client,
    layout: &OciLayout,
    cache: Option<&LayerCache>,
    image: &ResolvedImage,
) -> Result<PulledImage> {
    save_resolved(client, layout, cache, &config.auth, image).await
}

/// Save a single resolved image into the layout.
async fn save_resolved(
    client: &Client,
    layout: &OciLayout,
    cache: Option<&LayerCache>,
    auth: &RegistryAuth,
    resolved: &ResolvedImage,
) -> Result<PulledImage> {
    let manifest = match &resolved.source {
        ImageSource::Tarball { path } => tarball::load_into_layout(path, layout)?,
        ImageSource::Daemon => {
            daemon::load_from_daemon(&resolved.image.effective, layout, layout.root()).await?
        }
        ImageSource::Remote {
            reference,
            manifest,
        } => {
            let result =
                save_remote_blobs(client, layout, cache, auth, reference, manifest).await;
            if let Err(e) = result {
                // Do not let torn cache entries poison the retry.
                if let Some(cache) = cache {
                    if let Err(cleanup) = cache.cleanup_in_progress(&manifest.layers) {
                        warn!(error = %cleanup, "failed to clean up in-progress layers");
                    }
                }
                return Err(e);
            }
            manifest.clone()
        }
    };
    layout
        .append_image(&manifest, &resolved.image.original)
        .await?;
    let total_bytes = size_of(&manifest);
    debug!(image = %resolved.image, bytes = total_bytes, "image saved");

    Ok(PulledImage {
        image: resolved.image.clone(),
        manifest,
        total_bytes,
    })
}

/// Fetch config and layer blobs for a remote image into the layout,
/// routing shareable layers through the cache.
async fn save_remote_blobs(
    client: &Client,
    layout: &OciLayout,
    cache: Option<&LayerCache>,
    auth: &RegistryAuth,
    reference: &Reference,
    manifest: &OciImageManifest,
) -> Result<()> {
    let cacheable = only_image_layers(&manifest.layers);

    for layer in &manifest.layers {
        if layout.has_blob(&layer.digest, layer.size) {
            continue;
        }
        let target = layout.blob_path(&layer.digest);

        if let Some(cached) = cache.filter(|_| cacheable).and_then(|c| c.lookup(layer)) {
            tokio::fs::copy(&cached, &target).await?;
            continue;
        }

        let mut out = tokio::fs::File::create(&target).await?;
        client
            .pull_blob(reference, layer, &mut out)
            .await
            .map_err(|e| classify_registry_error(&reference.whole(), &e.to_string()))?;
        layout.check_blob(layer)?;

        if cacheable {
            if let Some(cache) = cache {
                cache.admit(layer, &target)?;
            }
        }
    }

    if !layout.has_blob(&manifest.config.digest, manifest.config.size) {
        let target = layout.blob_path(&manifest.config.digest);
        let mut out = tokio::fs::File::create(&target).await?;
        client
            .pull_blob(reference, &manifest.config, &mut out)
            .await
            .map_err(|e| classify_registry_error(&reference.whole(), &e.to_string()))?;
        layout.check_blob(&manifest.config)?;
    }

    Ok(())
}

/// manifest + config + layers, mirroring what progress reporting counts.
fn size_of(manifest: &OciImageManifest) -> i64 {
    let manifest_bytes = serde_json::to_vec(manifest).map(|b| b.len() as i64).unwrap_or(0);
    manifest_bytes
        + manifest.config.size
        + manifest.layers.iter().map(|l| l.size).sum::<i64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_classification() {
        let err = classify_registry_error("nginx:1.25", "unexpected status code 429 Too Many Requests");
        assert!(matches!(err, OciError::RateLimited { .. }));
        assert!(err.is_transient());

        let err = classify_registry_error("nginx:1.25", "manifest unknown");
        assert!(matches!(err, OciError::Registry { .. }));
    }

    #[test]
    fn size_accounts_manifest_config_and_layers() {
        let manifest = OciImageManifest {
            schema_version: 2,
            media_type: Some("application/vnd.oci.image.manifest.v1+json".to_string()),
            config: oci_distribution::manifest::OciDescriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                digest: "sha256:c".to_string(),
                size: 100,
                urls: None,
                annotations: None,
            },
            layers: vec![oci_distribution::manifest::OciDescriptor {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                digest: "sha256:l".to_string(),
                size: 900,
                urls: None,
                annotations: None,
            }],
            artifact_type: None,
            annotations: None,
        };
        assert!(size_of(&manifest) > 1000);
    }
}
