//! Bundle source resolution
//!
//! Turns a source locator into a verified, extracted bundle tree inside the
//! deploy's scoped temp directory:
//! - local archive paths, including the `.part000` head of a split archive
//! - `oci://` references to bundles published as OCI artifacts
//!
//! Every path ends the same way: checksum verification over the extracted
//! tree, signature policy enforcement, shasum comparison and descriptor
//! parsing (with migrations applied).

use airlift_core::{archive, load_bundle, signing, Bundle, Checksums};
use minisign::PublicKey;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{DeployError, Result};

/// Annotation naming a bundle artifact layer's file.
const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// How the bundle bytes reach this machine
#[derive(Debug, Clone)]
pub enum BundleSource {
    /// A bundle archive (or `.part000` header) on disk
    Archive(PathBuf),
    /// A bundle published as an OCI artifact
    Oci(String),
}

impl BundleSource {
    /// Classify the CLI's source argument.
    pub fn parse(source: &str) -> Result<Self> {
        if let Some(reference) = source.strip_prefix("oci://") {
            return Ok(Self::Oci(reference.to_string()));
        }
        let path = PathBuf::from(source);
        if !path.exists() {
            return Err(DeployError::SourceNotFound {
                path: source.to_string(),
            });
        }
        Ok(Self::Archive(path))
    }
}

/// Integrity inputs supplied by the user
#[derive(Default)]
pub struct VerifyOptions {
    /// Public key for signed bundles
    pub public_key: Option<PublicKey>,
    /// Expected sha256 of `checksums.txt` (the bundle shasum)
    pub shasum: Option<String>,
    /// Plain-HTTP registries for `oci://` sources
    pub plain_http: bool,
    /// Skip TLS verification for `oci://` sources
    pub insecure_skip_tls: bool,
}

/// The extracted and verified bundle
#[derive(Debug)]
pub struct LoadedBundle {
    /// Extraction root inside the deploy temp dir
    pub root: PathBuf,
    /// Parsed, migrated descriptor
    pub bundle: Bundle,
}

/// Resolve, extract and verify a bundle into `workdir`.
pub async fn load(source: &BundleSource, workdir: &Path, verify: &VerifyOptions) -> Result<LoadedBundle> {
    let root = workdir.join("bundle");
    std::fs::create_dir_all(&root)?;

    match source {
        BundleSource::Archive(path) => {
            let archive_path = if archive::is_multipart(path) {
                info!(path = %path.display(), "reassembling split archive");
                archive::reassemble(path)?
            } else {
                path.clone()
            };
            archive::extract(&archive_path, &root)?;
        }
        BundleSource::Oci(reference) => {
            pull_oci_bundle(reference, &root, verify).await?;
        }
    }

    verify_tree(&root, verify)?;
    let bundle = load_bundle(&root)?;
    info!(
        bundle = %bundle.metadata.name,
        kind = %bundle.kind,
        components = bundle.components.len(),
        "bundle loaded"
    );
    Ok(LoadedBundle { root, bundle })
}

/// Checksums first, then the signature over the checksum manifest, then the
/// user-supplied shasum, so every failure names the strongest applicable
/// guarantee.
fn verify_tree(root: &Path, verify: &VerifyOptions) -> Result<()> {
    let checksums_path = root.join(airlift_core::CHECKSUMS_FILE);
    let content = std::fs::read_to_string(&checksums_path).map_err(|_| {
        airlift_core::CoreError::BundleNotFound {
            path: checksums_path.display().to_string(),
        }
    })?;
    let checksums = Checksums::parse(&content)?;
    checksums.verify_tree(root)?;
    debug!(files = checksums.entries.len(), "checksums verified");

    signing::enforce_policy(root, verify.public_key.as_ref())?;

    if let Some(expected) = &verify.shasum {
        let actual = airlift_core::sha256_bytes(content.as_bytes());
        if &actual != expected {
            return Err(airlift_core::CoreError::ChecksumMismatch {
                path: airlift_core::CHECKSUMS_FILE.to_string(),
                expected: expected.clone(),
                actual,
            }
            .into());
        }
    }
    Ok(())
}

/// Pull a bundle artifact's layers into `root`, one file per layer, named by
/// the title annotation.
async fn pull_oci_bundle(reference: &str, root: &Path, verify: &VerifyOptions) -> Result<()> {
    let parsed = Reference::try_from(reference).map_err(|e| DeployError::BundlePull {
        reference: reference.to_string(),
        message: e.to_string(),
    })?;

    let client = Client::new(ClientConfig {
        protocol: if verify.plain_http {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        },
        accept_invalid_certificates: verify.insecure_skip_tls,
        ..Default::default()
    });

    info!(reference, "pulling bundle artifact");
    let data = client
        .pull(&parsed, &RegistryAuth::Anonymous, vec!["*/*"])
        .await
        .map_err(|e| DeployError::BundlePull {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;

    for layer in &data.layers {
        let name = layer
            .annotations
            .as_ref()
            .and_then(|a| a.get(TITLE_ANNOTATION))
            .cloned()
            .ok_or_else(|| DeployError::BundlePull {
                reference: reference.to_string(),
                message: "bundle layer missing title annotation".to_string(),
            })?;

        let path = root.join(&name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &layer.data)?;
        debug!(layer = %name, bytes = layer.data.len(), "bundle layer written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::sha256_bytes;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = "kind: AppConfig\nmetadata:\n  name: demo\ncomponents:\n  - name: web\n    required: true\n";

    fn write_bundle_archive(dir: &Path) -> PathBuf {
        let content = DESCRIPTOR.as_bytes();
        let checksums = format!("{}  airlift.yaml\n", sha256_bytes(content));

        let tar_path = dir.join("demo.tar");
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in [
            ("airlift.yaml", content),
            ("checksums.txt", checksums.as_bytes()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.into_inner().unwrap();
        tar_path
    }

    #[tokio::test]
    async fn local_archive_loads_and_verifies() {
        let temp = TempDir::new().unwrap();
        let tar_path = write_bundle_archive(temp.path());
        let source = BundleSource::parse(tar_path.to_str().unwrap()).unwrap();

        let loaded = load(&source, temp.path(), &VerifyOptions::default())
            .await
            .unwrap();
        assert_eq!(loaded.bundle.metadata.name, "demo");
        assert!(loaded.root.join("airlift.yaml").exists());
    }

    #[tokio::test]
    async fn tampered_archive_rejected() {
        let temp = TempDir::new().unwrap();
        let tar_path = write_bundle_archive(temp.path());

        let loaded_dir = temp.path().join("work");
        std::fs::create_dir_all(&loaded_dir).unwrap();
        // Extract then corrupt, then verify the tree directly.
        archive::extract(&tar_path, &loaded_dir.join("bundle")).unwrap();
        std::fs::write(loaded_dir.join("bundle/airlift.yaml"), "kind: AppConfig\nmetadata:\n  name: evil\n").unwrap();

        let err = verify_tree(&loaded_dir.join("bundle"), &VerifyOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            DeployError::Core(airlift_core::CoreError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_shasum_rejected() {
        let temp = TempDir::new().unwrap();
        let tar_path = write_bundle_archive(temp.path());
        let source = BundleSource::parse(tar_path.to_str().unwrap()).unwrap();

        let verify = VerifyOptions {
            shasum: Some("deadbeef".to_string()),
            ..Default::default()
        };
        let err = load(&source, temp.path(), &verify).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::Core(airlift_core::CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_source_rejected() {
        let err = BundleSource::parse("/nope/nothing.tar").unwrap_err();
        assert!(matches!(err, DeployError::SourceNotFound { .. }));
    }
}
