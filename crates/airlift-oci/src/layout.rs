//! On-disk OCI image layout
//!
//! The staging format between pull and push: a directory with an
//! `oci-layout` marker, an `index.json` listing image manifests, and content
//! addressed blobs under `blobs/sha256/`. Concurrent savers append to the
//! index through a mutex; blob writes are naturally disjoint because they are
//! content addressed.

use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{OciError, Result};

/// Annotation carrying the reference an image was pulled from.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const LAYOUT_MARKER: &str = "{\"imageLayoutVersion\":\"1.0.0\"}\n";

/// `index.json` document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LayoutIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub manifests: Vec<OciDescriptor>,
}

/// A writable OCI layout rooted at a directory
pub struct OciLayout {
    root: PathBuf,
    // Serializes concurrent appends to index.json.
    index: Mutex<LayoutIndex>,
}

impl OciLayout {
    /// Create (or reopen) a layout at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs/sha256"))?;
        let marker = root.join("oci-layout");
        if !marker.exists() {
            std::fs::write(&marker, LAYOUT_MARKER)?;
        }

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let content = std::fs::read(&index_path)?;
            serde_json::from_slice(&content).map_err(|e| OciError::Layout {
                path: index_path.clone(),
                message: format!("invalid index.json: {e}"),
            })?
        } else {
            let index = LayoutIndex {
                schema_version: 2,
                manifests: Vec::new(),
            };
            std::fs::write(&index_path, serde_json::to_vec_pretty(&index)?)?;
            index
        };

        Ok(Self {
            root: root.to_path_buf(),
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob for a `sha256:<hex>` digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.root.join("blobs/sha256").join(hex)
    }

    /// True when the blob exists with the expected size.
    pub fn has_blob(&self, digest: &str, size: i64) -> bool {
        self.blob_path(digest)
            .metadata()
            .map(|m| m.len() == size as u64)
            .unwrap_or(false)
    }

    /// Write a blob from memory, returning its `sha256:` digest.
    pub fn write_blob(&self, data: &[u8]) -> Result<String> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        let path = self.blob_path(&digest);
        if !path.exists() {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, data)?;
            std::fs::rename(&tmp, &path)?;
        }
        Ok(digest)
    }

    /// Read a blob fully into memory.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.blob_path(digest))?)
    }

    /// Verify a blob's size against its descriptor.
    pub fn check_blob(&self, descriptor: &OciDescriptor) -> Result<()> {
        let len = self.blob_path(&descriptor.digest).metadata()?.len();
        if len != descriptor.size as u64 {
            return Err(OciError::BlobSize {
                digest: descriptor.digest.clone(),
                expected: descriptor.size,
                actual: len,
            });
        }
        Ok(())
    }

    /// Serialize an image manifest as a blob and append its descriptor to
    /// the index, annotated with the source reference.
    pub async fn append_image(
        &self,
        manifest: &OciImageManifest,
        source_ref: &str,
    ) -> Result<OciDescriptor> {
        let bytes = serde_json::to_vec(manifest)?;
        let digest = self.write_blob(&bytes)?;

        let descriptor = OciDescriptor {
            media_type: manifest
                .media_type
                .clone()
                .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_string()),
            digest,
            size: bytes.len() as i64,
            urls: None,
            annotations: Some(
                [(REF_NAME_ANNOTATION.to_string(), source_ref.to_string())]
                    .into_iter()
                    .collect(),
            ),
        };

        let mut index = self.index.lock().await;
        // Re-saves after a retry must not duplicate the entry.
        index
            .manifests
            .retain(|existing| existing.digest != descriptor.digest);
        index.manifests.push(descriptor.clone());
        std::fs::write(
            self.root.join("index.json"),
            serde_json::to_vec_pretty(&*index)?,
        )?;
        debug!(reference = source_ref, digest = %descriptor.digest, "appended image to layout index");
        Ok(descriptor)
    }

    /// Snapshot of the current index.
    pub async fn index(&self) -> LayoutIndex {
        self.index.lock().await.clone()
    }

    /// Load the image manifest a descriptor points at.
    pub fn read_manifest(&self, descriptor: &OciDescriptor) -> Result<OciImageManifest> {
        let bytes = self.read_blob(&descriptor.digest)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Rename every blob whose file name does not match the sha256 of its
    /// contents. Compensates for daemon-loaded images whose config blob is
    /// written under a stale name by the loading tooling. The sweep covers
    /// the whole blob dir unconditionally; narrowing it to daemon-loaded
    /// images risks missing mismatches.
    pub fn repair_blobs(&self) -> Result<usize> {
        let blob_dir = self.root.join("blobs/sha256");
        let mut repaired = 0;
        for entry in walkdir::WalkDir::new(&blob_dir).min_depth(1) {
            let entry = entry.map_err(|e| OciError::Layout {
                path: blob_dir.clone(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let actual = sha256_of_file(path)?;
            let named = entry.file_name().to_string_lossy().to_string();
            if named != actual {
                let correct = blob_dir.join(&actual);
                warn!(named, actual, "repairing mis-named blob");
                std::fs::rename(path, &correct)?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }
}

fn sha256_of_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest_for(config: &str, layers: &[(&str, i64)]) -> OciImageManifest {
        OciImageManifest {
            schema_version: 2,
            media_type: Some("application/vnd.oci.image.manifest.v1+json".to_string()),
            config: OciDescriptor {
                media_type: "application/vnd.oci.image.config.v1+json".to_string(),
                digest: config.to_string(),
                size: 2,
                urls: None,
                annotations: None,
            },
            layers: layers
                .iter()
                .map(|(digest, size)| OciDescriptor {
                    media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                    digest: digest.to_string(),
                    size: *size,
                    urls: None,
                    annotations: None,
                })
                .collect(),
            annotations: None,
            artifact_type: None,
        }
    }

    #[tokio::test]
    async fn append_is_deduplicated() {
        let temp = TempDir::new().unwrap();
        let layout = OciLayout::open(temp.path()).unwrap();
        let manifest = manifest_for("sha256:aa", &[]);

        layout.append_image(&manifest, "nginx:1.25").await.unwrap();
        layout.append_image(&manifest, "nginx:1.25").await.unwrap();

        assert_eq!(layout.index().await.manifests.len(), 1);
    }

    #[tokio::test]
    async fn reopen_preserves_index() {
        let temp = TempDir::new().unwrap();
        {
            let layout = OciLayout::open(temp.path()).unwrap();
            layout
                .append_image(&manifest_for("sha256:aa", &[]), "a:1")
                .await
                .unwrap();
        }
        let layout = OciLayout::open(temp.path()).unwrap();
        assert_eq!(layout.index().await.manifests.len(), 1);
    }

    #[test]
    fn blob_roundtrip_and_size_check() {
        let temp = TempDir::new().unwrap();
        let layout = OciLayout::open(temp.path()).unwrap();

        let digest = layout.write_blob(b"payload").unwrap();
        assert!(layout.has_blob(&digest, 7));
        assert!(!layout.has_blob(&digest, 8));
        assert_eq!(layout.read_blob(&digest).unwrap(), b"payload");
    }

    #[test]
    fn repair_renames_mismatched_blob() {
        let temp = TempDir::new().unwrap();
        let layout = OciLayout::open(temp.path()).unwrap();

        // A blob filed under the wrong name, as a daemon load produces.
        let wrong = temp.path().join("blobs/sha256/deadbeef");
        std::fs::write(&wrong, b"config-bytes").unwrap();

        let repaired = layout.repair_blobs().unwrap();
        assert_eq!(repaired, 1);
        assert!(!wrong.exists());

        let expected = hex::encode(Sha256::digest(b"config-bytes"));
        assert!(temp.path().join("blobs/sha256").join(expected).exists());
    }

    #[test]
    fn repair_leaves_correct_blobs_alone() {
        let temp = TempDir::new().unwrap();
        let layout = OciLayout::open(temp.path()).unwrap();
        layout.write_blob(b"good").unwrap();
        assert_eq!(layout.repair_blobs().unwrap(), 0);
    }
}
