//! Filesystem layer cache
//!
//! Layers are cached by digest so repeated pulls of shared base images cost
//! one download. Only plain image layers are admitted; config blobs and
//! artifact layers bypass the cache because they are never shared across
//! images. Interrupted writes leave short files behind, which the cleanup
//! pass deletes by comparing file size against the declared layer size.

use oci_distribution::manifest::OciDescriptor;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;

/// Media types that qualify a blob for the shared layer cache.
const IMAGE_LAYER_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.oci.image.layer.v1.tar+zstd",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

/// True when every layer of a manifest is a plain image layer, i.e. the
/// whole image may pass through the cache.
pub fn only_image_layers(layers: &[OciDescriptor]) -> bool {
    layers
        .iter()
        .all(|l| IMAGE_LAYER_MEDIA_TYPES.contains(&l.media_type.as_str()))
}

/// A directory of layers keyed by digest
#[derive(Debug, Clone)]
pub struct LayerCache {
    root: PathBuf,
}

impl LayerCache {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Cache file path for a `sha256:<hex>` digest.
    pub fn path_for(&self, digest: &str) -> PathBuf {
        self.root.join(digest.replace(':', "-"))
    }

    /// A cached layer counts only when its size matches the declaration.
    pub fn lookup(&self, descriptor: &OciDescriptor) -> Option<PathBuf> {
        let path = self.path_for(&descriptor.digest);
        match path.metadata() {
            Ok(meta) if meta.len() == descriptor.size as u64 => Some(path),
            _ => None,
        }
    }

    /// Admit a fully-written layer file into the cache.
    pub fn admit(&self, descriptor: &OciDescriptor, source: &Path) -> Result<()> {
        let path = self.path_for(&descriptor.digest);
        if path.exists() {
            return Ok(());
        }
        let tmp = path.with_extension("partial");
        std::fs::copy(source, &tmp)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Delete cached entries for these layers whose file size does not match
    /// the declared size. Runs after a failed save so the retry does not
    /// trust half-written blobs.
    pub fn cleanup_in_progress(&self, layers: &[OciDescriptor]) -> Result<usize> {
        let mut removed = 0;
        for layer in layers {
            let path = self.path_for(&layer.digest);
            let Ok(meta) = path.metadata() else {
                continue;
            };
            if meta.len() != layer.size as u64 {
                debug!(digest = %layer.digest, "removing incomplete cached layer");
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layer(digest: &str, size: i64) -> OciDescriptor {
        OciDescriptor {
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            digest: digest.to_string(),
            size,
            urls: None,
            annotations: None,
        }
    }

    #[test]
    fn lookup_requires_matching_size() {
        let temp = TempDir::new().unwrap();
        let cache = LayerCache::new(&temp.path().join("cache")).unwrap();
        let descriptor = layer("sha256:abc", 4);

        assert!(cache.lookup(&descriptor).is_none());
        std::fs::write(cache.path_for("sha256:abc"), b"data").unwrap();
        assert!(cache.lookup(&descriptor).is_some());

        let short = layer("sha256:abc", 9);
        assert!(cache.lookup(&short).is_none());
    }

    #[test]
    fn cleanup_removes_only_size_mismatches() {
        let temp = TempDir::new().unwrap();
        let cache = LayerCache::new(&temp.path().join("cache")).unwrap();

        std::fs::write(cache.path_for("sha256:good"), b"1234").unwrap();
        std::fs::write(cache.path_for("sha256:torn"), b"12").unwrap();

        let removed = cache
            .cleanup_in_progress(&[layer("sha256:good", 4), layer("sha256:torn", 4)])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cache.path_for("sha256:good").exists());
        assert!(!cache.path_for("sha256:torn").exists());
    }

    #[test]
    fn non_image_layers_bypass_cache() {
        let image = vec![layer("sha256:a", 1)];
        assert!(only_image_layers(&image));

        let mut artifact = image.clone();
        artifact.push(OciDescriptor {
            media_type: "application/vnd.airlift.bundle.component.v1+tar".to_string(),
            digest: "sha256:b".to_string(),
            size: 1,
            urls: None,
            annotations: None,
        });
        assert!(!only_image_layers(&artifact));
    }
}
