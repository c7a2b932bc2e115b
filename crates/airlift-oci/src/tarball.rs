//! Image tarball loading
//!
//! Components may ship images as tarballs instead of registry references,
//! and the daemon fallback produces the same format. Two layouts are
//! understood: the legacy `docker save` archive (`manifest.json` at the
//! root) and an OCI image layout archive (`index.json` + `blobs/`).

use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tracing::debug;

use crate::error::{OciError, Result};
use crate::layout::{LayoutIndex, OciLayout};

const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

/// `manifest.json` entry of a `docker save` archive
#[derive(Debug, Deserialize)]
struct DockerSaveEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Load an image tarball into the layout, returning the image manifest.
pub fn load_into_layout(tar_path: &Path, layout: &OciLayout) -> Result<OciImageManifest> {
    let staging = tempfile::tempdir()?;
    extract_tar(tar_path, staging.path())?;

    if staging.path().join("manifest.json").exists() {
        load_docker_save(tar_path, staging.path(), layout)
    } else if staging.path().join("index.json").exists() {
        load_oci_archive(tar_path, staging.path(), layout)
    } else {
        Err(OciError::Tarball {
            path: tar_path.to_path_buf(),
            message: "neither manifest.json nor index.json found".to_string(),
        })
    }
}

fn extract_tar(tar_path: &Path, dest: &Path) -> Result<()> {
    let mut file = std::fs::File::open(tar_path)?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    drop(file);
    let file = std::fs::File::open(tar_path)?;

    let result = if read == 2 && magic == [0x1f, 0x8b] {
        tar::Archive::new(flate2::read::GzDecoder::new(file)).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };
    result.map_err(|e| OciError::Tarball {
        path: tar_path.to_path_buf(),
        message: e.to_string(),
    })
}

fn load_docker_save(
    tar_path: &Path,
    staging: &Path,
    layout: &OciLayout,
) -> Result<OciImageManifest> {
    let manifest_text = std::fs::read(staging.join("manifest.json"))?;
    let entries: Vec<DockerSaveEntry> =
        serde_json::from_slice(&manifest_text).map_err(|e| OciError::Tarball {
            path: tar_path.to_path_buf(),
            message: format!("invalid manifest.json: {e}"),
        })?;
    let entry = entries.first().ok_or_else(|| OciError::Tarball {
        path: tar_path.to_path_buf(),
        message: "manifest.json lists no images".to_string(),
    })?;

    let config = blob_from_file(staging.join(&entry.config).as_path(), layout, OCI_CONFIG_MEDIA_TYPE)?;
    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer in &entry.layers {
        layers.push(blob_from_file(
            staging.join(layer).as_path(),
            layout,
            OCI_LAYER_MEDIA_TYPE,
        )?);
    }
    debug!(path = %tar_path.display(), layers = layers.len(), "loaded docker-save archive");

    Ok(OciImageManifest {
        schema_version: 2,
        media_type: Some(OCI_MANIFEST_MEDIA_TYPE.to_string()),
        config,
        layers,
        artifact_type: None,
        annotations: None,
    })
}

fn load_oci_archive(
    tar_path: &Path,
    staging: &Path,
    layout: &OciLayout,
) -> Result<OciImageManifest> {
    let index_text = std::fs::read(staging.join("index.json"))?;
    let index: LayoutIndex =
        serde_json::from_slice(&index_text).map_err(|e| OciError::Tarball {
            path: tar_path.to_path_buf(),
            message: format!("invalid index.json: {e}"),
        })?;
    let descriptor = index.manifests.first().ok_or_else(|| OciError::Tarball {
        path: tar_path.to_path_buf(),
        message: "index.json lists no manifests".to_string(),
    })?;

    // Copy every blob over; content addressing makes collisions harmless.
    let blob_root = staging.join("blobs/sha256");
    for entry in std::fs::read_dir(&blob_root)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            let data = std::fs::read(entry.path())?;
            layout.write_blob(&data)?;
        }
    }

    let manifest_bytes = layout.read_blob(&descriptor.digest)?;
    let manifest: OciImageManifest =
        serde_json::from_slice(&manifest_bytes).map_err(|e| OciError::Tarball {
            path: tar_path.to_path_buf(),
            message: format!("manifest {} is not an image manifest: {e}", descriptor.digest),
        })?;
    Ok(manifest)
}

/// Hash a staged file, store it as a blob and return its descriptor.
fn blob_from_file(
    path: &Path,
    layout: &OciLayout,
    media_type: &str,
) -> Result<OciDescriptor> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    let mut buf = [0u8; 128 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let digest = format!("sha256:{}", hex::encode(hasher.finalize()));

    let blob_path = layout.blob_path(&digest);
    if !blob_path.exists() {
        std::fs::copy(path, &blob_path)?;
    }

    Ok(OciDescriptor {
        media_type: media_type.to_string(),
        digest,
        size: size as i64,
        urls: None,
        annotations: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn docker_save_tar(dir: &Path) -> std::path::PathBuf {
        let config = br#"{"architecture":"amd64","os":"linux"}"#;
        let layer = b"layer-tar-bytes";
        let manifest = br#"[{"Config":"abc.json","RepoTags":["demo:1"],"Layers":["l1/layer.tar"]}]"#;

        let tar_path = dir.join("image.tar");
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, data) in [
            ("manifest.json", manifest.as_slice()),
            ("abc.json", config.as_slice()),
            ("l1/layer.tar", layer.as_slice()),
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

    #[test]
    fn docker_save_archive_loads() {
        let temp = TempDir::new().unwrap();
        let layout = OciLayout::open(&temp.path().join("layout")).unwrap();
        let tar_path = docker_save_tar(temp.path());

        let manifest = load_into_layout(&tar_path, &layout).unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert!(layout
            .blob_path(&manifest.config.digest)
            .exists());
        assert!(layout.blob_path(&manifest.layers[0].digest).exists());
        layout.check_blob(&manifest.layers[0]).unwrap();
    }

    #[test]
    fn unrecognized_archive_rejected() {
        let temp = TempDir::new().unwrap();
        let layout = OciLayout::open(&temp.path().join("layout")).unwrap();

        let tar_path = temp.path().join("junk.tar");
        let file = std::fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "junk.txt", &b"junk"[..]).unwrap();
        builder.into_inner().unwrap();

        let err = load_into_layout(&tar_path, &layout).unwrap_err();
        assert!(matches!(err, OciError::Tarball { .. }));
    }
}
