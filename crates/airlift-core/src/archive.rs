//! Archive extraction and multipart reassembly
//!
//! Bundle archives are tarballs, usually zstd-compressed. Bundles larger
//! than a transport limit are split into parts: `name.part000` is a JSON
//! header declaring the part count, total size and whole-file sha256, and
//! `name.part001..NNN` carry the data. Reassembly concatenates data parts in
//! index order and verifies the declared digest before extraction.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{CoreError, Result};

/// Header written as part 000 of a split archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartHeader {
    /// Number of data parts (not counting the header itself)
    pub count: usize,
    /// Total size of the reassembled file in bytes
    pub bytes: u64,
    /// sha256 of the reassembled file, lowercase hex
    pub sha256: String,
}

/// Returns true when `path` names the header part of a split archive.
pub fn is_multipart(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "part000")
        .unwrap_or(false)
}

/// Reassemble a split archive next to its parts.
///
/// `header_path` must point at the `.part000` header. Returns the path of
/// the reassembled file (the header path with the part suffix stripped).
pub fn reassemble(header_path: &Path) -> Result<PathBuf> {
    let header_text = std::fs::read_to_string(header_path)?;
    let header: MultipartHeader =
        serde_json::from_str(&header_text).map_err(|e| CoreError::Multipart {
            path: header_path.to_path_buf(),
            message: format!("invalid part header: {e}"),
        })?;

    let stem = header_path.with_extension("");
    let out_path = stem.clone();
    let mut out = File::create(&out_path)?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    for index in 1..=header.count {
        let part_path = PathBuf::from(format!("{}.part{index:03}", stem.display()));
        if !part_path.exists() {
            return Err(CoreError::Multipart {
                path: part_path,
                message: format!("part {index} of {} is missing", header.count),
            });
        }
        let mut part = File::open(&part_path)?;
        let mut buf = [0u8; 128 * 1024];
        loop {
            let n = part.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])?;
            written += n as u64;
        }
        debug!(part = index, total = header.count, "reassembled archive part");
    }
    out.flush()?;

    if written != header.bytes {
        return Err(CoreError::Multipart {
            path: out_path,
            message: format!(
                "reassembled size {written} does not match declared size {}",
                header.bytes
            ),
        });
    }
    let actual = hex::encode(hasher.finalize());
    if actual != header.sha256.to_lowercase() {
        return Err(CoreError::ChecksumMismatch {
            path: out_path.display().to_string(),
            expected: header.sha256.to_lowercase(),
            actual,
        });
    }

    Ok(out_path)
}

/// Extract a bundle archive into `dest`.
///
/// The compression is sniffed from magic bytes rather than the file name,
/// so renamed and uncompressed-declared bundles both extract correctly.
pub fn extract(archive_path: &Path, dest: &Path) -> Result<()> {
    let mut file = File::open(archive_path).map_err(|e| CoreError::Archive {
        path: archive_path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut magic = [0u8; 4];
    let read = file.read(&mut magic)?;
    drop(file);

    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;

    let result = if read >= 4 && magic == [0x28, 0xb5, 0x2f, 0xfd] {
        let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| CoreError::Archive {
            path: archive_path.to_path_buf(),
            message: e.to_string(),
        })?;
        tar::Archive::new(decoder).unpack(dest)
    } else if read >= 2 && magic[..2] == [0x1f, 0x8b] {
        let decoder = flate2::read::GzDecoder::new(file);
        tar::Archive::new(decoder).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };

    result.map_err(|e| CoreError::Archive {
        path: archive_path.to_path_buf(),
        message: format!("malformed archive: {e}"),
    })
}

/// Extract a single component tarball (`components/<name>.tar`) in place.
pub fn extract_component(tar_path: &Path, dest: &Path) -> Result<()> {
    extract(tar_path, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_tar(dir: &Path, name: &str) -> PathBuf {
        let tar_path = dir.join(name);
        let file = File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(file);
        let data = b"kind: AppConfig\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "airlift.yaml", &data[..]).unwrap();
        builder.into_inner().unwrap();
        tar_path
    }

    #[test]
    fn extract_plain_tar() {
        let temp = TempDir::new().unwrap();
        let tar_path = write_tar(temp.path(), "bundle.tar");
        let dest = temp.path().join("out");
        extract(&tar_path, &dest).unwrap();
        assert!(dest.join("airlift.yaml").exists());
    }

    #[test]
    fn extract_zstd_tar() {
        let temp = TempDir::new().unwrap();
        let tar_path = write_tar(temp.path(), "bundle.tar");
        let raw = std::fs::read(&tar_path).unwrap();
        let compressed = zstd::encode_all(std::io::Cursor::new(raw), 3).unwrap();
        let zst_path = temp.path().join("bundle.tar.zst");
        std::fs::write(&zst_path, compressed).unwrap();

        let dest = temp.path().join("out");
        extract(&zst_path, &dest).unwrap();
        assert!(dest.join("airlift.yaml").exists());
    }

    fn split(temp: &TempDir, data: &[u8], parts: usize) -> PathBuf {
        let chunk = data.len().div_ceil(parts);
        for (i, piece) in data.chunks(chunk).enumerate() {
            let path = temp.path().join(format!("bundle.tar.part{:03}", i + 1));
            std::fs::write(path, piece).unwrap();
        }
        let header = MultipartHeader {
            count: parts,
            bytes: data.len() as u64,
            sha256: crate::checksums::sha256_bytes(data),
        };
        let header_path = temp.path().join("bundle.tar.part000");
        std::fs::write(&header_path, serde_json::to_string(&header).unwrap()).unwrap();
        header_path
    }

    #[test]
    fn reassemble_concatenates_in_order() {
        let temp = TempDir::new().unwrap();
        let data: Vec<u8> = (0u16..2000).map(|i| (i % 251) as u8).collect();
        let header_path = split(&temp, &data, 3);

        let out = reassemble(&header_path).unwrap();
        assert_eq!(std::fs::read(out).unwrap(), data);
    }

    #[test]
    fn reassemble_fails_on_missing_part() {
        let temp = TempDir::new().unwrap();
        let data = vec![7u8; 900];
        let header_path = split(&temp, &data, 3);
        std::fs::remove_file(temp.path().join("bundle.tar.part002")).unwrap();

        let err = reassemble(&header_path).unwrap_err();
        assert!(matches!(err, CoreError::Multipart { .. }));
    }

    #[test]
    fn reassemble_fails_on_digest_mismatch() {
        let temp = TempDir::new().unwrap();
        let data = vec![7u8; 900];
        let header_path = split(&temp, &data, 2);
        std::fs::write(temp.path().join("bundle.tar.part002"), vec![8u8; 450]).unwrap();

        let err = reassemble(&header_path).unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn multipart_detection() {
        assert!(is_multipart(Path::new("x/bundle.tar.part000")));
        assert!(!is_multipart(Path::new("x/bundle.tar.part001")));
        assert!(!is_multipart(Path::new("x/bundle.tar")));
    }
}
