//! Checksum manifest handling
//!
//! Every bundle archive carries a `checksums.txt` with one
//! `<hex-sha256>  <relative-path>` line per file. Verification walks the
//! extracted tree and compares each listed file; the aggregated sha256 of
//! `checksums.txt` itself is the bundle shasum shown to users and compared
//! against `--shasum`.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::error::{CoreError, Result};

/// One line of the checksum manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    /// Relative path within the extracted archive
    pub path: String,
    /// Lowercase hex sha256 of the file contents
    pub sha256: String,
}

/// Parsed checksum manifest
#[derive(Debug, Clone, Default)]
pub struct Checksums {
    pub entries: Vec<ChecksumEntry>,
}

impl Checksums {
    /// Parse `checksums.txt` content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (hash, path) = line.split_once(char::is_whitespace).ok_or_else(|| {
                CoreError::InvalidBundle {
                    message: format!("malformed checksums.txt line: '{line}'"),
                }
            })?;
            entries.push(ChecksumEntry {
                path: path.trim().to_string(),
                sha256: hash.to_lowercase(),
            });
        }
        Ok(Self { entries })
    }

    /// Render back to the on-disk format.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.sha256);
            out.push_str("  ");
            out.push_str(&entry.path);
            out.push('\n');
        }
        out
    }

    /// Verify every listed file under `root`.
    ///
    /// Files present on disk but not listed are ignored (the signature file
    /// and the manifest itself are never listed).
    pub fn verify_tree(&self, root: &Path) -> Result<()> {
        for entry in &self.entries {
            let path = root.join(&entry.path);
            if !path.exists() {
                return Err(CoreError::ChecksumMissingFile {
                    path: entry.path.clone(),
                });
            }
            let actual = sha256_file(&path)?;
            if actual != entry.sha256 {
                return Err(CoreError::ChecksumMismatch {
                    path: entry.path.clone(),
                    expected: entry.sha256.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Streaming sha256 of a file, as lowercase hex.
pub fn sha256_file(path: &Path) -> Result<String> {
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

/// sha256 of an in-memory buffer, as lowercase hex.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
