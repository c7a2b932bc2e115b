//! Error types for the image subsystem

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OciError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OciError {
    #[error("invalid image reference '{reference}': {message}")]
    InvalidReference { reference: String, message: String },

    /// A digest ref resolved to a multi-platform index; the caller must pick
    /// one of the enumerated platform manifests instead.
    #[error(
        "{reference} resolved to a multi-platform image index; select a specific platform:\n{}",
        options.join("\n")
    )]
    IndexRejected {
        reference: String,
        options: Vec<String>,
    },

    #[error("no manifest for platform {platform} in index for {reference}")]
    PlatformNotFound {
        reference: String,
        platform: String,
    },

    #[error("rate limited by registry while fetching {reference}")]
    RateLimited { reference: String },

    #[error("registry error for {reference}: {message}")]
    Registry { reference: String, message: String },

    #[error("failed to load {reference} from the container daemon: {message}")]
    Daemon { reference: String, message: String },

    #[error("tarball {path} is not a loadable image archive: {message}")]
    Tarball { path: PathBuf, message: String },

    #[error("OCI layout error at {path}: {message}")]
    Layout { path: PathBuf, message: String },

    #[error("blob {digest} has size {actual}, expected {expected}")]
    BlobSize {
        digest: String,
        expected: i64,
        actual: u64,
    },

    #[error("push of {reference} failed after {attempts} attempts: {message}")]
    PushFailed {
        reference: String,
        attempts: u32,
        message: String,
    },

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OciError {
    /// Transient errors are worth another attempt; integrity and input
    /// errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OciError::RateLimited { .. } | OciError::Registry { .. } | OciError::Io(_)
        )
    }
}
