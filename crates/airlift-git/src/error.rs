//! Error types for repository mirroring

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GitError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GitError {
    #[error("invalid repository url '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("bundled repository for {url} not found at {path}")]
    MissingBundledRepo { url: String, path: String },

    #[error("git {operation} failed for {url}: {stderr}")]
    CommandFailed {
        operation: String,
        url: String,
        stderr: String,
    },

    #[error("push of {url} failed after {attempts} attempts: {last}")]
    PushExhausted {
        url: String,
        attempts: u32,
        last: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
