//! Core error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("bundle descriptor not found: {path}")]
    BundleNotFound { path: String },

    #[error("invalid bundle descriptor: {message}")]
    InvalidBundle { message: String },

    #[error("unknown bundle kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("bundle was built by an unsupported tool version ({built_with}); no migration covers it")]
    VersionSkew { built_with: String },

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("archive error at {path}: {message}")]
    Archive { path: PathBuf, message: String },

    #[error("multipart archive {path} is incomplete: {message}")]
    Multipart { path: PathBuf, message: String },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("file {path} is listed in checksums.txt but missing from the archive")]
    ChecksumMissingFile { path: String },

    #[error("signature verification failed: {message}")]
    SignatureInvalid { message: String },

    #[error("bundle is signed but no public key was provided (pass --key)")]
    SignatureKeyRequired,

    #[error("a public key was provided but the bundle carries no signature")]
    SignatureMissing,

    #[error("component selection error: {message}")]
    Selection { message: String },

    #[error("no components left to deploy after filtering")]
    NothingToDeploy,

    #[error("unresolved template placeholder '{placeholder}' in {path}")]
    UnresolvedPlaceholder { placeholder: String, path: String },

    #[error("variable '{name}' is not declared by the bundle")]
    UnknownVariable { name: String },
}

pub type Result<T> = std::result::Result<T, CoreError>;
