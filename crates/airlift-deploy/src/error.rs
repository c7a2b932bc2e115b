//! Deploy pipeline errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeployError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeployError {
    #[error(transparent)]
    Core(#[from] airlift_core::CoreError),

    #[error(transparent)]
    Oci(#[from] airlift_oci::OciError),

    #[error(transparent)]
    Git(#[from] airlift_git::GitError),

    #[error(transparent)]
    Kube(#[from] airlift_kube::KubeError),

    #[error("bundle source '{path}' not found")]
    SourceNotFound { path: String },

    #[error("failed to pull bundle {reference}: {message}")]
    BundlePull { reference: String, message: String },

    #[error(
        "bundle was built for {bundle_arch} but this host is {host_arch}; pass --architecture to cross-deploy"
    )]
    ArchMismatch {
        bundle_arch: String,
        host_arch: String,
    },

    #[error("component '{component}' failed during {step}: {message}")]
    ComponentFailed {
        component: String,
        step: String,
        message: String,
    },

    #[error("action '{cmd}' failed after {attempts} attempts: {message}")]
    ActionFailed {
        cmd: String,
        attempts: u32,
        message: String,
    },

    #[error("action '{cmd}' timed out after {seconds}s")]
    ActionTimeout { cmd: String, seconds: u64 },

    #[error("deploy exceeded its {seconds}s budget")]
    DeployTimeout { seconds: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
