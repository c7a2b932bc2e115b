//! Error types for cluster operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KubeError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("cluster is unreachable: {message}")]
    Unreachable { message: String },

    #[error("release '{name}' not found in namespace '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    #[error("release '{name}' in namespace '{namespace}' is mid-operation ({status}); resolve it before deploying")]
    ReleaseBusy {
        name: String,
        namespace: String,
        status: String,
    },

    #[error("install of release '{name}' failed after {attempts} attempts: {message}")]
    InstallFailed {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("upgrade of release '{name}' failed after {attempts} attempts: {message}")]
    UpgradeFailed {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("rollback of release '{name}' to revision {revision} failed: {message}")]
    RollbackFailed {
        name: String,
        revision: u32,
        message: String,
    },

    #[error("cannot rollback release '{name}': {reason}")]
    RollbackNotPossible { name: String, reason: String },

    #[error("resources not ready for release '{name}' within {timeout_secs}s: {message}")]
    NotReady {
        name: String,
        timeout_secs: u64,
        message: String,
    },

    #[error("failed to apply resources: {0}")]
    Apply(String),

    #[error("failed to delete resources: {0}")]
    Delete(String),

    #[error("unknown resource kind {kind} ({api_version})")]
    UnknownKind { kind: String, api_version: String },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("data injection into {namespace}/{selector} failed: {message}")]
    Injection {
        namespace: String,
        selector: String,
        message: String,
    },

    #[error("state store error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    /// 404 from the API server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// 409 conflict, worth a re-apply.
    pub fn is_conflict(&self) -> bool {
        matches!(self, KubeError::Api(kube::Error::Api(resp)) if resp.code == 409)
    }
}
