//! Airlift Git - mirror bundled repositories into the cluster git server
//!
//! Bundles carry bare clones under `repos/`; deploy mirrors each one into
//! the in-cluster git server under a deterministic name derived from the
//! origin URL, so re-deploys and multiple bundles converge on the same
//! target repository.

pub mod error;
pub mod mirror;

pub use error::{GitError, Result};
pub use mirror::{mirror_repos, target_repo_name, GitServerConfig};
