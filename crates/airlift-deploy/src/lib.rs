//! Airlift Deploy - the staged pipeline from sealed archive to reconciled cluster
//!
//! The crates below this one each own a subsystem (bundle model, images,
//! repos, cluster); this crate sequences them:
//! - `source`: locate, reassemble, extract and verify the bundle
//! - `actions`: the lifecycle command runner
//! - `executor`: the per-component state machine
//! - `pipeline`: the deploy invocation itself, plus `remove`

pub mod actions;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod source;

pub use actions::{run_action, ActionOutput};
pub use error::{DeployError, Result};
pub use pipeline::{deploy, remove, DeployOptions, DeployResult};
pub use source::{BundleSource, LoadedBundle, VerifyOptions};
