//! Airlift Core - bundle model and archive lifecycle for the air-gap deploy engine
//!
//! This crate provides the foundational pieces used throughout airlift:
//! - `Bundle`: the sealed bundle descriptor and its component model
//! - `archive`: extraction and multipart reassembly
//! - `Checksums`: the per-file integrity manifest
//! - `signing`: detached signature verification over the checksum manifest
//! - `filter`: host/cluster/user component selection
//! - `VariableState`: constant and variable placeholder expansion
//! - `migrate`: rewrites of deprecated descriptor fields

pub mod archive;
pub mod bundle;
pub mod checksums;
pub mod error;
pub mod filter;
pub mod migrate;
pub mod signing;
pub mod variables;

pub use bundle::{
    Action, ActionSet, Bundle, BundleChart, BundleKind, BundleMetadata, BuildStamp,
    Component, Constant, DataInjection, FilePlacement, InjectionTarget, ManifestSet,
    SetVariable, VariableDecl, BUNDLE_DESCRIPTOR, CHECKSUMS_FILE, SIGNATURE_FILE,
};
pub use checksums::{sha256_bytes, sha256_file, Checksums};
pub use error::{CoreError, Result};
pub use filter::{select_components, ClusterFacts, HostFacts, Selection};
pub use variables::{VariableState, VariableValue};

/// Load, migrate and parse the descriptor of an extracted bundle.
pub fn load_bundle(root: &std::path::Path) -> Result<Bundle> {
    let path = root.join(BUNDLE_DESCRIPTOR);
    if !path.exists() {
        return Err(CoreError::BundleNotFound {
            path: path.display().to_string(),
        });
    }
    let content = std::fs::read_to_string(&path)?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&content)?;
    let migrated = migrate::migrate(doc)?;
    let text = serde_yaml::to_string(&migrated)?;
    bundle::Bundle::parse(&text)
}
