//! Airlift Kube - cluster operations for the deploy pipeline
//!
//! Everything that talks to the target cluster lives here:
//! - `Cluster`: connection, cluster facts, namespaces, connection table
//! - `ResourceManager`: dynamic Server-Side Apply and delete
//! - `ReleaseEngine`: install / upgrade / rollback with revision records
//! - `readiness`: the object-status reconciliation oracle
//! - `PackageStore`: the `DeployedPackage` cluster state secret
//! - `injection`: tar streaming into running containers

pub mod client;
pub mod engine;
pub mod error;
pub mod injection;
pub mod readiness;
pub mod release;
pub mod resources;
pub mod state;
pub mod store;

pub use client::{Cluster, ClusterInfo, CONNECT_URL_ANNOTATION};
pub use engine::{DeployedRelease, ReleaseEngine};
pub use error::{KubeError, Result};
pub use injection::inject;
pub use readiness::{object_readiness, Readiness};
pub use release::{Chart, ReleaseRecord, ReleaseState, DEFAULT_RETRIES, DEFAULT_TIMEOUT_SECS};
pub use resources::{ObjectKey, ParsedResource, ResourceManager};
pub use state::{DeployedComponent, DeployedPackage, InstalledChart, PackageStore, STATE_NAMESPACE};
pub use store::{MemoryReleaseStore, ReleaseStore, SecretReleaseStore};
