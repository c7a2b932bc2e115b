//! Release records
//!
//! Every chart (and every manifest set, through its synthetic chart) becomes
//! a named, revisioned release. Revision records live in the cluster next to
//! the resources they describe, so any later deploy can resolve what is
//! installed and which revision was last healthy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default readiness/engine timeout: 15 minutes.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15 * 60;

/// Default install/upgrade attempts.
pub const DEFAULT_RETRIES: u32 = 3;

/// A chart as the release engine consumes it: named, namespaced and already
/// materialized into plain manifest documents. Manifest sets arrive here as
/// synthetic charts named after the set.
#[derive(Debug, Clone)]
pub struct Chart {
    /// Chart name
    pub name: String,

    /// Release name; defaults to the chart name upstream
    pub release_name: String,

    /// Target namespace
    pub namespace: String,

    /// Chart version, when the bundle declared one
    pub version: Option<String>,

    /// Multi-document YAML making up the chart's resources
    pub manifest: String,

    /// Skip the reconciliation wait after apply
    pub no_wait: bool,

    /// Engine + readiness budget in seconds
    pub timeout_secs: u64,

    /// Install/upgrade attempts
    pub retries: u32,
}

impl Chart {
    /// A synthetic chart wrapping a manifest set.
    pub fn synthetic(name: &str, namespace: &str, manifest: String, no_wait: bool) -> Self {
        Self {
            name: name.to_string(),
            release_name: name.to_string(),
            namespace: namespace.to_string(),
            version: None,
            manifest,
            no_wait,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retries: DEFAULT_RETRIES,
        }
    }
}

/// One revision of a release
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    /// Release name
    pub name: String,

    /// Namespace the release lives in
    pub namespace: String,

    /// Revision number, 1-indexed and strictly increasing
    pub revision: u32,

    /// Record state
    pub state: ReleaseState,

    /// Chart name this revision installed
    pub chart: String,

    /// Chart version, when known
    #[serde(default)]
    pub chart_version: Option<String>,

    /// The manifest applied by this revision
    pub manifest: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last state transition
    pub updated_at: DateTime<Utc>,
}

impl ReleaseRecord {
    pub fn new(chart: &Chart, revision: u32, state: ReleaseState) -> Self {
        let now = Utc::now();
        Self {
            name: chart.release_name.clone(),
            namespace: chart.namespace.clone(),
            revision,
            state,
            chart: chart.name.clone(),
            chart_version: chart.version.clone(),
            manifest: chart.manifest.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Storage key of this revision's record.
    pub fn storage_key(&self) -> String {
        release_storage_key(&self.name, self.revision)
    }

    pub fn mark(&mut self, state: ReleaseState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            ReleaseState::PendingInstall
                | ReleaseState::PendingUpgrade
                | ReleaseState::PendingRollback
        )
    }
}

/// Storage key for a (release, revision) pair.
pub fn release_storage_key(name: &str, revision: u32) -> String {
    format!("airlift.release.v1.{name}.v{revision}")
}

/// Lifecycle state of a release revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum ReleaseState {
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    /// Applied and reconciled
    Deployed,
    /// Replaced by a newer revision
    Superseded,
    /// The attempt failed; the revision records what was tried
    Failed,
}

impl std::fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
            Self::Deployed => "deployed",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
