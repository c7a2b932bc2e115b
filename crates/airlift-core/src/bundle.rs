//! Bundle descriptor types
//!
//! A bundle is a sealed archive carrying everything an application needs in a
//! disconnected environment: container images, git repositories, charts,
//! manifests, plain files and lifecycle actions. The descriptor
//! (`airlift.yaml`) is parsed once at load time and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

/// File name of the bundle descriptor inside an archive.
pub const BUNDLE_DESCRIPTOR: &str = "airlift.yaml";

/// File name of the checksum manifest inside an archive.
pub const CHECKSUMS_FILE: &str = "checksums.txt";

/// File name of the detached signature over the checksum manifest.
pub const SIGNATURE_FILE: &str = "signature.sig";

/// A parsed bundle descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    /// Bundle kind
    pub kind: BundleKind,

    /// Bundle metadata
    pub metadata: BundleMetadata,

    /// Build-time stamp, written by the creation tooling
    #[serde(default)]
    pub build: Option<BuildStamp>,

    /// Immutable constants available to template expansion
    #[serde(default)]
    pub constants: Vec<Constant>,

    /// Declared variables, resolvable from defaults, prompts and `--set`
    #[serde(default)]
    pub variables: Vec<VariableDecl>,

    /// Ordered list of components
    #[serde(default)]
    pub components: Vec<Component>,
}

impl Bundle {
    /// Parse a bundle descriptor from YAML text.
    pub fn parse(content: &str) -> Result<Self> {
        // Surface an unknown `kind` as its own error instead of a generic
        // serde failure, since it is the first thing users get wrong.
        let probe: serde_yaml::Value = serde_yaml::from_str(content)?;
        if let Some(kind) = probe.get("kind").and_then(|k| k.as_str()) {
            if kind != "AppConfig" && kind != "InitConfig" {
                return Err(CoreError::UnknownKind {
                    kind: kind.to_string(),
                });
            }
        }

        let bundle: Bundle = serde_yaml::from_str(content)?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Load and parse a bundle descriptor from a directory containing
    /// `airlift.yaml`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(BUNDLE_DESCRIPTOR);
        if !path.exists() {
            return Err(CoreError::BundleNotFound {
                path: path.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(CoreError::InvalidBundle {
                message: "metadata.name must not be empty".to_string(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for component in &self.components {
            if component.name.is_empty() {
                return Err(CoreError::InvalidBundle {
                    message: "component name must not be empty".to_string(),
                });
            }
            if !seen.insert(component.name.as_str()) {
                return Err(CoreError::InvalidBundle {
                    message: format!("duplicate component name '{}'", component.name),
                });
            }
            if component.required && component.group.is_some() {
                return Err(CoreError::InvalidBundle {
                    message: format!(
                        "component '{}' cannot be both required and part of a group",
                        component.name
                    ),
                });
            }
        }
        Ok(())
    }

    /// Look up a component by name.
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Bundle kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleKind {
    /// A regular application bundle
    AppConfig,
    /// The cluster-seeding bundle (registry, git server, PKI)
    InitConfig,
}

impl std::fmt::Display for BundleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppConfig => write!(f, "AppConfig"),
            Self::InitConfig => write!(f, "InitConfig"),
        }
    }
}

/// Bundle metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    /// Bundle name (required, non-empty)
    pub name: String,

    /// Bundle version
    #[serde(default)]
    pub version: Option<String>,

    /// Description
    #[serde(default)]
    pub description: Option<String>,

    /// Target architecture (amd64, arm64)
    #[serde(default)]
    pub architecture: Option<String>,

    /// Archive was written without compression
    #[serde(default)]
    pub uncompressed: bool,

    /// Deploy without the init prerequisites; images and repos keep their
    /// original references and no push phases run
    #[serde(default)]
    pub yolo: bool,
}

/// Build-time information stamped into the descriptor by the creation tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStamp {
    /// Version of the tool that built the bundle
    pub version: String,

    /// Architecture the bundle was built for
    #[serde(default)]
    pub architecture: Option<String>,

    /// Build timestamp (RFC 3339)
    #[serde(default)]
    pub timestamp: Option<String>,

    /// Hostname of the build machine
    #[serde(default)]
    pub terminal: Option<String>,
}

/// An immutable constant exposed to template expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constant {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A declared variable, resolved at deploy time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDecl {
    pub name: String,

    /// Default value when neither `--set` nor a prompt supplies one
    #[serde(default)]
    pub default: Option<String>,

    /// Ask the user for a value when not supplied (prompting itself is
    /// performed by the CLI layer)
    #[serde(default)]
    pub prompt: bool,

    /// Never echo the value in logs or output
    #[serde(default)]
    pub sensitive: bool,

    #[serde(default)]
    pub description: Option<String>,
}

/// A named unit of deployment inside a bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Always deployed; cannot be deselected
    #[serde(default)]
    pub required: bool,

    /// Selected when the user expresses no choice
    #[serde(default)]
    pub default: bool,

    /// Mutually-exclusive selection group; at most one member deploys
    #[serde(default)]
    pub group: Option<String>,

    /// Host/cluster filters restricting where this component applies
    #[serde(default)]
    pub only: OnlyFilter,

    /// Container images to stage and push
    #[serde(default)]
    pub images: Vec<String>,

    /// Git repositories to mirror into the cluster git server
    #[serde(default)]
    pub repos: Vec<String>,

    /// Plain files to place on the host
    #[serde(default)]
    pub files: Vec<FilePlacement>,

    /// Helm-style charts to install or upgrade
    #[serde(default)]
    pub charts: Vec<BundleChart>,

    /// Raw manifest sets, materialized into synthetic charts at deploy time
    #[serde(default)]
    pub manifests: Vec<ManifestSet>,

    /// Payloads injected into running pods
    #[serde(default)]
    pub data_injections: Vec<DataInjection>,

    /// Lifecycle command hooks
    #[serde(default)]
    pub actions: ActionSet,

    /// Resolved and flattened at build time; the deploy core must treat the
    /// component list as plain and never follow this
    #[serde(default)]
    pub import: Option<ComponentImport>,
}

/// Host and cluster restrictions for a component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlyFilter {
    /// Restrict to a local operating system (linux, darwin, windows)
    #[serde(default)]
    pub local_os: Option<String>,

    /// Cluster-side restrictions
    #[serde(default)]
    pub cluster: ClusterFilter,
}

/// Cluster-side component restrictions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFilter {
    /// Restrict to a cluster architecture (amd64, arm64)
    #[serde(default)]
    pub architecture: Option<String>,

    /// Restrict to specific cluster distros (k3s, eks, ...)
    #[serde(default)]
    pub distros: Vec<String>,
}

/// A file to place on the host during deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePlacement {
    /// Path inside the component archive
    pub source: String,

    /// Destination path on the host
    pub target: String,

    /// chmod +x after placement
    #[serde(default)]
    pub executable: bool,

    /// Symlinks to create pointing at the target
    #[serde(default)]
    pub symlinks: Vec<String>,
}

/// A chart carried by a component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleChart {
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Chart version
    #[serde(default)]
    pub version: Option<String>,

    /// Release name; defaults to the chart name
    #[serde(default)]
    pub release_name: Option<String>,

    /// Values files shipped alongside the chart, applied in order
    #[serde(default)]
    pub values_files: Vec<String>,

    /// Skip the post-install readiness reconciliation (hook waits still run)
    #[serde(default)]
    pub no_wait: bool,
}

impl BundleChart {
    /// Effective release name for this chart.
    pub fn release_name(&self) -> &str {
        self.release_name.as_deref().unwrap_or(&self.name)
    }
}

/// A set of raw manifests deployed as one synthetic chart
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSet {
    pub name: String,

    /// Target namespace
    #[serde(default)]
    pub namespace: Option<String>,

    /// Manifest files, relative to the component's `manifests/` directory
    #[serde(default)]
    pub files: Vec<String>,

    /// Skip the post-install readiness reconciliation
    #[serde(default)]
    pub no_wait: bool,
}

/// A payload delivered into a running container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataInjection {
    /// Path inside the component archive
    pub source: String,

    /// Receiving pod and container
    pub target: InjectionTarget,

    /// Gzip the tar stream
    #[serde(default)]
    pub compress: bool,
}

/// Where a data injection lands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionTarget {
    pub namespace: String,

    /// Label selector identifying the receiving pod
    pub selector: String,

    /// Container name within the pod
    pub container: String,

    /// Destination path inside the container; the sentinel file is written
    /// alongside it when the stream completes
    pub path: String,
}

/// Lifecycle command hooks for a component
///
/// All four positions share one action shape; the position only decides when
/// the commands run and whether failures abort the deploy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSet {
    /// Before any other step of the component
    #[serde(default)]
    pub before: Vec<Action>,

    /// After charts and manifests, before success is recorded
    #[serde(default)]
    pub after: Vec<Action>,

    /// Only when every preceding step of the component succeeded
    #[serde(default)]
    pub on_success: Vec<Action>,

    /// Best-effort, when any step failed
    #[serde(default)]
    pub on_failure: Vec<Action>,
}

impl ActionSet {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.on_success.is_empty()
            && self.on_failure.is_empty()
    }
}

/// A single lifecycle command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// The command line, run through the platform shell
    pub cmd: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Working directory
    #[serde(default)]
    pub dir: Option<String>,

    /// Extra environment entries, `KEY=VALUE`
    #[serde(default)]
    pub env: Vec<String>,

    /// Suppress stdout/stderr from the user
    #[serde(default)]
    pub mute: bool,

    /// Additional attempts after the first failure
    #[serde(default)]
    pub max_retries: u32,

    /// Per-attempt timeout in seconds; 0 means no timeout
    #[serde(default)]
    pub max_total_seconds: u64,

    /// Capture trimmed stdout into these variables on success
    #[serde(default)]
    pub set_variables: Vec<SetVariable>,

    /// Pin a specific shell instead of the platform default
    #[serde(default)]
    pub shell: Option<ShellPreference>,
}

/// A variable written from an action's captured stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariable {
    pub name: String,
    #[serde(default)]
    pub sensitive: bool,
}

/// Per-platform shell override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellPreference {
    #[serde(default)]
    pub linux: Option<String>,
    #[serde(default)]
    pub darwin: Option<String>,
    #[serde(default)]
    pub windows: Option<String>,
}

/// Build-time component import reference (never followed at deploy time)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentImport {
    pub path: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: web
    required: true
    images:
      - nginx:1.25
"#;

    #[test]
    fn parse_minimal_bundle() {
        let bundle = Bundle::parse(MINIMAL).unwrap();
        assert_eq!(bundle.kind, BundleKind::AppConfig);
        assert_eq!(bundle.metadata.name, "demo");
        assert_eq!(bundle.components.len(), 1);
        assert!(bundle.components[0].required);
        assert_eq!(bundle.components[0].images, vec!["nginx:1.25"]);
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let err = Bundle::parse("kind: Sprocket\nmetadata:\n  name: x\n").unwrap_err();
        assert!(matches!(err, CoreError::UnknownKind { kind } if kind == "Sprocket"));
    }

    #[test]
    fn empty_name_rejected() {
        let err = Bundle::parse("kind: AppConfig\nmetadata:\n  name: \"\"\n").unwrap_err();
        assert!(matches!(err, CoreError::InvalidBundle { .. }));
    }

    #[test]
    fn duplicate_component_names_rejected() {
        let yaml = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: web
  - name: web
"#;
        let err = Bundle::parse(yaml).unwrap_err();
        assert!(matches!(err, CoreError::InvalidBundle { .. }));
    }

    #[test]
    fn required_and_group_conflict() {
        let yaml = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: pg
    required: true
    group: db
"#;
        assert!(Bundle::parse(yaml).is_err());
    }

    #[test]
    fn chart_release_name_defaults_to_chart_name() {
        let chart = BundleChart {
            name: "api".into(),
            namespace: "default".into(),
            version: None,
            release_name: None,
            values_files: vec![],
            no_wait: false,
        };
        assert_eq!(chart.release_name(), "api");
    }

    #[test]
    fn actions_parse_with_set_variables() {
        let yaml = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: a
    actions:
      before:
        - cmd: echo 1.2.3
          setVariables:
            - name: VERSION
"#;
        let bundle = Bundle::parse(yaml).unwrap();
        let action = &bundle.components[0].actions.before[0];
        assert_eq!(action.cmd, "echo 1.2.3");
        assert_eq!(action.set_variables[0].name, "VERSION");
    }
}
