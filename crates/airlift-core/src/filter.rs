//! Component selection
//!
//! Narrows a bundle's component list down to what actually deploys on this
//! host against this cluster, honoring `only` filters, required/default
//! flags, mutually-exclusive groups and the user's `--components` choices.
//! Declaration order is always preserved.

use indexmap::IndexMap;
use tracing::debug;

use crate::bundle::{Bundle, Component};
use crate::error::{CoreError, Result};

/// Facts about the machine running the deploy
#[derive(Debug, Clone)]
pub struct HostFacts {
    /// linux, darwin, windows
    pub os: String,
    /// amd64, arm64
    pub arch: String,
}

impl Default for HostFacts {
    fn default() -> Self {
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }
}

/// Facts about the target cluster, when reachable
#[derive(Debug, Clone, Default)]
pub struct ClusterFacts {
    /// Node architecture, when known
    pub arch: Option<String>,
    /// Detected distro (k3s, eks, ...), when known
    pub distro: Option<String>,
}

/// Parsed `--components` input: component and group names, comma separated.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    names: Vec<String>,
}

impl Selection {
    /// Parse the CSV the CLI passes through. Empty input means "no choice".
    pub fn parse(csv: &str) -> Self {
        Self {
            names: csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn picks(&self, component: &Component) -> bool {
        self.names.iter().any(|n| {
            n == &component.name || component.group.as_deref() == Some(n.as_str())
        })
    }
}

/// Select the components to execute, in declaration order.
pub fn select_components<'a>(
    bundle: &'a Bundle,
    host: &HostFacts,
    cluster: &ClusterFacts,
    selection: &Selection,
) -> Result<Vec<&'a Component>> {
    // First pass: platform filtering, then group bucketing so group
    // resolution only sees members that could actually run here.
    let eligible: Vec<&Component> = bundle
        .components
        .iter()
        .filter(|c| applies_to(c, host, cluster))
        .collect();

    let mut groups: IndexMap<&str, Vec<&Component>> = IndexMap::new();
    for &component in &eligible {
        if let Some(group) = component.group.as_deref() {
            groups.entry(group).or_default().push(component);
        }
    }

    let mut chosen: Vec<&Component> = Vec::new();
    let mut resolved_groups: IndexMap<&str, &Component> = IndexMap::new();

    for (group, members) in &groups {
        let explicit: Vec<&&Component> =
            members.iter().filter(|m| selection.picks(m)).collect();
        let winner = match explicit.len() {
            // No explicit pick: the default member wins, else the first
            // declared.
            0 => members
                .iter()
                .find(|m| m.default)
                .or_else(|| members.first())
                .copied(),
            1 => Some(*explicit[0]),
            _ => {
                return Err(CoreError::Selection {
                    message: format!(
                        "group '{group}' resolves to more than one component: {}",
                        explicit
                            .iter()
                            .map(|c| c.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
            }
        };
        let winner = winner.ok_or_else(|| CoreError::Selection {
            message: format!("group '{group}' has no eligible members"),
        })?;
        resolved_groups.insert(*group, winner);
    }

    for &component in &eligible {
        let include = if component.required {
            true
        } else if let Some(group) = component.group.as_deref() {
            resolved_groups.get(group).map(|w| w.name == component.name) == Some(true)
        } else if !selection.is_empty() {
            selection.picks(component)
        } else {
            component.default
        };

        if include {
            chosen.push(component);
        } else {
            debug!(component = %component.name, "skipping deselected component");
        }
    }

    if chosen.is_empty() {
        return Err(CoreError::NothingToDeploy);
    }
    Ok(chosen)
}

/// Does the component's `only` filter admit this host and cluster?
fn applies_to(component: &Component, host: &HostFacts, cluster: &ClusterFacts) -> bool {
    let only = &component.only;
    if let Some(os) = only.local_os.as_deref() {
        if os != host.os {
            return false;
        }
    }
    if let Some(want) = only.cluster.architecture.as_deref() {
        // Fall back to the host arch when the cluster is unreachable.
        let have = cluster.arch.as_deref().unwrap_or(&host.arch);
        if want != have {
            return false;
        }
    }
    if !only.cluster.distros.is_empty() {
        match cluster.distro.as_deref() {
            Some(distro) => {
                if !only.cluster.distros.iter().any(|d| d == distro) {
                    return false;
                }
            }
            // Unknown distro: keep the component rather than silently
            // dropping it before the cluster has been contacted.
            None => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;

    fn host() -> HostFacts {
        HostFacts {
            os: "linux".into(),
            arch: "amd64".into(),
        }
    }

    fn bundle(yaml: &str) -> Bundle {
        Bundle::parse(yaml).unwrap()
    }

    fn names(components: &[&Component]) -> Vec<String> {
        components.iter().map(|c| c.name.clone()).collect()
    }

    const GROUPED: &str = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: core
    required: true
  - name: postgres
    group: db
    default: true
  - name: mysql
    group: db
  - name: docs
    default: true
  - name: extras
"#;

    #[test]
    fn defaults_without_user_input() {
        let b = bundle(GROUPED);
        let out =
            select_components(&b, &host(), &ClusterFacts::default(), &Selection::default())
                .unwrap();
        assert_eq!(names(&out), vec!["core", "postgres", "docs"]);
    }

    #[test]
    fn explicit_pick_overrides_group_default() {
        let b = bundle(GROUPED);
        let selection = Selection::parse("mysql");
        let out =
            select_components(&b, &host(), &ClusterFacts::default(), &selection).unwrap();
        assert_eq!(names(&out), vec!["core", "mysql"]);
    }

    #[test]
    fn required_cannot_be_deselected() {
        let b = bundle(GROUPED);
        let selection = Selection::parse("extras");
        let out =
            select_components(&b, &host(), &ClusterFacts::default(), &selection).unwrap();
        assert!(out.iter().any(|c| c.name == "core"));
        assert!(out.iter().any(|c| c.name == "extras"));
        assert!(!out.iter().any(|c| c.name == "docs"));
    }

    #[test]
    fn declaration_order_preserved() {
        let b = bundle(GROUPED);
        let selection = Selection::parse("extras,docs");
        let out =
            select_components(&b, &host(), &ClusterFacts::default(), &selection).unwrap();
        assert_eq!(names(&out), vec!["core", "postgres", "docs", "extras"]);
    }

    #[test]
    fn two_picks_in_one_group_rejected() {
        let b = bundle(GROUPED);
        let selection = Selection::parse("postgres,mysql");
        let err = select_components(&b, &host(), &ClusterFacts::default(), &selection)
            .unwrap_err();
        assert!(matches!(err, CoreError::Selection { .. }));
    }

    #[test]
    fn group_without_default_falls_back_to_first() {
        let yaml = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: a
    group: g
  - name: b
    group: g
"#;
        let b = bundle(yaml);
        let out =
            select_components(&b, &host(), &ClusterFacts::default(), &Selection::default())
                .unwrap();
        assert_eq!(names(&out), vec!["a"]);
    }

    #[test]
    fn os_filter_excludes() {
        let yaml = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: win-only
    required: true
    only:
      localOS: windows
  - name: everywhere
    required: true
"#;
        let b = bundle(yaml);
        let out =
            select_components(&b, &host(), &ClusterFacts::default(), &Selection::default())
                .unwrap();
        assert_eq!(names(&out), vec!["everywhere"]);
    }

    #[test]
    fn distro_filter_respects_cluster_facts() {
        let yaml = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: k3s-tweaks
    required: true
    only:
      cluster:
        distros: [k3s]
"#;
        let b = bundle(yaml);

        let k3s = ClusterFacts {
            arch: None,
            distro: Some("k3s".into()),
        };
        assert_eq!(
            names(&select_components(&b, &host(), &k3s, &Selection::default()).unwrap()),
            vec!["k3s-tweaks"]
        );

        let eks = ClusterFacts {
            arch: None,
            distro: Some("eks".into()),
        };
        let err =
            select_components(&b, &host(), &eks, &Selection::default()).unwrap_err();
        assert!(matches!(err, CoreError::NothingToDeploy));
    }

    #[test]
    fn empty_selection_is_fatal() {
        let yaml = r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: optional-bits
"#;
        let b = bundle(yaml);
        let err =
            select_components(&b, &host(), &ClusterFacts::default(), &Selection::default())
                .unwrap_err();
        assert!(matches!(err, CoreError::NothingToDeploy));
    }
}
