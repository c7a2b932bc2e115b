//! Release engine
//!
//! Drives a chart from manifest text to a reconciled, revisioned release:
//!
//! ```text
//!                  +-- no release --> INSTALL --(wait)--> DONE
//! resolve state -->|
//!                  +-- release exists --> UPGRADE --(wait)--+-> DONE
//!                                           |
//!                                           +- fail -> ROLLBACK -> DONE_FAIL
//! ```
//!
//! CRDs are applied on install and skipped on upgrade; the apply itself is
//! the engine wait, the readiness oracle runs afterwards unless the chart
//! opted out. Install and upgrade retry; rollback runs once and targets the
//! last revision observed healthy.

use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{KubeError, Result};
use crate::readiness::wait_for_ready;
use crate::release::{Chart, ReleaseRecord, ReleaseState};
use crate::resources::{ParsedResource, ResourceManager};
use crate::store::ReleaseStore;

/// One chart deploy outcome
#[derive(Debug, Clone)]
pub struct DeployedRelease {
    pub record: ReleaseRecord,
    /// Revision this deploy superseded, when upgrading
    pub previous_revision: Option<u32>,
}

/// The release engine, bound to one cluster and one record store
pub struct ReleaseEngine<S> {
    manager: ResourceManager,
    store: S,
}

impl<S: ReleaseStore> ReleaseEngine<S> {
    pub fn new(manager: ResourceManager, store: S) -> Self {
        Self { manager, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Install or upgrade a chart, waiting for readiness and rolling back a
    /// failed upgrade to the last healthy revision.
    pub async fn deploy(&mut self, chart: &Chart) -> Result<DeployedRelease> {
        let history = self
            .store
            .history(&chart.namespace, &chart.release_name)
            .await?;

        if let Some(latest) = history.first() {
            if latest.is_pending() {
                return Err(KubeError::ReleaseBusy {
                    name: latest.name.clone(),
                    namespace: latest.namespace.clone(),
                    status: latest.state.to_string(),
                });
            }
        }

        let last_healthy = history
            .iter()
            .find(|r| r.state == ReleaseState::Deployed)
            .cloned();
        let next_revision = history.first().map(|r| r.revision + 1).unwrap_or(1);
        let upgrading = !history.is_empty();

        let mut record = ReleaseRecord::new(
            chart,
            next_revision,
            if upgrading {
                ReleaseState::PendingUpgrade
            } else {
                ReleaseState::PendingInstall
            },
        );
        self.store.create(&record).await?;
        info!(
            release = %chart.release_name,
            namespace = %chart.namespace,
            revision = next_revision,
            mode = if upgrading { "upgrade" } else { "install" },
            "deploying chart"
        );

        match self.apply_revision(chart, upgrading).await {
            Ok(()) => {
                record.mark(ReleaseState::Deployed);
                self.store.update(&record).await?;
                if let Some(previous) = last_healthy {
                    let mut superseded = previous.clone();
                    superseded.mark(ReleaseState::Superseded);
                    self.store.update(&superseded).await?;
                }
                Ok(DeployedRelease {
                    record,
                    previous_revision: last_healthy_revision(&history),
                })
            }
            Err(e) => {
                warn!(release = %chart.release_name, error = %e, "chart deploy failed");
                record.mark(ReleaseState::Failed);
                self.store.update(&record).await?;

                match last_healthy {
                    Some(target) => {
                        self.rollback_to(chart, &record, &target).await?;
                    }
                    None => {
                        // First install: nothing healthy to return to, clean
                        // up what the attempt created.
                        self.cleanup_failed_install(chart).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Apply a chart's resources with retries, then reconcile readiness.
    async fn apply_revision(&mut self, chart: &Chart, upgrading: bool) -> Result<()> {
        let attempts = chart.retries.max(1);
        let mut last_error: Option<KubeError> = None;

        for attempt in 1..=attempts {
            match self.try_apply(chart, upgrading).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(release = %chart.release_name, attempt, error = %e, "apply attempt failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(2 * u64::from(attempt))).await;
                    }
                }
            }
        }
        if let Some(e) = last_error {
            let message = e.to_string();
            return Err(if upgrading {
                KubeError::UpgradeFailed {
                    name: chart.release_name.clone(),
                    attempts,
                    message,
                }
            } else {
                KubeError::InstallFailed {
                    name: chart.release_name.clone(),
                    attempts,
                    message,
                }
            });
        }

        if !chart.no_wait {
            let resources = self.parse_chart(chart, upgrading).await?;
            wait_for_ready(
                &self.manager,
                &resources,
                &chart.release_name,
                Duration::from_secs(chart.timeout_secs),
            )
            .await?;
        }
        Ok(())
    }

    async fn try_apply(&mut self, chart: &Chart, upgrading: bool) -> Result<()> {
        // CRDs go first and only on install; CRs in the same chart cannot
        // resolve until discovery has seen their definitions.
        let (crds, rest) = split_crds(&chart.manifest)?;
        if !upgrading && !crds.is_empty() {
            let parsed = self.manager.parse_manifest(&crds, &chart.namespace)?;
            self.manager.apply(&parsed).await?;
            self.manager.refresh().await?;
        }

        let resources = self.manager.parse_manifest(&rest, &chart.namespace)?;
        match self.manager.apply(&resources).await {
            Ok(_) => Ok(()),
            Err(e @ KubeError::Apply(_)) => {
                // A conflicting in-place update gets one recreate pass
                // before the attempt counts as failed.
                warn!(release = %chart.release_name, error = %e, "apply conflict, recreating resources");
                for resource in &resources {
                    self.manager.force_recreate(resource).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn parse_chart(&self, chart: &Chart, upgrading: bool) -> Result<Vec<ParsedResource>> {
        let (crds, rest) = split_crds(&chart.manifest)?;
        let mut resources = Vec::new();
        if !upgrading && !crds.is_empty() {
            resources.extend(self.manager.parse_manifest(&crds, &chart.namespace)?);
        }
        resources.extend(self.manager.parse_manifest(&rest, &chart.namespace)?);
        Ok(resources)
    }

    /// Roll a failed upgrade back to the last healthy revision: delete what
    /// the failed attempt introduced, re-apply the target manifest with
    /// force-recreate on conflict. Not retried.
    async fn rollback_to(
        &mut self,
        chart: &Chart,
        failed: &ReleaseRecord,
        target: &ReleaseRecord,
    ) -> Result<()> {
        info!(
            release = %chart.release_name,
            from = failed.revision,
            to = target.revision,
            "rolling back"
        );

        let mut rollback = ReleaseRecord::new(chart, failed.revision + 1, ReleaseState::PendingRollback);
        rollback.manifest = target.manifest.clone();
        self.store.create(&rollback).await?;

        let result = self.perform_rollback(chart, failed, target).await;
        match result {
            Ok(()) => {
                rollback.mark(ReleaseState::Deployed);
                self.store.update(&rollback).await?;
                Ok(())
            }
            Err(e) => {
                rollback.mark(ReleaseState::Failed);
                self.store.update(&rollback).await?;
                Err(KubeError::RollbackFailed {
                    name: chart.release_name.clone(),
                    revision: target.revision,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn perform_rollback(
        &mut self,
        chart: &Chart,
        failed: &ReleaseRecord,
        target: &ReleaseRecord,
    ) -> Result<()> {
        // Resources the failed attempt introduced that the target never had
        // are deleted; everything else is forced back to the target shape.
        let failed_resources = self
            .manager
            .parse_manifest(&strip_crds(&failed.manifest)?, &chart.namespace)?;
        let target_resources = self
            .manager
            .parse_manifest(&strip_crds(&target.manifest)?, &chart.namespace)?;

        let keep: HashSet<_> = target_resources.iter().map(ParsedResource::key).collect();
        let orphans: Vec<ParsedResource> = failed_resources
            .into_iter()
            .filter(|r| !keep.contains(&r.key()))
            .collect();
        self.manager.delete(&orphans).await?;

        for resource in &target_resources {
            self.manager.force_recreate(resource).await?;
        }

        wait_for_ready(
            &self.manager,
            &target_resources,
            &chart.release_name,
            Duration::from_secs(chart.timeout_secs),
        )
        .await
    }

    async fn cleanup_failed_install(&mut self, chart: &Chart) {
        let cleanup = async {
            let resources = self
                .manager
                .parse_manifest(&strip_crds(&chart.manifest)?, &chart.namespace)?;
            self.manager.delete(&resources).await
        };
        if let Err(e) = cleanup.await {
            warn!(release = %chart.release_name, error = %e, "cleanup after failed install incomplete");
        }
    }

    /// Remove a release entirely: delete its live resources and its records.
    pub async fn uninstall(&mut self, namespace: &str, name: &str) -> Result<()> {
        let history = self.store.history(namespace, name).await?;
        let latest = history.first().ok_or_else(|| KubeError::ReleaseNotFound {
            name: name.to_string(),
            namespace: namespace.to_string(),
        })?;

        let resources = self
            .manager
            .parse_manifest(&strip_crds(&latest.manifest)?, namespace)?;
        self.manager.delete(&resources).await?;

        for record in &history {
            self.store.delete(namespace, name, record.revision).await?;
        }
        info!(release = name, namespace, "release uninstalled");
        Ok(())
    }
}

fn last_healthy_revision(history: &[ReleaseRecord]) -> Option<u32> {
    history
        .iter()
        .find(|r| r.state == ReleaseState::Deployed)
        .map(|r| r.revision)
}

/// Split a manifest into its CRD documents and everything else, purely
/// textually so it works before discovery knows the chart's kinds.
fn split_crds(manifest: &str) -> Result<(String, String)> {
    let mut crds = Vec::new();
    let mut rest = Vec::new();
    for doc in manifest.split("\n---") {
        let trimmed = doc.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: serde_yaml::Value = serde_yaml::from_str(trimmed)
            .map_err(|e| KubeError::InvalidManifest(e.to_string()))?;
        if value.get("kind").and_then(|k| k.as_str()) == Some("CustomResourceDefinition") {
            crds.push(trimmed.to_string());
        } else if !value.is_null() {
            rest.push(trimmed.to_string());
        }
    }
    Ok((crds.join("\n---\n"), rest.join("\n---\n")))
}

fn strip_crds(manifest: &str) -> Result<String> {
    Ok(split_crds(manifest)?.1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.dev
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: app-config
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: api
"#;

    #[test]
    fn split_separates_crds() {
        let (crds, rest) = split_crds(MIXED).unwrap();
        assert!(crds.contains("CustomResourceDefinition"));
        assert!(!rest.contains("CustomResourceDefinition"));
        assert!(rest.contains("ConfigMap"));
        assert!(rest.contains("Deployment"));
    }

    #[test]
    fn strip_removes_crds_only() {
        let rest = strip_crds(MIXED).unwrap();
        assert!(!rest.contains("CustomResourceDefinition"));
        assert_eq!(rest.matches("kind:").count(), 2);
    }

    #[test]
    fn last_healthy_skips_failed_revisions() {
        let chart = Chart::synthetic("api", "default", String::new(), false);
        let history = vec![
            ReleaseRecord::new(&chart, 3, ReleaseState::Failed),
            ReleaseRecord::new(&chart, 2, ReleaseState::Deployed),
            ReleaseRecord::new(&chart, 1, ReleaseState::Superseded),
        ];
        assert_eq!(last_healthy_revision(&history), Some(2));
    }
}
