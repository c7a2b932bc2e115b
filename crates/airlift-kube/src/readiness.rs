//! Readiness reconciliation
//!
//! The second-stage wait after a chart is applied: every object is polled
//! until its `.status` reports ready. Objects that never grow a `.status`
//! are treated as ready on first sighting, after a short settle delay so a
//! slow operator writing status moments after apply is not mistaken for a
//! status-less kind.

use kube::api::DynamicObject;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{KubeError, Result};
use crate::resources::{ParsedResource, ResourceManager};

/// Poll interval between reconciliation rounds.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Grace period before a status-less object counts as ready.
const STATUSLESS_SETTLE: Duration = Duration::from_secs(2);

/// Readiness verdict for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

/// Wait until every resource reports ready or the timeout elapses.
pub async fn wait_for_ready(
    manager: &ResourceManager,
    resources: &[ParsedResource],
    release: &str,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    tokio::time::sleep(STATUSLESS_SETTLE).await;

    loop {
        let mut blockers = Vec::new();
        for resource in resources {
            let live = manager.get_live(resource).await?;
            match live {
                None => blockers.push(format!("{} is gone", resource.display_name())),
                Some(obj) => {
                    if let Readiness::NotReady(reason) = object_readiness(&obj) {
                        blockers.push(format!("{}: {reason}", resource.display_name()));
                    }
                }
            }
        }

        if blockers.is_empty() {
            return Ok(());
        }
        debug!(release, blockers = blockers.len(), "waiting on resources");

        if Instant::now() >= deadline {
            return Err(KubeError::NotReady {
                name: release.to_string(),
                timeout_secs: timeout.as_secs(),
                message: blockers.join("; "),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Inspect one live object's `.status`.
///
/// Status-less objects are ready by definition. For objects that do carry a
/// status, generation lag, explicit replica accounting and standard
/// condition types are checked, in that order.
pub fn object_readiness(obj: &DynamicObject) -> Readiness {
    let data = &obj.data;
    let Some(status) = data.get("status").filter(|s| !s.is_null()) else {
        return Readiness::Ready;
    };

    // An object still reconciling an old generation is not ready no matter
    // what its conditions claim.
    if let (Some(generation), Some(observed)) = (
        obj.metadata.generation,
        status.get("observedGeneration").and_then(Value::as_i64),
    ) {
        if observed < generation {
            return Readiness::NotReady(format!(
                "observedGeneration {observed} behind generation {generation}"
            ));
        }
    }

    // Replica-shaped workloads: every requested replica must be ready.
    let desired = data
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(Value::as_i64);
    if let Some(desired) = desired {
        let ready = status
            .get("readyReplicas")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if ready < desired {
            return Readiness::NotReady(format!("{ready}/{desired} replicas ready"));
        }
        return Readiness::Ready;
    }

    // DaemonSets account per node instead of spec.replicas.
    if let (Some(desired), Some(ready)) = (
        status.get("desiredNumberScheduled").and_then(Value::as_i64),
        status.get("numberReady").and_then(Value::as_i64),
    ) {
        if ready < desired {
            return Readiness::NotReady(format!("{ready}/{desired} pods ready"));
        }
        return Readiness::Ready;
    }

    // Jobs: done when any completion succeeded.
    if status.get("succeeded").and_then(Value::as_i64).is_some()
        || status.get("failed").and_then(Value::as_i64).is_some()
    {
        let succeeded = status.get("succeeded").and_then(Value::as_i64).unwrap_or(0);
        if succeeded > 0 {
            return Readiness::Ready;
        }
        return Readiness::NotReady("no completions succeeded yet".to_string());
    }

    // Pods report a phase.
    if let Some(phase) = status.get("phase").and_then(Value::as_str) {
        return match phase {
            "Running" | "Succeeded" | "Active" | "Bound" => Readiness::Ready,
            other => Readiness::NotReady(format!("phase {other}")),
        };
    }

    // Anything else with conditions: Ready/Available must be True when
    // present; an object whose conditions say nothing blocking is ready.
    if let Some(conditions) = status.get("conditions").and_then(Value::as_array) {
        for condition in conditions {
            let kind = condition.get("type").and_then(Value::as_str).unwrap_or("");
            let value = condition
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("Unknown");
            if matches!(kind, "Ready" | "Available") && value != "True" {
                return Readiness::NotReady(format!("condition {kind} is {value}"));
            }
        }
    }

    Readiness::Ready
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(json: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn statusless_object_ready_on_first_sighting() {
        let obj = object(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "config"},
            "data": {"k": "v"}
        }));
        assert_eq!(object_readiness(&obj), Readiness::Ready);
    }

    #[test]
    fn deployment_waits_for_replicas() {
        let not_ready = object(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "api"},
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 1}
        }));
        assert!(matches!(object_readiness(&not_ready), Readiness::NotReady(_)));

        let ready = object(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "api"},
            "spec": {"replicas": 3},
            "status": {"readyReplicas": 3}
        }));
        assert_eq!(object_readiness(&ready), Readiness::Ready);
    }

    #[test]
    fn generation_lag_blocks() {
        let obj = object(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "api", "generation": 4},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 3, "readyReplicas": 1}
        }));
        assert!(matches!(object_readiness(&obj), Readiness::NotReady(_)));
    }

    #[test]
    fn job_readiness_tracks_success() {
        let pending = object(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate"},
            "status": {"failed": 1}
        }));
        assert!(matches!(object_readiness(&pending), Readiness::NotReady(_)));

        let done = object(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate"},
            "status": {"succeeded": 1}
        }));
        assert_eq!(object_readiness(&done), Readiness::Ready);
    }

    #[test]
    fn condition_ready_false_blocks() {
        let obj = object(serde_json::json!({
            "apiVersion": "example.dev/v1",
            "kind": "Widget",
            "metadata": {"name": "w"},
            "status": {"conditions": [{"type": "Ready", "status": "False"}]}
        }));
        assert!(matches!(object_readiness(&obj), Readiness::NotReady(_)));
    }

    #[test]
    fn custom_resource_with_untyped_status_is_ready() {
        let obj = object(serde_json::json!({
            "apiVersion": "example.dev/v1",
            "kind": "Widget",
            "metadata": {"name": "w"},
            "status": {"lastSync": "2026-01-01T00:00:00Z"}
        }));
        assert_eq!(object_readiness(&obj), Readiness::Ready);
    }
}
