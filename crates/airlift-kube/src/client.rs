//! Cluster access
//!
//! One `Cluster` per deploy invocation: a connected client plus the facts
//! the bundle filter needs (node architecture, distro) and the small
//! conveniences the pipeline uses (namespace creation, the post-deploy
//! connection table).

use k8s_openapi::api::core::v1::{Namespace, Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::debug;

use crate::error::{KubeError, Result};

/// Annotation a Service sets to appear in the post-deploy connection table.
pub const CONNECT_URL_ANNOTATION: &str = "airlift.dev/connect-url";

/// Architecture and distro as observed from the cluster's nodes
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub arch: Option<String>,
    pub distro: Option<String>,
}

/// A connected target cluster
pub struct Cluster {
    client: Client,
}

impl Cluster {
    /// Connect using the ambient kubeconfig.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| KubeError::Unreachable {
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Probe node metadata for architecture and distro. Failures mean the
    /// cluster is unreachable, which the caller may tolerate (YOLO bundles
    /// still render a selection).
    pub async fn info(&self) -> Result<ClusterInfo> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default().limit(10)).await?;

        let mut info = ClusterInfo::default();
        for node in &list.items {
            if let Some(status) = &node.status {
                if let Some(node_info) = &status.node_info {
                    if info.arch.is_none() {
                        info.arch = Some(node_info.architecture.clone());
                    }
                    // kubelet version strings carry the distro suffix for
                    // the distributions that matter here, e.g. "+k3s1".
                    if info.distro.is_none() {
                        info.distro = detect_distro(&node_info.kubelet_version);
                    }
                }
            }
        }
        debug!(?info, "cluster facts collected");
        Ok(info)
    }

    /// Create a namespace if it does not already exist.
    pub async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Collect the `service -> URL` rows printed after a successful deploy.
    pub async fn connect_table(&self) -> Result<Vec<(String, String)>> {
        let services: Api<Service> = Api::all(self.client.clone());
        let list = services.list(&ListParams::default()).await?;

        let mut rows = Vec::new();
        for service in list.items {
            let Some(url) = service
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(CONNECT_URL_ANNOTATION))
            else {
                continue;
            };
            let name = service.metadata.name.unwrap_or_default();
            rows.push((name, url.clone()));
        }
        rows.sort();
        Ok(rows)
    }
}

fn detect_distro(kubelet_version: &str) -> Option<String> {
    if kubelet_version.contains("+k3s") {
        Some("k3s".to_string())
    } else if kubelet_version.contains("+k0s") {
        Some("k0s".to_string())
    } else if kubelet_version.contains("-eks-") {
        Some("eks".to_string())
    } else if kubelet_version.contains("+rke2") {
        Some("rke2".to_string())
    } else if kubelet_version.contains("-gke.") {
        Some("gke".to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distro_detection_from_kubelet_version() {
        assert_eq!(detect_distro("v1.31.4+k3s1"), Some("k3s".to_string()));
        assert_eq!(detect_distro("v1.30.0-eks-a737599"), Some("eks".to_string()));
        assert_eq!(detect_distro("v1.32.1+rke2r1"), Some("rke2".to_string()));
        assert_eq!(detect_distro("v1.31.0"), None);
    }
}
