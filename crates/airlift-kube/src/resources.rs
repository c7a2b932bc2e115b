//! Dynamic manifest apply and delete
//!
//! Multi-document YAML manifests are resolved against API discovery and
//! applied with Server-Side Apply, so repeated applies of the same chart
//! revision are no-ops and rollbacks can force-recreate where in-place
//! updates are rejected. Creation orders cluster-shaping kinds (namespaces,
//! CRDs) first; deletion walks the reverse order.

use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use tracing::{debug, warn};

use crate::error::{KubeError, Result};

/// Field manager name for Server-Side Apply.
const FIELD_MANAGER: &str = "airlift";

/// A manifest document resolved against discovery and ready to apply
#[derive(Debug, Clone)]
pub struct ParsedResource {
    pub obj: DynamicObject,
    pub gvk: GroupVersionKind,
    pub api_resource: ApiResource,
    pub capabilities: ApiCapabilities,
}

impl ParsedResource {
    pub fn name(&self) -> &str {
        self.obj.metadata.name.as_deref().unwrap_or("unnamed")
    }

    pub fn display_name(&self) -> String {
        match &self.obj.metadata.namespace {
            Some(ns) => format!("{}/{}/{}", ns, self.gvk.kind, self.name()),
            None => format!("{}/{}", self.gvk.kind, self.name()),
        }
    }

    pub fn is_crd(&self) -> bool {
        self.gvk.kind == "CustomResourceDefinition"
    }

    /// Identity used to diff revisions during rollback.
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            api_version: self.obj.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_default(),
            kind: self.gvk.kind.clone(),
            namespace: self.obj.metadata.namespace.clone(),
            name: self.name().to_string(),
        }
    }

}

/// Kinds that must exist before anything else in the set.
fn creation_rank(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" | "ClusterRole" | "Role" => 2,
        "ClusterRoleBinding" | "RoleBinding" => 3,
        "ConfigMap" | "Secret" => 4,
        _ => 5,
    }
}

/// Stable identity of an applied object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", ns, self.kind, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Applies and deletes dynamic resources against one cluster
pub struct ResourceManager {
    client: Client,
    discovery: Discovery,
}

impl ResourceManager {
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        Ok(Self { client, discovery })
    }

    /// Re-run discovery; required after CRDs were applied so their CRs
    /// resolve.
    pub async fn refresh(&mut self) -> Result<()> {
        self.discovery = Discovery::new(self.client.clone()).run().await?;
        Ok(())
    }

    /// Parse a multi-document manifest, resolving each document against
    /// discovery and defaulting the namespace of namespaced resources.
    pub fn parse_manifest(&self, manifest: &str, default_namespace: &str) -> Result<Vec<ParsedResource>> {
        let mut resources = Vec::new();

        for doc in manifest.split("\n---") {
            let doc = doc.trim();
            if doc.is_empty() || doc.lines().all(|l| l.trim_start().starts_with('#')) {
                continue;
            }

            let value: serde_yaml::Value = serde_yaml::from_str(doc)
                .map_err(|e| KubeError::InvalidManifest(e.to_string()))?;
            if value.is_null() {
                continue;
            }

            let api_version = value
                .get("apiVersion")
                .and_then(|v| v.as_str())
                .ok_or_else(|| KubeError::InvalidManifest("document missing apiVersion".to_string()))?
                .to_string();
            let kind = value
                .get("kind")
                .and_then(|v| v.as_str())
                .ok_or_else(|| KubeError::InvalidManifest("document missing kind".to_string()))?
                .to_string();

            let (group, version) = match api_version.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => (String::new(), api_version.clone()),
            };
            let gvk = GroupVersionKind {
                group,
                version,
                kind: kind.clone(),
            };

            let (api_resource, capabilities) =
                self.discovery.resolve_gvk(&gvk).ok_or_else(|| KubeError::UnknownKind {
                    kind,
                    api_version,
                })?;

            let json = serde_json::to_value(&value)?;
            let mut obj: DynamicObject = serde_json::from_value(json)?;
            if capabilities.scope == Scope::Namespaced && obj.metadata.namespace.is_none() {
                obj.metadata.namespace = Some(default_namespace.to_string());
            }

            resources.push(ParsedResource {
                obj,
                gvk,
                api_resource,
                capabilities,
            });
        }

        // Stable sort keeps declaration order within each rank.
        resources.sort_by_key(|r| creation_rank(&r.gvk.kind));
        Ok(resources)
    }

    fn api_for(&self, resource: &ParsedResource) -> Api<DynamicObject> {
        match (&resource.capabilities.scope, &resource.obj.metadata.namespace) {
            (Scope::Namespaced, Some(ns)) => {
                Api::namespaced_with(self.client.clone(), ns, &resource.api_resource)
            }
            _ => Api::all_with(self.client.clone(), &resource.api_resource),
        }
    }

    /// Server-Side Apply every resource, in creation order. Fails on the
    /// first error; already-applied resources stay, the release engine's
    /// rollback owns their fate.
    pub async fn apply(&self, resources: &[ParsedResource]) -> Result<Vec<ObjectKey>> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut applied = Vec::with_capacity(resources.len());

        for resource in resources {
            let api = self.api_for(resource);
            debug!(resource = %resource.display_name(), "applying");
            api.patch(
                resource.name(),
                &params,
                &Patch::Apply(&resource.obj),
            )
            .await
            .map_err(|e| {
                KubeError::Apply(format!("{}: {e}", resource.display_name()))
            })?;
            applied.push(resource.key());
        }
        Ok(applied)
    }

    /// Delete resources in reverse creation order, tolerating 404s.
    pub async fn delete(&self, resources: &[ParsedResource]) -> Result<()> {
        for resource in resources.iter().rev() {
            let api = self.api_for(resource);
            debug!(resource = %resource.display_name(), "deleting");
            match api.delete(resource.name(), &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => {
                    return Err(KubeError::Delete(format!(
                        "{}: {e}",
                        resource.display_name()
                    )))
                }
            }
        }
        Ok(())
    }

    /// Delete a resource then re-apply it. The escape hatch for updates the
    /// API server rejects (immutable fields).
    pub async fn force_recreate(&self, resource: &ParsedResource) -> Result<()> {
        let api = self.api_for(resource);
        warn!(resource = %resource.display_name(), "force recreating");
        match api.delete(resource.name(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => {
                return Err(KubeError::Delete(format!(
                    "{}: {e}",
                    resource.display_name()
                )))
            }
        }
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(resource.name(), &params, &Patch::Apply(&resource.obj))
            .await
            .map_err(|e| KubeError::Apply(format!("{}: {e}", resource.display_name())))?;
        Ok(())
    }

    /// Fetch the live object behind a parsed resource, if it exists.
    pub async fn get_live(&self, resource: &ParsedResource) -> Result<Option<DynamicObject>> {
        let api = self.api_for(resource);
        match api.get(resource.name()).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // parse_manifest needs live discovery; the pure pieces are tested here
    // and the full path in cluster-backed integration runs.

    #[test]
    fn object_key_display() {
        let key = ObjectKey {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            namespace: Some("web".to_string()),
            name: "nginx".to_string(),
        };
        assert_eq!(key.to_string(), "web/Deployment/nginx");
    }

    #[test]
    fn creation_rank_orders_cluster_shaping_kinds_first() {
        assert!(creation_rank("Namespace") < creation_rank("CustomResourceDefinition"));
        assert!(creation_rank("CustomResourceDefinition") < creation_rank("Deployment"));
        assert!(creation_rank("ConfigMap") < creation_rank("Service"));
    }
}
