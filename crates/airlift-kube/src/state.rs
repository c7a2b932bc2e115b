//! Deployed-package state store
//!
//! After every component of a bundle lands, a `DeployedPackage` record is
//! written to a well-known secret in the reserved namespace, keyed by bundle
//! name. Later deploys read it to choose install vs upgrade, `remove` reads
//! it to know what to tear down, and nothing is written until the whole
//! deploy succeeded.

use airlift_core::Bundle;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{KubeError, Result};

/// Reserved namespace holding airlift cluster state.
pub const STATE_NAMESPACE: &str = "airlift";

const PACKAGE_SECRET_PREFIX: &str = "airlift-package-";
const SECRET_TYPE: &str = "airlift.dev/package.v1";

/// The record of one deployed bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedPackage {
    /// Version of the CLI that performed the deploy
    pub cli_version: String,

    /// Snapshot of the bundle descriptor as deployed
    pub data: Bundle,

    /// Components that were executed, in execution order
    pub deployed_components: Vec<DeployedComponent>,

    /// When the record was written
    pub deployed_at: DateTime<Utc>,
}

/// One executed component and the releases it created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedComponent {
    pub name: String,

    /// Installed charts, as (namespace, release name) pairs in install order
    #[serde(default)]
    pub installed_charts: Vec<InstalledChart>,
}

/// A chart release recorded against a component
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledChart {
    pub namespace: String,
    pub release_name: String,
}

/// Reads and writes `DeployedPackage` secrets
pub struct PackageStore {
    client: Client,
}

impl PackageStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), STATE_NAMESPACE)
    }

    fn secret_name(bundle_name: &str) -> String {
        format!("{PACKAGE_SECRET_PREFIX}{bundle_name}")
    }

    /// Make sure the reserved namespace exists before writing into it.
    pub async fn ensure_namespace(&self) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(STATE_NAMESPACE.to_string()),
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

    /// Read the record for a bundle, if one exists.
    pub async fn read(&self, bundle_name: &str) -> Result<Option<DeployedPackage>> {
        match self.api().get(&Self::secret_name(bundle_name)).await {
            Ok(secret) => {
                let data = secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get("data"))
                    .ok_or_else(|| {
                        KubeError::Storage("package secret missing 'data'".to_string())
                    })?;
                Ok(Some(serde_json::from_slice(&data.0)?))
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write (or replace) the record for a bundle.
    pub async fn write(&self, package: &DeployedPackage) -> Result<()> {
        self.ensure_namespace().await?;

        let name = Self::secret_name(&package.data.metadata.name);
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "airlift".to_string(),
        );
        labels.insert(
            "airlift.dev/package-name".to_string(),
            package.data.metadata.name.clone(),
        );

        let mut data = BTreeMap::new();
        data.insert(
            "data".to_string(),
            k8s_openapi::ByteString(serde_json::to_vec(package)?),
        );

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(STATE_NAMESPACE.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        };

        let api = self.api();
        match api.get(&name).await {
            Ok(_) => {
                api.replace(&name, &PostParams::default(), &secret).await?;
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                api.create(&PostParams::default(), &secret).await?;
            }
            Err(e) => return Err(e.into()),
        }
        info!(bundle = %package.data.metadata.name, "deployed package state written");
        Ok(())
    }

    /// Delete the record for a bundle.
    pub async fn delete(&self, bundle_name: &str) -> Result<()> {
        match self
            .api()
            .delete(&Self::secret_name(bundle_name), &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> DeployedPackage {
        let bundle = Bundle::parse(
            r#"
kind: AppConfig
metadata:
  name: demo
components:
  - name: web
    required: true
"#,
        )
        .unwrap();
        DeployedPackage {
            cli_version: "0.4.0".to_string(),
            data: bundle,
            deployed_components: vec![DeployedComponent {
                name: "web".to_string(),
                installed_charts: vec![InstalledChart {
                    namespace: "web".to_string(),
                    release_name: "nginx-manifests".to_string(),
                }],
            }],
            deployed_at: Utc::now(),
        }
    }

    #[test]
    fn record_roundtrips_through_json() {
        let original = package();
        let bytes = serde_json::to_vec(&original).unwrap();
        let parsed: DeployedPackage = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.data.metadata.name, "demo");
        assert_eq!(parsed.deployed_components.len(), 1);
        assert_eq!(
            parsed.deployed_components[0].installed_charts[0].release_name,
            "nginx-manifests"
        );
    }

    #[test]
    fn secret_name_is_keyed_by_bundle() {
        assert_eq!(PackageStore::secret_name("demo"), "airlift-package-demo");
    }
}
