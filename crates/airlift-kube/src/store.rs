//! Release record storage
//!
//! Revision records are kept in Kubernetes Secrets in the release's own
//! namespace, labeled for listing. The trait seam exists so the engine can
//! be exercised against an in-memory store in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{KubeError, Result};
use crate::release::{release_storage_key, ReleaseRecord};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const RELEASE_NAME_LABEL: &str = "airlift.dev/release-name";
const RELEASE_REVISION_LABEL: &str = "airlift.dev/release-revision";
const SECRET_TYPE: &str = "airlift.dev/release.v1";

/// Persistence seam for release revision records
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// All revisions of a release, newest first. Empty when none exist.
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseRecord>>;

    /// Create a new revision record; the revision must not exist yet.
    async fn create(&self, record: &ReleaseRecord) -> Result<()>;

    /// Replace an existing revision record.
    async fn update(&self, record: &ReleaseRecord) -> Result<()>;

    /// Delete one revision record.
    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()>;

    /// Latest revision, if any.
    async fn latest(&self, namespace: &str, name: &str) -> Result<Option<ReleaseRecord>> {
        Ok(self.history(namespace, name).await?.into_iter().next())
    }
}

/// Secret-backed store, the production driver
pub struct SecretReleaseStore {
    client: Client,
}

impl SecretReleaseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn build_secret(record: &ReleaseRecord) -> Result<Secret> {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), "airlift".to_string());
        labels.insert(RELEASE_NAME_LABEL.to_string(), record.name.clone());
        labels.insert(
            RELEASE_REVISION_LABEL.to_string(),
            record.revision.to_string(),
        );

        let mut data = BTreeMap::new();
        data.insert(
            "release".to_string(),
            k8s_openapi::ByteString(serde_json::to_vec(record)?),
        );

        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(record.storage_key()),
                namespace: Some(record.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    fn parse_secret(secret: &Secret) -> Result<ReleaseRecord> {
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get("release"))
            .ok_or_else(|| KubeError::Storage("secret missing 'release' data".to_string()))?;
        Ok(serde_json::from_slice(&data.0)?)
    }
}

#[async_trait]
impl ReleaseStore for SecretReleaseStore {
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseRecord>> {
        let selector = format!("{MANAGED_BY_LABEL}=airlift,{RELEASE_NAME_LABEL}={name}");
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;

        let mut records: Vec<ReleaseRecord> = list
            .items
            .iter()
            .filter_map(|s| Self::parse_secret(s).ok())
            .collect();
        records.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(records)
    }

    async fn create(&self, record: &ReleaseRecord) -> Result<()> {
        let secret = Self::build_secret(record)?;
        self.api(&record.namespace)
            .create(&PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn update(&self, record: &ReleaseRecord) -> Result<()> {
        let secret = Self::build_secret(record)?;
        self.api(&record.namespace)
            .replace(&record.storage_key(), &PostParams::default(), &secret)
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        self.api(namespace)
            .delete(
                &release_storage_key(name, revision),
                &DeleteParams::default(),
            )
            .await?;
        Ok(())
    }
}

/// In-memory store for engine tests
#[derive(Default)]
pub struct MemoryReleaseStore {
    records: Mutex<Vec<ReleaseRecord>>,
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn history(&self, namespace: &str, name: &str) -> Result<Vec<ReleaseRecord>> {
        let records = self.records.lock().expect("store lock");
        let mut matching: Vec<ReleaseRecord> = records
            .iter()
            .filter(|r| r.namespace == namespace && r.name == name)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(matching)
    }

    async fn create(&self, record: &ReleaseRecord) -> Result<()> {
        let mut records = self.records.lock().expect("store lock");
        if records.iter().any(|r| {
            r.namespace == record.namespace
                && r.name == record.name
                && r.revision == record.revision
        }) {
            return Err(KubeError::Storage(format!(
                "revision {} of '{}' already exists",
                record.revision, record.name
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn update(&self, record: &ReleaseRecord) -> Result<()> {
        let mut records = self.records.lock().expect("store lock");
        let existing = records
            .iter_mut()
            .find(|r| {
                r.namespace == record.namespace
                    && r.name == record.name
                    && r.revision == record.revision
            })
            .ok_or_else(|| KubeError::Storage("no such revision".to_string()))?;
        *existing = record.clone();
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str, revision: u32) -> Result<()> {
        let mut records = self.records.lock().expect("store lock");
        records.retain(|r| {
            !(r.namespace == namespace && r.name == name && r.revision == revision)
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::{Chart, ReleaseState};

    fn record(revision: u32, state: ReleaseState) -> ReleaseRecord {
        let chart = Chart::synthetic("api", "default", "kind: ConfigMap".to_string(), false);
        ReleaseRecord::new(&chart, revision, state)
    }

    #[tokio::test]
    async fn memory_store_orders_newest_first() {
        let store = MemoryReleaseStore::new();
        store.create(&record(1, ReleaseState::Superseded)).await.unwrap();
        store.create(&record(2, ReleaseState::Deployed)).await.unwrap();

        let history = store.history("default", "api").await.unwrap();
        assert_eq!(history[0].revision, 2);
        assert_eq!(history[1].revision, 1);

        let latest = store.latest("default", "api").await.unwrap().unwrap();
        assert_eq!(latest.revision, 2);
    }

    #[tokio::test]
    async fn duplicate_revision_rejected() {
        let store = MemoryReleaseStore::new();
        store.create(&record(1, ReleaseState::Deployed)).await.unwrap();
        assert!(store.create(&record(1, ReleaseState::Deployed)).await.is_err());
    }

    #[test]
    fn secret_roundtrip() {
        let original = record(1, ReleaseState::Deployed);
        let secret = SecretReleaseStore::build_secret(&original).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("airlift.release.v1.api.v1"));

        let parsed = SecretReleaseStore::parse_secret(&secret).unwrap();
        assert_eq!(parsed.name, original.name);
        assert_eq!(parsed.revision, original.revision);
        assert_eq!(parsed.state, original.state);
    }
}
