//! Deploy pipeline
//!
//! One `deploy` invocation end to end: resolve and verify the archive,
//! filter components, execute them in declared order, then persist the
//! `DeployedPackage` record. The scoped temp directory owns every extracted
//! byte and is removed on all exit paths.

use airlift_core::{
    archive, filter, signing, ClusterFacts, HostFacts, Selection, VariableState,
};
use airlift_kube::{
    Cluster, DeployedComponent, DeployedPackage, PackageStore, ReleaseEngine, ResourceManager,
    SecretReleaseStore,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{DeployError, Result};
use crate::executor::{run_component, ComponentContext};
use crate::source::{BundleSource, LoadedBundle, VerifyOptions};

/// Everything a deploy invocation is configured with. No process-wide
/// state: the CLI builds one of these and hands it down.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// CSV of component and group names
    pub components: String,
    /// `--set` variable overrides
    pub set: HashMap<String, String>,
    /// Public key file for signed bundles
    pub key_path: Option<PathBuf>,
    /// Expected bundle shasum
    pub shasum: Option<String>,
    /// Plain-HTTP registries
    pub plain_http: bool,
    /// Skip TLS verification
    pub insecure_skip_tls: bool,
    /// Per-chart timeout in seconds
    pub timeout_secs: u64,
    /// Install/upgrade/push retries
    pub retries: u32,
    /// Skip readiness reconciliation on every chart
    pub no_wait: bool,
    /// Whole-deploy budget in seconds; unlimited when `None`
    pub deploy_timeout_secs: Option<u64>,
    /// Cross-deploy architecture override
    pub architecture: Option<String>,
    /// Shared image layer cache
    pub cache_dir: Option<PathBuf>,
    /// Cluster registry images are pushed to
    pub registry_address: String,
    /// Cluster git server repos are mirrored to
    pub git_address: String,
    pub git_username: String,
    pub git_password: String,
    /// Version stamp recorded in the deployed-package state
    pub cli_version: String,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            components: String::new(),
            set: HashMap::new(),
            key_path: None,
            shasum: None,
            plain_http: false,
            insecure_skip_tls: false,
            timeout_secs: airlift_kube::DEFAULT_TIMEOUT_SECS,
            retries: airlift_kube::DEFAULT_RETRIES,
            no_wait: false,
            deploy_timeout_secs: None,
            architecture: None,
            cache_dir: None,
            registry_address: "127.0.0.1:31999".to_string(),
            git_address: "http://airlift-gitserver.airlift.svc.cluster.local:3000".to_string(),
            git_username: "airlift-push".to_string(),
            git_password: String::new(),
            cli_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Outcome of a successful deploy
pub struct DeployResult {
    pub package: DeployedPackage,
    /// `service -> URL` rows for the closing table
    pub connect_table: Vec<(String, String)>,
}

/// Load a bundle, run every selected component and persist state.
///
/// The optional whole-deploy budget cancels the pipeline at its next
/// suspension point; partial cluster state is the rollback path's problem,
/// partial local state dies with the temp dir.
pub async fn deploy(source: &str, options: DeployOptions) -> Result<DeployResult> {
    match options.deploy_timeout_secs {
        Some(secs) => {
            let budget = std::time::Duration::from_secs(secs);
            match tokio::time::timeout(budget, deploy_inner(source, options)).await {
                Ok(result) => result,
                Err(_) => Err(DeployError::DeployTimeout { seconds: secs }),
            }
        }
        None => deploy_inner(source, options).await,
    }
}

async fn deploy_inner(source: &str, options: DeployOptions) -> Result<DeployResult> {
    // The temp dir owns all extracted state; dropping it cleans up on
    // success, failure and panic alike.
    let workdir = TempDir::with_prefix("airlift-deploy-")?;

    let verify = VerifyOptions {
        public_key: load_key(&options)?,
        shasum: options.shasum.clone(),
        plain_http: options.plain_http,
        insecure_skip_tls: options.insecure_skip_tls,
    };
    let source = BundleSource::parse(source)?;
    let LoadedBundle { root, bundle } = crate::source::load(&source, workdir.path(), &verify).await?;

    let host = HostFacts::default();
    let arch = options
        .architecture
        .clone()
        .unwrap_or_else(|| host.arch.clone());
    if let Some(bundle_arch) = bundle.metadata.architecture.as_deref() {
        if bundle_arch != arch {
            return Err(DeployError::ArchMismatch {
                bundle_arch: bundle_arch.to_string(),
                host_arch: arch,
            });
        }
    }

    let variables = Arc::new(Mutex::new(VariableState::new(&bundle, &options.set)?));

    let cluster = Cluster::connect().await?;
    let cluster_facts = match cluster.info().await {
        Ok(info) => ClusterFacts {
            arch: info.arch,
            distro: info.distro,
        },
        Err(e) => {
            warn!(error = %e, "could not read cluster facts, filtering on host facts only");
            ClusterFacts::default()
        }
    };

    let selection = Selection::parse(&options.components);
    let selected = filter::select_components(&bundle, &host, &cluster_facts, &selection)?;
    info!(
        bundle = %bundle.metadata.name,
        selected = selected.len(),
        "components selected"
    );

    // Prior deploys of this bundle inform nothing here directly (install vs
    // upgrade resolves per release), but a stale partial record is worth
    // surfacing before work starts.
    let package_store = PackageStore::new(cluster.client().clone());
    if let Some(previous) = package_store.read(&bundle.metadata.name).await? {
        info!(
            bundle = %bundle.metadata.name,
            deployed_at = %previous.deployed_at,
            "bundle was deployed before, releases will upgrade"
        );
    }

    let manager = ResourceManager::new(cluster.client().clone()).await?;
    let store = SecretReleaseStore::new(cluster.client().clone());
    let mut engine = ReleaseEngine::new(manager, store);

    let yolo = bundle.metadata.yolo;
    let mut deployed: Vec<DeployedComponent> = Vec::new();

    for &component in &selected {
        let dir = component_dir(&root, &component.name)?;
        let mut ctx = ComponentContext {
            component,
            dir,
            variables: variables.clone(),
            cluster: &cluster,
            engine: &mut engine,
            options: &options,
            yolo,
            arch: arch.clone(),
        };
        // The first failure aborts the deploy; rollback already ran inside
        // the release engine and the failed component's onFailure hooks ran
        // in the executor.
        deployed.push(run_component(&mut ctx).await?);
    }

    let package = DeployedPackage {
        cli_version: options.cli_version.clone(),
        data: bundle,
        deployed_components: deployed,
        deployed_at: Utc::now(),
    };
    package_store.write(&package).await?;

    let connect_table = cluster.connect_table().await.unwrap_or_default();
    Ok(DeployResult {
        package,
        connect_table,
    })
}

/// Remove a previously deployed bundle: uninstall its releases in reverse
/// component order, then delete the state record.
pub async fn remove(bundle_name: &str) -> Result<()> {
    let cluster = Cluster::connect().await?;
    let package_store = PackageStore::new(cluster.client().clone());
    let Some(package) = package_store.read(bundle_name).await? else {
        return Err(DeployError::Kube(airlift_kube::KubeError::ReleaseNotFound {
            name: bundle_name.to_string(),
            namespace: airlift_kube::STATE_NAMESPACE.to_string(),
        }));
    };

    let manager = ResourceManager::new(cluster.client().clone()).await?;
    let store = SecretReleaseStore::new(cluster.client().clone());
    let mut engine = ReleaseEngine::new(manager, store);

    for component in package.deployed_components.iter().rev() {
        for chart in component.installed_charts.iter().rev() {
            engine
                .uninstall(&chart.namespace, &chart.release_name)
                .await?;
        }
    }

    package_store.delete(bundle_name).await?;
    info!(bundle = bundle_name, "bundle removed");
    Ok(())
}

/// Extract a component's tarball next to the bundle root, or reuse the
/// directory when the bundle shipped it unpacked.
fn component_dir(root: &std::path::Path, name: &str) -> Result<PathBuf> {
    let dir = root.join("components").join(name);
    if dir.is_dir() {
        return Ok(dir);
    }
    let tarball = root.join("components").join(format!("{name}.tar"));
    if tarball.exists() {
        archive::extract_component(&tarball, &dir)?;
        return Ok(dir);
    }
    // Components with only actions and images pulled at deploy time have no
    // archive at all.
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn load_key(options: &DeployOptions) -> Result<Option<minisign::PublicKey>> {
    match &options.key_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(Some(signing::load_public_key(&content)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_engine_defaults() {
        let options = DeployOptions::default();
        assert_eq!(options.timeout_secs, 15 * 60);
        assert_eq!(options.retries, 3);
        assert!(!options.no_wait);
        assert_eq!(options.registry_address, "127.0.0.1:31999");
    }

    #[test]
    fn component_dir_creates_empty_dir_for_archiveless_component() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = component_dir(temp.path(), "hooks-only").unwrap();
        assert!(dir.is_dir());
    }
}
