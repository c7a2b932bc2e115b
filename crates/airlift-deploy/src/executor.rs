//! Component executor
//!
//! Runs one selected component through its fixed step order:
//!
//! ```text
//! actions.before -> files -> images push -> repos push -> data injections
//!   -> charts -> manifests -> actions.after -> actions.on_success
//! ```
//!
//! Steps never reorder, even when independent, because actions may feed
//! later steps through `set_variables`. The first failure runs
//! `actions.on_failure` best-effort and surfaces as a component error that
//! aborts the whole deploy.

use airlift_core::{Component, VariableState};
use airlift_git::GitServerConfig;
use airlift_kube::{
    Chart, Cluster, DeployedComponent, InstalledChart, ReleaseEngine, SecretReleaseStore,
};
use airlift_oci::{PullConfig, PushConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::actions::run_all;
use crate::error::{DeployError, Result};
use crate::pipeline::DeployOptions;

/// Everything a component run needs
pub struct ComponentContext<'a> {
    pub component: &'a Component,
    /// The component's extracted directory inside the deploy temp dir
    pub dir: PathBuf,
    pub variables: Arc<Mutex<VariableState>>,
    pub cluster: &'a Cluster,
    pub engine: &'a mut ReleaseEngine<SecretReleaseStore>,
    pub options: &'a DeployOptions,
    /// Bundle-level YOLO flag: skip registry and git pushes
    pub yolo: bool,
    /// Host architecture, for deploy-time pulls of thin bundles
    pub arch: String,
}

/// Execute one component start to finish.
pub async fn run_component(ctx: &mut ComponentContext<'_>) -> Result<DeployedComponent> {
    let name = ctx.component.name.clone();
    info!(component = %name, "deploying component");

    match run_steps(ctx).await {
        Ok(installed_charts) => {
            run_hooks(ctx, "onSuccess").await?;
            Ok(DeployedComponent {
                name,
                installed_charts,
            })
        }
        Err(e) => {
            // Failure hooks are best-effort; the original error wins.
            if let Err(hook_err) =
                run_hooks(ctx, "onFailure").await
            {
                warn!(component = %name, error = %hook_err, "onFailure actions failed");
            }
            Err(DeployError::ComponentFailed {
                component: name,
                step: step_of(&e),
                message: e.to_string(),
            })
        }
    }
}

async fn run_steps(ctx: &mut ComponentContext<'_>) -> Result<Vec<InstalledChart>> {
    run_hooks(ctx, "before").await?;
    place_files(ctx).await?;
    push_images(ctx).await?;
    push_repos(ctx).await?;
    run_injections(ctx).await?;

    let mut installed = Vec::new();
    installed.extend(deploy_charts(ctx).await?);
    installed.extend(deploy_manifests(ctx).await?);

    run_hooks(ctx, "after").await?;
    Ok(installed)
}

async fn run_hooks(ctx: &ComponentContext<'_>, position: &str) -> Result<()> {
    let actions = match position {
        "before" => &ctx.component.actions.before,
        "after" => &ctx.component.actions.after,
        "onSuccess" => &ctx.component.actions.on_success,
        _ => &ctx.component.actions.on_failure,
    };
    if actions.is_empty() {
        return Ok(());
    }
    debug!(component = %ctx.component.name, position, count = actions.len(), "running actions");
    run_all(actions, &ctx.dir, &ctx.variables).await
}

/// Place `files/` entries on the host, expanding variables in text payloads
/// and target paths.
async fn place_files(ctx: &ComponentContext<'_>) -> Result<()> {
    for placement in &ctx.component.files {
        let source = ctx.dir.join("files").join(&placement.source);
        let target = {
            let vars = ctx.variables.lock().await;
            PathBuf::from(vars.expand(&placement.target, &placement.target)?)
        };

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &target).map_err(|e| DeployError::ComponentFailed {
            component: ctx.component.name.clone(),
            step: "files".to_string(),
            message: format!("failed to place {}: {e}", placement.source),
        })?;

        {
            let vars = ctx.variables.lock().await;
            vars.expand_file(&target)?;
        }

        #[cfg(unix)]
        if placement.executable {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))?;
        }

        for link in &placement.symlinks {
            let link_path = PathBuf::from(link);
            if link_path.exists() {
                std::fs::remove_file(&link_path)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &link_path)?;
            #[cfg(windows)]
            std::os::windows::fs::symlink_file(&target, &link_path)?;
        }
        debug!(target = %target.display(), "file placed");
    }
    Ok(())
}

/// Push the component's staged images; thin bundles without a staged layout
/// pull at deploy time first.
async fn push_images(ctx: &ComponentContext<'_>) -> Result<()> {
    if ctx.component.images.is_empty() || ctx.yolo {
        return Ok(());
    }

    let layout_dir = ctx.dir.join("images");
    if !layout_dir.join("index.json").exists() {
        info!(component = %ctx.component.name, "no staged image layout, pulling at deploy time");
        let mut pull = PullConfig::new(
            ctx.component.images.clone(),
            layout_dir.clone(),
            &ctx.arch,
        );
        pull.cache_dir = ctx.options.cache_dir.clone();
        pull.plain_http = ctx.options.plain_http;
        pull.insecure_skip_tls = ctx.options.insecure_skip_tls;
        airlift_oci::pull(pull).await?;
    }

    let mut push = PushConfig::new(&ctx.options.registry_address);
    push.insecure_skip_tls = ctx.options.insecure_skip_tls;
    push.retries = ctx.options.retries;
    let pushed = airlift_oci::push(&layout_dir, &push).await?;
    info!(component = %ctx.component.name, count = pushed.len(), "images pushed");
    Ok(())
}

async fn push_repos(ctx: &ComponentContext<'_>) -> Result<()> {
    if ctx.component.repos.is_empty() || ctx.yolo {
        return Ok(());
    }
    let staging = ctx.dir.join("repos");
    let git = GitServerConfig {
        address: ctx.options.git_address.clone(),
        username: ctx.options.git_username.clone(),
        password: ctx.options.git_password.clone(),
        retries: ctx.options.retries,
    };
    airlift_git::mirror_repos(&ctx.component.repos, &staging, &git).await?;
    Ok(())
}

async fn run_injections(ctx: &ComponentContext<'_>) -> Result<()> {
    for injection in &ctx.component.data_injections {
        airlift_kube::inject(ctx.cluster.client(), injection, &ctx.dir).await?;
    }
    Ok(())
}

/// Deploy bundled charts in declaration order.
async fn deploy_charts(ctx: &mut ComponentContext<'_>) -> Result<Vec<InstalledChart>> {
    let mut installed = Vec::new();
    for bundle_chart in &ctx.component.charts {
        let chart_dir = ctx.dir.join("charts").join(&bundle_chart.name);
        let manifest = collect_manifests(&chart_dir, &ctx.variables).await?;

        let chart = Chart {
            name: bundle_chart.name.clone(),
            release_name: bundle_chart.release_name().to_string(),
            namespace: bundle_chart.namespace.clone(),
            version: bundle_chart.version.clone(),
            manifest,
            no_wait: bundle_chart.no_wait || ctx.options.no_wait,
            timeout_secs: ctx.options.timeout_secs,
            retries: ctx.options.retries,
        };

        ctx.cluster.ensure_namespace(&chart.namespace).await?;
        let release = ctx.engine.deploy(&chart).await?;
        installed.push(InstalledChart {
            namespace: release.record.namespace.clone(),
            release_name: release.record.name.clone(),
        });
    }
    Ok(installed)
}

/// Materialize each manifest set into a synthetic chart and deploy it.
async fn deploy_manifests(ctx: &mut ComponentContext<'_>) -> Result<Vec<InstalledChart>> {
    let mut installed = Vec::new();
    for set in &ctx.component.manifests {
        let mut docs = Vec::new();
        for file in &set.files {
            let path = ctx.dir.join("manifests").join(file);
            let content = std::fs::read_to_string(&path)?;
            let vars = ctx.variables.lock().await;
            docs.push(vars.expand(&content, &path.display().to_string())?);
        }

        let namespace = set.namespace.clone().unwrap_or_else(|| "default".to_string());
        let chart = Chart::synthetic(
            &set.name,
            &namespace,
            docs.join("\n---\n"),
            set.no_wait || ctx.options.no_wait,
        );
        let chart = Chart {
            timeout_secs: ctx.options.timeout_secs,
            retries: ctx.options.retries,
            ..chart
        };

        ctx.cluster.ensure_namespace(&namespace).await?;
        let release = ctx.engine.deploy(&chart).await?;
        installed.push(InstalledChart {
            namespace: release.record.namespace.clone(),
            release_name: release.record.name.clone(),
        });
    }
    Ok(installed)
}

/// Read every YAML document under a chart directory, deterministically.
async fn collect_manifests(
    chart_dir: &Path,
    variables: &Arc<Mutex<VariableState>>,
) -> Result<String> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(chart_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut docs = Vec::with_capacity(paths.len());
    let vars = variables.lock().await;
    for path in paths {
        let content = std::fs::read_to_string(&path)?;
        docs.push(vars.expand(&content, &path.display().to_string())?);
    }
    Ok(docs.join("\n---\n"))
}

/// Name the pipeline step an error belongs to, for the component failure
/// message.
fn step_of(error: &DeployError) -> String {
    match error {
        DeployError::ActionFailed { .. } | DeployError::ActionTimeout { .. } => "actions",
        DeployError::Oci(_) => "images",
        DeployError::Git(_) => "repos",
        DeployError::Kube(airlift_kube::KubeError::Injection { .. }) => "dataInjections",
        DeployError::Kube(_) => "charts",
        _ => "files",
    }
    .to_string()
}
