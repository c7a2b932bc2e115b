//! Deploy command - realize a bundle into the target cluster

use console::style;
use miette::{IntoDiagnostic, Result};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::display;

/// Parsed deploy flags, one field per CLI flag.
pub struct DeployArgs {
    pub source: String,
    pub components: String,
    pub set: HashMap<String, String>,
    pub confirm: bool,
    pub key: Option<PathBuf>,
    pub shasum: Option<String>,
    pub insecure_skip_tls_verify: bool,
    pub plain_http: bool,
    pub timeout: u64,
    pub deploy_timeout: Option<u64>,
    pub retries: u32,
    pub no_wait: bool,
    pub architecture: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub registry: String,
}

pub async fn run(args: DeployArgs) -> Result<()> {
    display::step(&format!(
        "Deploying bundle {}",
        style(&args.source).cyan()
    ));

    if !display::confirmed("Deploy this bundle?", args.confirm).into_diagnostic()? {
        return Err(miette::miette!(
            "deploy not confirmed; pass --confirm for non-interactive runs"
        ));
    }

    let options = airlift_deploy::DeployOptions {
        components: args.components,
        set: args.set,
        key_path: args.key,
        shasum: args.shasum,
        plain_http: args.plain_http,
        insecure_skip_tls: args.insecure_skip_tls_verify,
        timeout_secs: args.timeout,
        deploy_timeout_secs: args.deploy_timeout,
        retries: args.retries,
        no_wait: args.no_wait,
        architecture: args.architecture,
        cache_dir: args.cache_dir,
        registry_address: args.registry,
        ..Default::default()
    };

    let result = airlift_deploy::deploy(&args.source, options)
        .await
        .into_diagnostic()?;

    display::success(&format!(
        "Deployed bundle {} ({} components)",
        style(&result.package.data.metadata.name).cyan(),
        style(result.package.deployed_components.len()).yellow()
    ));
    display::connect_table(&result.connect_table);
    Ok(())
}
