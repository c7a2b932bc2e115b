//! Airlift CLI - deploy sealed bundles into disconnected clusters

use clap::{Parser, Subcommand};
use miette::Result;
use std::collections::HashMap;
use std::path::PathBuf;

mod commands;
mod display;

#[derive(Parser)]
#[command(name = "airlift")]
#[command(version)]
#[command(about = "Air-gap deployment engine for self-contained application bundles", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a bundle into the target cluster
    Deploy {
        /// Bundle source: archive path, `.part000` header, or oci:// reference
        source: String,

        /// Components and groups to deploy (comma separated)
        #[arg(long, default_value = "")]
        components: String,

        /// Set a bundle variable (KEY=VALUE, repeatable)
        #[arg(long = "set")]
        set: Vec<String>,

        /// Skip the confirmation prompt
        #[arg(long)]
        confirm: bool,

        /// Public key file for signed bundles
        #[arg(long)]
        key: Option<PathBuf>,

        /// Expected bundle shasum
        #[arg(long)]
        shasum: Option<String>,

        /// Skip TLS certificate verification
        #[arg(long = "insecure-skip-tls-verify")]
        insecure_skip_tls_verify: bool,

        /// Talk plain HTTP to registries
        #[arg(long = "plain-http")]
        plain_http: bool,

        /// Per-chart timeout in seconds
        #[arg(long, default_value_t = 900)]
        timeout: u64,

        /// Whole-deploy budget in seconds
        #[arg(long = "deploy-timeout")]
        deploy_timeout: Option<u64>,

        /// Install, upgrade and push retries
        #[arg(long, default_value_t = 3)]
        retries: u32,

        /// Skip readiness waits on every chart
        #[arg(long = "no-wait")]
        no_wait: bool,

        /// Cross-deploy architecture override
        #[arg(long)]
        architecture: Option<String>,

        /// Image layer cache directory
        #[arg(long = "cache-dir")]
        cache_dir: Option<PathBuf>,

        /// Cluster registry address
        #[arg(long, default_value = "127.0.0.1:31999")]
        registry: String,
    },

    /// Show a bundle's descriptor without deploying it
    Inspect {
        /// Bundle source: archive path or oci:// reference
        source: String,

        /// Public key file for signed bundles
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Remove a previously deployed bundle
    Remove {
        /// Bundle name as recorded in the cluster
        name: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match cli.command {
        Commands::Deploy {
            source,
            components,
            set,
            confirm,
            key,
            shasum,
            insecure_skip_tls_verify,
            plain_http,
            timeout,
            deploy_timeout,
            retries,
            no_wait,
            architecture,
            cache_dir,
            registry,
        } => {
            commands::deploy::run(commands::deploy::DeployArgs {
                source,
                components,
                set: parse_set(&set)?,
                confirm,
                key,
                shasum,
                insecure_skip_tls_verify,
                plain_http,
                timeout,
                deploy_timeout,
                retries,
                no_wait,
                architecture,
                cache_dir,
                registry,
            })
            .await
        }

        Commands::Inspect { source, key } => commands::inspect::run(&source, key.as_deref()).await,

        Commands::Remove { name, confirm } => commands::remove::run(&name, confirm).await,
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse repeated `--set KEY=VALUE` flags.
fn parse_set(values: &[String]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for entry in values {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(miette::miette!("--set expects KEY=VALUE, got '{entry}'"));
        };
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}
