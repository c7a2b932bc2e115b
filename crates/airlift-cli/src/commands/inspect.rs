//! Inspect command - print a bundle's descriptor without deploying

use miette::{IntoDiagnostic, Result};
use std::path::Path;
use tempfile::TempDir;

use airlift_deploy::{BundleSource, VerifyOptions};

pub async fn run(source: &str, key: Option<&Path>) -> Result<()> {
    let workdir = TempDir::with_prefix("airlift-inspect-").into_diagnostic()?;

    let public_key = match key {
        Some(path) => {
            let content = std::fs::read_to_string(path).into_diagnostic()?;
            Some(airlift_core::signing::load_public_key(&content).into_diagnostic()?)
        }
        None => None,
    };
    let verify = VerifyOptions {
        public_key,
        ..Default::default()
    };

    let source = BundleSource::parse(source).into_diagnostic()?;
    let loaded = airlift_deploy::source::load(&source, workdir.path(), &verify)
        .await
        .into_diagnostic()?;

    let descriptor = serde_yaml::to_string(&loaded.bundle).into_diagnostic()?;
    print!("{descriptor}");
    Ok(())
}
