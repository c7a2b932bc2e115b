//! Mirror-push bundled repositories
//!
//! Each repository listed by a component exists in the extracted bundle as a
//! bare clone, directory-named by `target_repo_name`. Deploy pushes every
//! ref with `git push --mirror`, which is idempotent against the cluster git
//! server, and retries per repository before failing the component.

use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{GitError, Result};

/// The in-cluster git server deploy pushes into
#[derive(Debug, Clone)]
pub struct GitServerConfig {
    /// Base address, e.g. `http://airlift-gitserver.airlift.svc.cluster.local:3000`
    pub address: String,
    /// Push user
    pub username: String,
    /// Push password or token
    pub password: String,
    /// Attempts per repository
    pub retries: u32,
}

impl GitServerConfig {
    /// Target push URL for a mirrored repository, with credentials spliced
    /// into the authority the way git expects them.
    pub fn push_url(&self, repo_name: &str) -> Result<Url> {
        let mut url = Url::parse(&self.address).map_err(|e| GitError::InvalidUrl {
            url: self.address.clone(),
            message: e.to_string(),
        })?;
        url.set_username(&self.username)
            .map_err(|()| GitError::InvalidUrl {
                url: self.address.clone(),
                message: "address does not accept credentials".to_string(),
            })?;
        url.set_password(Some(&self.password))
            .map_err(|()| GitError::InvalidUrl {
                url: self.address.clone(),
                message: "address does not accept credentials".to_string(),
            })?;
        let path = format!(
            "{}/{}.git",
            url.path().trim_end_matches('/'),
            repo_name
        );
        url.set_path(&path);
        Ok(url)
    }
}

/// Deterministic in-cluster repository name for an origin URL.
///
/// The last path segment keeps the name recognizable; the digest suffix over
/// host+path keeps two `app.git`s from different origins apart.
pub fn target_repo_name(origin: &str) -> Result<String> {
    let parsed = Url::parse(origin).map_err(|e| GitError::InvalidUrl {
        url: origin.to_string(),
        message: e.to_string(),
    })?;
    let host = parsed.host_str().unwrap_or_default();
    let path = parsed.path().trim_matches('/').trim_end_matches(".git");
    if path.is_empty() {
        return Err(GitError::InvalidUrl {
            url: origin.to_string(),
            message: "no repository path".to_string(),
        });
    }

    let stem = path.rsplit('/').next().expect("non-empty path");
    let digest = hex::encode(Sha256::digest(format!("{host}/{path}")));
    Ok(format!("{stem}-{}", &digest[..10]))
}

/// Mirror every repository into the cluster git server.
///
/// `staging` is the extracted component's `repos/` directory. Repositories
/// are pushed sequentially; later components may depend on earlier pushes.
pub async fn mirror_repos(
    origins: &[String],
    staging: &Path,
    config: &GitServerConfig,
) -> Result<Vec<String>> {
    let mut mirrored = Vec::with_capacity(origins.len());
    for origin in origins {
        let name = target_repo_name(origin)?;
        let bundled = staging.join(&name);
        if !bundled.is_dir() {
            return Err(GitError::MissingBundledRepo {
                url: origin.clone(),
                path: bundled.display().to_string(),
            });
        }

        push_mirror(origin, &bundled, config).await?;
        info!(origin, target = %name, "repository mirrored");
        mirrored.push(name);
    }
    Ok(mirrored)
}

async fn push_mirror(origin: &str, bundled: &Path, config: &GitServerConfig) -> Result<()> {
    let name = target_repo_name(origin)?;
    let push_url = config.push_url(&name)?;
    let attempts = config.retries.max(1);

    let mut last = String::new();
    for attempt in 1..=attempts {
        debug!(origin, attempt, "pushing repository mirror");
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(bundled)
            .args(["push", "--mirror", push_url.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| GitError::CommandFailed {
                operation: "push".to_string(),
                url: origin.to_string(),
                stderr: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(());
        }
        last = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(origin, attempt, error = %last, "mirror push failed");
        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
        }
    }

    Err(GitError::PushExhausted {
        url: origin.to_string(),
        attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_names_are_deterministic_and_distinct() {
        let a = target_repo_name("https://github.com/acme/app.git").unwrap();
        let b = target_repo_name("https://github.com/acme/app.git").unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("app-"));

        let other_org = target_repo_name("https://github.com/other/app.git").unwrap();
        assert_ne!(a, other_org);

        let other_host = target_repo_name("https://gitlab.com/acme/app.git").unwrap();
        assert_ne!(a, other_host);
    }

    #[test]
    fn url_without_path_rejected() {
        assert!(target_repo_name("https://github.com/").is_err());
        assert!(target_repo_name("not a url").is_err());
    }

    #[test]
    fn push_url_carries_credentials() {
        let config = GitServerConfig {
            address: "http://gitserver.airlift.svc:3000".to_string(),
            username: "airlift-push".to_string(),
            password: "s3cret".to_string(),
            retries: 3,
        };
        let url = config.push_url("app-0123456789").unwrap();
        assert_eq!(url.username(), "airlift-push");
        assert_eq!(url.password(), Some("s3cret"));
        assert!(url.path().ends_with("app-0123456789.git"));
    }

    #[tokio::test]
    async fn missing_bundled_repo_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = GitServerConfig {
            address: "http://gitserver.airlift.svc:3000".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            retries: 1,
        };
        let err = mirror_repos(
            &["https://github.com/acme/app.git".to_string()],
            temp.path(),
            &config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GitError::MissingBundledRepo { .. }));
    }
}
