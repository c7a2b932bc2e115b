//! Image reference handling
//!
//! Thin wrapper around `oci_distribution::Reference` adding the pieces the
//! deploy pipeline needs: registry-prefix overrides, tarball detection and
//! rewriting into the cluster registry namespace.

use oci_distribution::Reference;
use std::collections::HashMap;

use crate::error::{OciError, Result};

/// An image reference as listed by a component
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// The reference exactly as the bundle listed it
    pub original: String,
    /// The reference after registry-prefix overrides
    pub effective: String,
}

impl ImageRef {
    /// Parse a component image entry, applying the first matching
    /// registry-prefix override.
    pub fn new(original: &str, overrides: &HashMap<String, String>) -> Self {
        let mut effective = original.to_string();
        for (prefix, replacement) in overrides {
            if original.starts_with(prefix.as_str()) {
                effective = original.replacen(prefix.as_str(), replacement, 1);
                break;
            }
        }
        Self {
            original: original.to_string(),
            effective,
        }
    }

    /// True when the effective reference points at an image tarball on disk
    /// rather than a registry.
    pub fn is_tarball(&self) -> bool {
        self.effective.ends_with(".tar")
            || self.effective.ends_with(".tar.gz")
            || self.effective.ends_with(".tgz")
    }

    /// Parse the effective reference for registry operations.
    pub fn parsed(&self) -> Result<Reference> {
        Reference::try_from(self.effective.as_str()).map_err(|e| OciError::InvalidReference {
            reference: self.effective.clone(),
            message: e.to_string(),
        })
    }

    /// Whether the bundle pinned a digest (which forbids implicit platform
    /// selection).
    pub fn has_digest(&self) -> bool {
        self.parsed().map(|r| r.digest().is_some()).unwrap_or(false)
    }

    /// Rewrite this reference into the cluster registry namespace, keeping
    /// the repository path and tag so pushes stay deterministic and
    /// re-entrant.
    pub fn cluster_target(&self, cluster_registry: &str) -> Result<Reference> {
        let parsed = self.parsed()?;
        let repository = parsed.repository().to_string();
        let target = match (parsed.tag(), parsed.digest()) {
            (_, Some(digest)) => Reference::with_digest(
                cluster_registry.to_string(),
                repository,
                digest.to_string(),
            ),
            (Some(tag), None) => Reference::with_tag(
                cluster_registry.to_string(),
                repository,
                tag.to_string(),
            ),
            (None, None) => Reference::with_tag(
                cluster_registry.to_string(),
                repository,
                "latest".to_string(),
            ),
        };
        Ok(target)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_rewrites_prefix() {
        let overrides = HashMap::from([(
            "docker.io".to_string(),
            "mirror.internal:5000".to_string(),
        )]);
        let image = ImageRef::new("docker.io/library/nginx:1.25", &overrides);
        assert_eq!(image.effective, "mirror.internal:5000/library/nginx:1.25");
        assert_eq!(image.original, "docker.io/library/nginx:1.25");
    }

    #[test]
    fn tarball_detection() {
        let none = HashMap::new();
        assert!(ImageRef::new("images/nginx.tar", &none).is_tarball());
        assert!(ImageRef::new("images/nginx.tar.gz", &none).is_tarball());
        assert!(ImageRef::new("images/nginx.tgz", &none).is_tarball());
        assert!(!ImageRef::new("nginx:1.25", &none).is_tarball());
    }

    #[test]
    fn cluster_target_keeps_repository_and_tag() {
        let image = ImageRef::new("ghcr.io/acme/api:2.0", &HashMap::new());
        let target = image.cluster_target("127.0.0.1:31999").unwrap();
        assert_eq!(target.registry(), "127.0.0.1:31999");
        assert_eq!(target.repository(), "acme/api");
        assert_eq!(target.tag(), Some("2.0"));
    }

    #[test]
    fn digest_detection() {
        let none = HashMap::new();
        assert!(ImageRef::new(
            "alpine@sha256:0000000000000000000000000000000000000000000000000000000000000000",
            &none
        )
        .has_digest());
        assert!(!ImageRef::new("alpine:3.20", &none).has_digest());
    }
}
