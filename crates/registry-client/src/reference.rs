//! Image reference parsing
//!
//! Accepts the usual `host[:port]/path[:tag][@sha256:<hex>]` forms. References
//! without a registry host resolve to Docker Hub, and single-component Docker
//! Hub names gain the `library/` prefix.

use crate::error::RegistryError;
use std::fmt;

/// Registry name used for Docker Hub references
pub const DOCKER_HUB: &str = "docker.io";

/// Host serving the Docker Hub distribution API
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Hostnames that all mean Docker Hub
pub const DOCKER_HUB_ALIASES: [&str; 3] = [DOCKER_HUB, "index.docker.io", DOCKER_HUB_API_HOST];

const DEFAULT_TAG: &str = "latest";

/// A parsed image pullspec
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host, with port when present
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    /// Tag, if the pullspec named one
    pub tag: Option<String>,
    /// Digest (`sha256:<hex>`), if the pullspec named one
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a pullspec
    pub fn parse(pullspec: &str) -> Result<Self, RegistryError> {
        let pullspec = pullspec.trim();
        if pullspec.is_empty() {
            return Err(RegistryError::InvalidReference("empty image reference".to_string()));
        }

        let (name, digest) = match pullspec.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest)
                    .map_err(|e| RegistryError::InvalidReference(format!("{pullspec}: {e}")))?;
                (name, Some(digest.to_string()))
            }
            None => (pullspec, None),
        };

        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_ascii_lowercase(), rest)
            }
            _ => (DOCKER_HUB.to_string(), name),
        };
        let registry = if DOCKER_HUB_ALIASES.contains(&registry.as_str()) {
            DOCKER_HUB.to_string()
        } else {
            registry
        };

        let last_segment_start = remainder.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match remainder[last_segment_start..].rfind(':') {
            Some(i) => {
                let split = last_segment_start + i;
                (&remainder[..split], Some(remainder[split + 1..].to_string()))
            }
            None => (remainder, None),
        };

        if repository.is_empty() {
            return Err(RegistryError::InvalidReference(format!("{pullspec}: missing repository")));
        }
        if !repository
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/'))
            || repository.starts_with('/')
            || repository.ends_with('/')
            || repository.contains("//")
        {
            return Err(RegistryError::InvalidReference(format!(
                "{pullspec}: invalid repository name {repository:?}"
            )));
        }
        if let Some(tag) = &tag {
            if tag.is_empty()
                || tag.len() > 128
                || !tag.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            {
                return Err(RegistryError::InvalidReference(format!("{pullspec}: invalid tag {tag:?}")));
            }
        }

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Host to send distribution API requests to
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Manifest reference for API paths: the digest when known, otherwise the tag
    #[must_use]
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// The same repository pinned to `digest`
    #[must_use]
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// `registry/repository` without tag or digest
    #[must_use]
    pub fn repository_pullspec(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn validate_digest(digest: &str) -> Result<(), String> {
    let Some((algorithm, encoded)) = digest.split_once(':') else {
        return Err(format!("digest {digest:?} has no algorithm"));
    };
    match algorithm {
        "sha256" if encoded.len() == 64 && encoded.chars().all(|c| c.is_ascii_hexdigit()) => Ok(()),
        "sha512" if encoded.len() == 128 && encoded.chars().all(|c| c.is_ascii_hexdigit()) => Ok(()),
        _ => Err(format!("unsupported digest {digest:?}")),
    }
}
