//! Image references.
//!
//! Parses the familiar `name[:tag][@digest]` form the Docker CLI accepts and
//! normalizes it: a missing registry means Docker Hub, single-component
//! Docker Hub names live under `library/`, and a missing tag means `latest`.

use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::{Error, Result};

/// Registry host used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// API host serving Docker Hub's registry endpoints.
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Tag used when a reference names neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// The tag or digest part of a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// Mutable tag, resolved to a digest by the registry.
    Tag(String),
    /// Content digest of a manifest or index.
    Digest(Digest),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => f.write_str(tag),
            Self::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// A normalized image reference.
///
/// # Examples
///
/// ```
/// use imgpull_core::ImageReference;
///
/// let reference: ImageReference = "alpine:3.18".parse().unwrap();
/// assert_eq!(reference.registry(), "docker.io");
/// assert_eq!(reference.repository(), "library/alpine");
/// assert_eq!(reference.tag(), Some("3.18"));
/// assert_eq!(reference.repo_tag().as_deref(), Some("alpine:3.18"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    reference: Reference,
}

impl ImageReference {
    /// Parses a reference string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReference`] if the name, tag or digest is malformed.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            reference: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (name_and_tag, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => {
                let digest: Digest = digest.parse().map_err(|e: Error| invalid(&e.to_string()))?;
                (name, Some(digest))
            }
            None => (trimmed, None),
        };

        // A ':' after the last '/' separates the tag; an earlier one is a registry port.
        let last_slash = name_and_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name_and_tag[..split], Some(&name_and_tag[split + 1..]))
            }
            None => (name_and_tag, None),
        };

        let (registry, remainder) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest)
            }
            _ => (DEFAULT_REGISTRY.to_string(), name),
        };
        let registry = if registry == "index.docker.io" {
            DEFAULT_REGISTRY.to_string()
        } else {
            registry
        };

        if remainder.is_empty() {
            return Err(invalid("repository name is empty"));
        }
        for component in remainder.split('/') {
            validate_component(component).map_err(|reason| invalid(reason))?;
        }

        let repository = if registry == DEFAULT_REGISTRY && !remainder.contains('/') {
            format!("library/{remainder}")
        } else {
            remainder.to_string()
        };

        let reference = match (digest, tag) {
            (Some(digest), _) => Reference::Digest(digest),
            (None, Some(tag)) => {
                validate_tag(tag).map_err(|reason| invalid(reason))?;
                Reference::Tag(tag.to_string())
            }
            (None, None) => Reference::Tag(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Registry host as written in the reference (`docker.io` for Docker Hub).
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path, including `library/` for official Docker Hub images.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag or digest.
    #[must_use]
    pub const fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Tag, if the reference is by tag.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match &self.reference {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }

    /// Digest, if the reference is by digest.
    #[must_use]
    pub const fn digest(&self) -> Option<&Digest> {
        match &self.reference {
            Reference::Tag(_) => None,
            Reference::Digest(digest) => Some(digest),
        }
    }

    /// Host serving the registry API for this reference.
    #[must_use]
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Short name as the Docker CLI displays it: `alpine`, `user/app`, or
    /// `registry.example.com/team/app`.
    #[must_use]
    pub fn familiar_name(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .filter(|rest| !rest.contains('/'))
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }

    /// `name:tag` entry for the archive's repository tags, if tagged.
    #[must_use]
    pub fn repo_tag(&self) -> Option<String> {
        self.tag().map(|tag| format!("{}:{tag}", self.familiar_name()))
    }

    /// File name used when no output path is given, e.g. `alpine_3.18.tar`.
    #[must_use]
    pub fn default_archive_name(&self) -> String {
        let name = self.familiar_name().replace(['/', ':'], "_");
        match &self.reference {
            Reference::Tag(tag) => format!("{name}_{tag}.tar"),
            Reference::Digest(digest) => format!("{name}_{}.tar", digest.short(12)),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{tag}", self.registry, self.repository),
            Reference::Digest(digest) => {
                write!(f, "{}/{}@{digest}", self.registry, self.repository)
            }
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn validate_component(component: &str) -> std::result::Result<(), &'static str> {
    if component.is_empty() {
        return Err("repository path has an empty component");
    }
    if !component
        .bytes()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-'))
    {
        return Err("repository must be lowercase alphanumerics and separators");
    }
    let first = component.as_bytes()[0];
    let last = component.as_bytes()[component.len() - 1];
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        return Err("repository components must start and end with an alphanumeric");
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), &'static str> {
    if tag.is_empty() || tag.len() > 128 {
        return Err("tag must be 1 to 128 characters");
    }
    let first = tag.as_bytes()[0];
    if !(first.is_ascii_alphanumeric() || first == b'_') {
        return Err("tag must start with an alphanumeric or underscore");
    }
    if !tag
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
    {
        return Err("tag contains invalid characters");
    }
    Ok(())
}
