//! Image reference parsing and validation
//!
//! References have the form `<registry>/<repo>[:<tag>|@<digest>]`. The
//! registry host is mandatory so a reference always names exactly one remote
//! location; validation happens at every public entry point.

use crate::digest::Digest;
use crate::error::{Result, SarError};
use std::fmt;

/// A validated image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// Parse `<registry>/<repo>[:<tag>|@<digest>]`
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(SarError::InvalidRef("empty reference".to_string()));
        }
        let (registry, rest) = s
            .split_once('/')
            .ok_or_else(|| SarError::InvalidRef(format!("missing registry host: {}", s)))?;
        if !is_registry_host(registry) {
            return Err(SarError::InvalidRef(format!(
                "invalid registry host '{}' in {}",
                registry, s
            )));
        }

        let (repo_part, tag, digest) = if let Some((repo, dig)) = rest.split_once('@') {
            (repo, None, Some(Digest::parse(dig)?))
        } else if let Some((repo, tag)) = rest.rsplit_once(':') {
            if !is_valid_tag(tag) {
                return Err(SarError::InvalidRef(format!("invalid tag '{}' in {}", tag, s)));
            }
            (repo, Some(tag.to_string()), None)
        } else {
            (rest, None, None)
        };

        if !is_valid_repository(repo_part) {
            return Err(SarError::InvalidRef(format!(
                "invalid repository '{}' in {}",
                repo_part, s
            )));
        }

        Ok(Reference {
            registry: registry.to_string(),
            repository: repo_part.to_string(),
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Tag, digest, or `latest` when neither was given
    pub fn identifier(&self) -> String {
        if let Some(d) = &self.digest {
            d.to_string()
        } else {
            self.tag.clone().unwrap_or_else(|| "latest".to_string())
        }
    }

    /// Same repository, pinned to a digest (drops any tag)
    pub fn with_digest(&self, digest: Digest) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(d) = &self.digest {
            write!(f, "@{}", d)
        } else if let Some(t) = &self.tag {
            write!(f, ":{}", t)
        } else {
            Ok(())
        }
    }
}

impl std::str::FromStr for Reference {
    type Err = SarError;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

/// The host part must look like a host: `localhost`, or contain a dot or a
/// port, optionally `host:port`.
fn is_registry_host(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let (name, port) = match host.split_once(':') {
        Some((n, p)) => (n, Some(p)),
        None => (host, None),
    };
    if let Some(p) = port {
        if p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    let name_ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    name_ok && (name == "localhost" || name.contains('.') || port.is_some())
}

fn is_valid_repository(repo: &str) -> bool {
    if repo.is_empty() {
        return false;
    }
    repo.split('/').all(|component| {
        !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
            && !component.starts_with(['.', '-', '_'])
    })
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
        && !tag.starts_with(['.', '-'])
}
