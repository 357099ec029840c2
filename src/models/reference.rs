use std::fmt;

use crate::error::{Error, Result};

/// A manifest reference: either a mutable tag or an immutable digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl Reference {
    pub fn parse(s: &str) -> Reference {
        if is_digest_shaped(s) {
            Reference::Digest(s.to_string())
        } else {
            Reference::Tag(s.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(t) => t,
            Reference::Digest(d) => d,
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self, Reference::Digest(_))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed image reference such as `nginx:latest`,
/// `registry.example.com/team/app:v2` or `app@sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub name: String,
    pub reference: Reference,
}

impl ImageReference {
    /// Splits `name[:tag|@digest]`. A missing tag defaults to `latest`.
    pub fn parse(s: &str) -> Result<ImageReference> {
        if s.is_empty() {
            return Err(Error::invalid("image reference is empty"));
        }

        if let Some((name, digest)) = s.split_once('@') {
            if name.is_empty() {
                return Err(Error::invalid("image reference has no name"));
            }
            validate_digest(digest)?;
            return Ok(ImageReference {
                name: name.to_string(),
                reference: Reference::Digest(digest.to_string()),
            });
        }

        // Only a colon after the last slash separates a tag; earlier colons
        // belong to a registry host:port.
        let slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        match s[slash..].rfind(':') {
            Some(rel) => {
                let idx = slash + rel;
                let (name, tag) = (&s[..idx], &s[idx + 1..]);
                if name.is_empty() || tag.is_empty() {
                    return Err(Error::invalid(format!("malformed image reference: {s}")));
                }
                Ok(ImageReference {
                    name: name.to_string(),
                    reference: Reference::Tag(tag.to_string()),
                })
            }
            None => Ok(ImageReference {
                name: s.to_string(),
                reference: Reference::Tag("latest".to_string()),
            }),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.reference {
            Reference::Tag(t) => Some(t),
            Reference::Digest(_) => None,
        }
    }

    /// Repository name with any registry host and `library/` default removed,
    /// used when matching pushed repositories against configured images.
    pub fn short_name(&self) -> &str {
        let mut name = self.name.as_str();
        if let Some((first, rest)) = name.split_once('/') {
            // A first segment with a dot, a colon or `localhost` is a host.
            if first.contains('.') || first.contains(':') || first == "localhost" {
                name = rest;
            }
        }
        name.strip_prefix("library/").unwrap_or(name)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(t) => write!(f, "{}:{}", self.name, t),
            Reference::Digest(d) => write!(f, "{}@{}", self.name, d),
        }
    }
}

/// Canonical form used for equality: host and `library/` prefixes stripped,
/// default tag applied. `nginx:latest`, `nginx` and
/// `docker.io/library/nginx:latest` all normalize to the same string.
pub fn normalize_image(s: &str) -> String {
    match ImageReference::parse(s) {
        Ok(parsed) => format!("{}:{}", parsed.short_name(), parsed.tag().unwrap_or("latest")),
        Err(_) => s.to_string(),
    }
}

pub fn images_equal(a: &str, b: &str) -> bool {
    normalize_image(a) == normalize_image(b)
}

/// Loose check used to keep digest-shaped tags out of tag listings.
pub fn is_digest_shaped(s: &str) -> bool {
    match s.split_once(':') {
        Some((algo, hex)) => {
            !algo.is_empty()
                && algo.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && hex.len() >= 32
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

/// Strict validation for digests used to address blobs: `sha256:` plus 64
/// lowercase hex characters.
pub fn validate_digest(digest: &str) -> Result<()> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| Error::invalid(format!("unsupported digest: {digest}")))?;
    if hex.len() != 64 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(Error::invalid(format!("malformed digest: {digest}")));
    }
    Ok(())
}
