use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::reference::ImageReference;

/// A declared mapping from a public domain to a container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub domain: String,
    pub image: String,
    #[serde(default)]
    pub https: bool,
    /// Explicit container port; when absent the port is derived from the
    /// image's exposed ports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Route {
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::RouteDomainEmpty);
        }
        if self.image.is_empty() {
            return Err(Error::RouteImageEmpty);
        }
        if !valid_domain(&self.domain) {
            return Err(Error::invalid(format!("invalid domain: {}", self.domain)));
        }
        ImageReference::parse(&self.image)?;
        Ok(())
    }
}

/// A domain forwarded to an address outside the managed runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRoute {
    pub domain: String,
    pub host: String,
    pub port: u16,
}

impl ExternalRoute {
    /// Parses the `host:port` form used in the configuration file.
    pub fn parse(domain: &str, target: &str) -> Result<ExternalRoute> {
        if !valid_domain(domain) {
            return Err(Error::invalid(format!("invalid domain: {domain}")));
        }
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| Error::invalid(format!("external route target must be host:port, got {target}")))?;
        if host.is_empty() {
            return Err(Error::invalid("external route host is empty"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::invalid(format!("invalid external route port: {port}")))?;
        Ok(ExternalRoute {
            domain: domain.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

/// A sidecar container bound to a route's domain or to a network group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub target: String,
    pub image: String,
}

impl Attachment {
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(Error::AttachmentTargetEmpty);
        }
        if self.image.is_empty() {
            return Err(Error::AttachmentImageEmpty);
        }
        ImageReference::parse(&self.image)?;
        Ok(())
    }
}

/// DNS label rules: 1-63 character labels of lowercase alphanumerics and
/// hyphens, no leading or trailing hyphen, 253 characters total.
pub fn valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(domain: &str, image: &str) -> Route {
        Route {
            domain: domain.into(),
            image: image.into(),
            https: false,
            port: None,
        }
    }

    #[test]
    fn validates_domains() {
        assert!(valid_domain("app.example.com"));
        assert!(valid_domain("a-b.example"));
        assert!(!valid_domain(""));
        assert!(!valid_domain("-app.example.com"));
        assert!(!valid_domain("app..example.com"));
        assert!(!valid_domain("App.example.com"));
    }

    #[test]
    fn route_validation() {
        assert!(route("app.example.com", "myapp:latest").validate().is_ok());
        assert!(matches!(
            route("", "myapp:latest").validate(),
            Err(Error::RouteDomainEmpty)
        ));
        assert!(matches!(
            route("app.example.com", "").validate(),
            Err(Error::RouteImageEmpty)
        ));
    }

    #[test]
    fn external_route_parsing() {
        let r = ExternalRoute::parse("db.example.com", "10.0.0.5:5432").unwrap();
        assert_eq!((r.host.as_str(), r.port), ("10.0.0.5", 5432));
        assert!(ExternalRoute::parse("db.example.com", "10.0.0.5").is_err());
        assert!(ExternalRoute::parse("db.example.com", ":5432").is_err());
    }
}
