use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Attachment, ExternalRoute, Route};

/// The TOML configuration file, read at start and on reload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub auto_route: AutoRouteSettings,
    #[serde(default)]
    pub network_isolation: NetworkIsolationSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// `domain = "host:port"` pass-throughs for targets Gordon does not run.
    #[serde(default)]
    pub external_routes: BTreeMap<String, String>,
    /// `target = ["image", ...]`; target is a domain or a network group.
    #[serde(default)]
    pub attachments: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub registry_port: u16,
    pub grpc_port: u16,
    pub registry_domain: String,
    pub data_dir: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> ServerSettings {
        ServerSettings {
            port: 8080,
            registry_port: 5000,
            grpc_port: 9090,
            registry_domain: String::new(),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoRouteSettings {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkIsolationSettings {
    pub enabled: bool,
    pub prefix: String,
}

impl Default for NetworkIsolationSettings {
    fn default() -> NetworkIsolationSettings {
        NetworkIsolationSettings {
            enabled: false,
            prefix: "gordon".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub level: String,
    /// Megabytes before the log file is rotated.
    pub max_size: u64,
    pub max_backups: u32,
    /// Days a rotated file is kept.
    pub max_age: u32,
}

impl Default for LoggingSettings {
    fn default() -> LoggingSettings {
        LoggingSettings {
            enabled: false,
            dir: None,
            level: "info".to_string(),
            max_size: 100,
            max_backups: 3,
            max_age: 28,
        }
    }
}

impl Settings {
    /// Reads and validates the configuration file. A missing file yields the
    /// defaults; a file that fails to parse or validate is an error so the
    /// caller can keep its previous state.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let raw = match std::fs::read_to_string(path.as_ref()) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Settings::default());
            }
            Err(e) => return Err(e.into()),
        };
        let settings: Settings =
            toml::from_str(&raw).map_err(|e| Error::invalid(format!("configuration: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        for route in &self.routes {
            route.validate()?;
            if self.external_routes.contains_key(&route.domain) {
                return Err(Error::invalid(format!(
                    "{} is declared as both a route and an external route",
                    route.domain
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for route in &self.routes {
            if !seen.insert(&route.domain) {
                return Err(Error::RouteExists {
                    domain: route.domain.clone(),
                });
            }
        }
        for (domain, target) in &self.external_routes {
            ExternalRoute::parse(domain, target)?;
        }
        for (target, images) in &self.attachments {
            for image in images {
                Attachment {
                    target: target.clone(),
                    image: image.clone(),
                }
                .validate()?;
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::internal(format!("serialize configuration: {e}")))
    }

    pub fn external_routes(&self) -> Vec<ExternalRoute> {
        self.external_routes
            .iter()
            .filter_map(|(domain, target)| ExternalRoute::parse(domain, target).ok())
            .collect()
    }
}
