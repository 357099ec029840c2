use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Labels stamped on every container this process manages.
pub const LABEL_MANAGED: &str = "gordon.managed";
pub const LABEL_DOMAIN: &str = "gordon.domain";
pub const LABEL_PROXY_PORT: &str = "gordon.proxy.port";
pub const LABEL_ATTACHMENT: &str = "gordon.attachment";

/// A live container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub image: String,
    pub domain: String,
    pub status: String,
    pub network: Option<String>,
    pub ip_address: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub host_ip: String,
}

impl Container {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_attachment(&self) -> bool {
        self.labels.contains_key(LABEL_ATTACHMENT)
    }

    /// Container port the proxy should address, from the stamped label.
    pub fn proxy_port(&self) -> Option<u16> {
        self.labels.get(LABEL_PROXY_PORT)?.parse().ok()
    }

    /// Host port mapped to the given container port, if published.
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.container_port == container_port)
            .map(|p| p.host_port)
    }
}
