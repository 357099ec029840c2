pub mod docker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::models::Container;

pub use docker::DockerRuntime;

/// Everything needed to create one managed container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
    pub network_alias: Option<String>,
    pub container_port: u16,
    /// Publish the container port on a loopback host port. Used when the
    /// proxy runs on the host and cannot reach container networks directly.
    pub publish_port: bool,
}

/// Port over a Docker-compatible runtime. Calls carry a 30 second default
/// deadline unless an operation overrides it.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Containers carrying the managed label, including stopped ones.
    async fn list_managed_containers(&self) -> Result<Vec<Container>>;

    async fn inspect_container(&self, id: &str) -> Result<Container>;

    /// Creates the container and returns its ID. The container is not
    /// started and not yet connected to any extra network.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Ports the image declares via EXPOSE, ascending.
    async fn image_exposed_ports(&self, image: &str) -> Result<Vec<u16>>;

    /// `KEY=VALUE` pairs baked into the image via ENV.
    async fn image_env(&self, image: &str) -> Result<Vec<String>>;

    async fn create_network(&self, name: &str) -> Result<()>;

    async fn connect_network(&self, network: &str, container_id: &str, alias: &str) -> Result<()>;

    async fn list_networks(&self) -> Result<Vec<String>>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    /// The container's log stream in the daemon's multiplexed wire framing:
    /// an 8-byte `[stream, 0, 0, 0, len_be32]` header per frame. Demuxing is
    /// the log service's job.
    async fn container_logs(
        &self,
        id: &str,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;
}

/// True when this process itself runs inside a container, which flips the
/// proxy to container-network addressing.
pub fn running_in_container() -> bool {
    if std::path::Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|contents| contents.contains("docker") || contents.contains("containerd"))
        .unwrap_or(false)
}
