use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::error::{Error, Result};
use crate::models::container::{Container, PortMapping, LABEL_DOMAIN, LABEL_MANAGED};
use crate::runtime::{ContainerRuntime, ContainerSpec};

const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
const PULL_DEADLINE: Duration = Duration::from_secs(300);

/// `ContainerRuntime` backed by a local Docker-compatible daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<DockerRuntime> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Unavailable(format!("container runtime: {e}")))?;
        Ok(DockerRuntime { docker })
    }
}

async fn deadline<F, T>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(map_err),
        Err(_) => Err(Error::Timeout("container runtime call".into())),
    }
}

fn map_err(err: bollard::errors::Error) -> Error {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => Error::AlreadyExists(message),
        other => Error::Unavailable(format!("container runtime: {other}")),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        deadline(DEFAULT_DEADLINE, self.docker.ping()).await?;
        Ok(())
    }

    async fn list_managed_containers(&self) -> Result<Vec<Container>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true")],
        );
        let summaries = deadline(
            DEFAULT_DEADLINE,
            self.docker.list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            })),
        )
        .await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            containers.push(self.inspect_container(&id).await?);
        }
        Ok(containers)
    }

    async fn inspect_container(&self, id: &str) -> Result<Container> {
        let details = deadline(
            DEFAULT_DEADLINE,
            self.docker
                .inspect_container(id, None::<InspectContainerOptions>),
        )
        .await?;

        let labels = details
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let image = details
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        let status = details
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| s.to_string())
            .unwrap_or_default();

        let networks = details.network_settings.as_ref().and_then(|n| n.networks.as_ref());
        let (network, ip_address) = networks
            .and_then(|map| {
                // Prefer a non-default network; that is the isolation network.
                map.iter()
                    .find(|(name, _)| *name != "bridge")
                    .or_else(|| map.iter().next())
            })
            .map(|(name, endpoint)| (Some(name.clone()), endpoint.ip_address.clone()))
            .unwrap_or((None, None));

        let mut ports = Vec::new();
        if let Some(port_map) = details.network_settings.as_ref().and_then(|n| n.ports.as_ref()) {
            for (key, bindings) in port_map {
                let Some(container_port) = key.split('/').next().and_then(|p| p.parse().ok()) else {
                    continue;
                };
                for binding in bindings.iter().flatten() {
                    let Some(host_port) = binding.host_port.as_deref().and_then(|p| p.parse().ok())
                    else {
                        continue;
                    };
                    ports.push(PortMapping {
                        container_port,
                        host_port,
                        host_ip: binding.host_ip.clone().unwrap_or_else(|| "0.0.0.0".into()),
                    });
                }
            }
        }
        ports.sort_by_key(|p| (p.container_port, p.host_port));

        Ok(Container {
            id: details.id.unwrap_or_else(|| id.to_string()),
            image,
            domain: labels.get(LABEL_DOMAIN).cloned().unwrap_or_default(),
            status,
            network,
            ip_address: ip_address.filter(|ip| !ip.is_empty()),
            ports,
            labels,
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let exposed_key = format!("{}/tcp", spec.container_port);
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(exposed_key.clone(), HashMap::new());

        let host_config = if spec.publish_port {
            let mut bindings = HashMap::new();
            bindings.insert(
                exposed_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    // Empty string lets the daemon pick an ephemeral port.
                    host_port: Some(String::new()),
                }]),
            );
            Some(HostConfig {
                port_bindings: Some(bindings),
                ..Default::default()
            })
        } else {
            None
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config,
            ..Default::default()
        };

        let created = deadline(
            DEFAULT_DEADLINE,
            self.docker.create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            ),
        )
        .await?;
        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        deadline(
            DEFAULT_DEADLINE,
            self.docker
                .start_container(id, None::<StartContainerOptions<String>>),
        )
        .await
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        deadline(
            grace + DEFAULT_DEADLINE,
            self.docker.stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            ),
        )
        .await
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        deadline(
            DEFAULT_DEADLINE,
            self.docker.remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            ),
        )
        .await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        match tokio::time::timeout(PULL_DEADLINE, stream.try_collect::<Vec<_>>()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(map_err(e)),
            Err(_) => Err(Error::Timeout(format!("pulling {image}"))),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match tokio::time::timeout(DEFAULT_DEADLINE, self.docker.inspect_image(image)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            })) => Ok(false),
            Ok(Err(e)) => Err(map_err(e)),
            Err(_) => Err(Error::Timeout("container runtime call".into())),
        }
    }

    async fn image_exposed_ports(&self, image: &str) -> Result<Vec<u16>> {
        let details = deadline(DEFAULT_DEADLINE, self.docker.inspect_image(image)).await?;
        let mut ports: Vec<u16> = details
            .config
            .and_then(|c| c.exposed_ports)
            .map(|exposed| {
                exposed
                    .keys()
                    .filter_map(|key| key.split('/').next().and_then(|p| p.parse().ok()))
                    .collect()
            })
            .unwrap_or_default();
        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }

    async fn image_env(&self, image: &str) -> Result<Vec<String>> {
        let details = deadline(DEFAULT_DEADLINE, self.docker.inspect_image(image)).await?;
        Ok(details.config.and_then(|c| c.env).unwrap_or_default())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        let result = deadline(
            DEFAULT_DEADLINE,
            self.docker.create_network(CreateNetworkOptions {
                name: name.to_string(),
                check_duplicate: true,
                ..Default::default()
            }),
        )
        .await;
        match result {
            Ok(_) | Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn connect_network(&self, network: &str, container_id: &str, alias: &str) -> Result<()> {
        deadline(
            DEFAULT_DEADLINE,
            self.docker.connect_network(
                network,
                ConnectNetworkOptions {
                    container: container_id.to_string(),
                    endpoint_config: EndpointSettings {
                        aliases: Some(vec![alias.to_string()]),
                        ..Default::default()
                    },
                },
            ),
        )
        .await
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        let networks = deadline(
            DEFAULT_DEADLINE,
            self.docker
                .list_networks(None::<ListNetworksOptions<String>>),
        )
        .await?;
        let mut names: Vec<String> = networks.into_iter().filter_map(|n| n.name).collect();
        names.sort();
        Ok(names)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        deadline(DEFAULT_DEADLINE, self.docker.remove_network(name)).await
    }

    async fn container_logs(
        &self,
        id: &str,
        tail: Option<usize>,
        follow: bool,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };
        let stream: std::pin::Pin<
            Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>,
        > = Box::pin(
            self.docker
                .logs(id, Some(options))
                .map_err(|e| std::io::Error::other(map_err(e)))
                .map_ok(reframe),
        );
        Ok(Box::new(StreamReader::new(stream)))
    }
}

/// Restores the daemon's stream framing that the client library strips.
fn reframe(output: LogOutput) -> Bytes {
    let (stream_type, message): (u8, Bytes) = match output {
        LogOutput::StdIn { message } => (0, message),
        LogOutput::StdOut { message } => (1, message),
        LogOutput::StdErr { message } => (2, message),
        LogOutput::Console { message } => (1, message),
    };
    let mut framed = BytesMut::with_capacity(8 + message.len());
    framed.put_u8(stream_type);
    framed.put_bytes(0, 3);
    framed.put_u32(message.len() as u32);
    framed.extend_from_slice(&message);
    framed.freeze()
}
