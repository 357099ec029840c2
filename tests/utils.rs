#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use gordon::config::{ConfigService, Settings};
use gordon::containers::{ContainerService, EnvLoader};
use gordon::error::{Error, Result};
use gordon::events::EventBus;
use gordon::logs::LogService;
use gordon::models::container::{Container, PortMapping, LABEL_DOMAIN, LABEL_MANAGED};
use gordon::models::Route;
use gordon::runtime::{ContainerRuntime, ContainerSpec};
use gordon::secrets::{EnvProvider, SecretResolver};

pub fn route(domain: &str, image: &str) -> Route {
    Route {
        domain: domain.to_string(),
        image: image.to_string(),
        https: false,
        port: None,
    }
}

pub fn test_settings() -> Settings {
    Settings::default()
}

pub fn config_service(
    dir: &tempfile::TempDir,
    settings: Settings,
    events: Arc<EventBus>,
) -> Arc<ConfigService> {
    Arc::new(ConfigService::new(
        dir.path().join("gordon.toml"),
        settings,
        events,
    ))
}

/// A full controller stack over the mock runtime, rooted in a temp dir.
pub struct TestStack {
    pub dir: tempfile::TempDir,
    pub events: Arc<EventBus>,
    pub config: Arc<ConfigService>,
    pub runtime: Arc<MockRuntime>,
    pub env: Arc<EnvLoader>,
    pub containers: Arc<ContainerService>,
}

pub fn stack(settings: Settings) -> TestStack {
    let dir = tempfile::tempdir().expect("temp dir");
    let events = Arc::new(EventBus::new());
    let config = config_service(&dir, settings, Arc::clone(&events));
    let runtime = MockRuntime::new();

    let mut resolver = SecretResolver::new();
    resolver.register(Arc::new(EnvProvider));
    let env = Arc::new(EnvLoader::new(dir.path(), Arc::new(resolver)).expect("env loader"));

    let runtime_dyn: Arc<dyn ContainerRuntime> = runtime.clone();
    let logs = Arc::new(LogService::new(None, Arc::clone(&runtime_dyn)));
    let containers = ContainerService::new(
        runtime_dyn,
        Arc::clone(&config),
        Arc::clone(&env),
        logs,
        Arc::clone(&events),
        dir.path().to_path_buf(),
        false,
    )
    .expect("container service");

    TestStack {
        dir,
        events,
        config,
        runtime,
        env,
        containers,
    }
}

/// In-memory `ContainerRuntime` with scriptable images and failures.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, Container>,
    networks: HashSet<String>,
    images: HashSet<String>,
    image_ports: HashMap<String, Vec<u16>>,
    image_env: HashMap<String, Vec<String>>,
    pull_failures: HashSet<String>,
    pulls: Vec<String>,
    logs: HashMap<String, Vec<u8>>,
    next_id: u64,
}

impl MockRuntime {
    pub fn new() -> Arc<MockRuntime> {
        Arc::new(MockRuntime::default())
    }

    pub fn add_image(&self, image: &str, ports: &[u16], env: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.images.insert(image.to_string());
        state.image_ports.insert(image.to_string(), ports.to_vec());
        state.image_env.insert(
            image.to_string(),
            env.iter().map(|e| e.to_string()).collect(),
        );
    }

    pub fn fail_pulls_for(&self, image: &str) {
        self.state
            .lock()
            .unwrap()
            .pull_failures
            .insert(image.to_string());
    }

    pub fn pull_count(&self, image: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pulls
            .iter()
            .filter(|p| p.as_str() == image)
            .count()
    }

    pub fn set_container_logs(&self, id: &str, framed: Vec<u8>) {
        self.state.lock().unwrap().logs.insert(id.to_string(), framed);
    }

    pub fn containers(&self) -> Vec<Container> {
        self.state.lock().unwrap().containers.values().cloned().collect()
    }

    pub fn running_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.is_running() && !c.domain.is_empty())
            .map(|c| c.domain.clone())
            .collect();
        domains.sort();
        domains
    }

    pub fn networks(&self) -> Vec<String> {
        let mut networks: Vec<String> =
            self.state.lock().unwrap().networks.iter().cloned().collect();
        networks.sort();
        networks
    }

    /// Plants a pre-existing managed container, as if left over from a
    /// previous process.
    pub fn seed_container(&self, domain: &str, image: &str, running: bool) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("seeded-{}", state.next_id);
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_DOMAIN.to_string(), domain.to_string());
        state.containers.insert(
            id.clone(),
            Container {
                id: id.clone(),
                image: image.to_string(),
                domain: domain.to_string(),
                status: if running { "running" } else { "exited" }.to_string(),
                network: None,
                ip_address: Some("172.18.0.9".to_string()),
                ports: vec![PortMapping {
                    container_port: 80,
                    host_port: 39999,
                    host_ip: "127.0.0.1".to_string(),
                }],
                labels,
            },
        );
        id
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn list_managed_containers(&self) -> Result<Vec<Container>> {
        Ok(self.containers())
    }

    async fn inspect_container(&self, id: &str) -> Result<Container> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container {id}")))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains(&spec.image) {
            return Err(Error::NotFound(format!("image {}", spec.image)));
        }
        state.next_id += 1;
        let id = format!("mock-{}", state.next_id);
        let ordinal = state.next_id;

        let ports = if spec.publish_port {
            vec![PortMapping {
                container_port: spec.container_port,
                host_port: 30000 + ordinal as u16,
                host_ip: "127.0.0.1".to_string(),
            }]
        } else {
            Vec::new()
        };

        let container = Container {
            id: id.clone(),
            image: spec.image.clone(),
            domain: spec
                .labels
                .get(LABEL_DOMAIN)
                .cloned()
                .unwrap_or_default(),
            status: "created".to_string(),
            network: spec.network.clone(),
            ip_address: Some(format!("172.18.0.{}", 10 + ordinal % 200)),
            ports,
            labels: spec.labels.clone(),
        };
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
        container.status = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("container {id}")))?;
        container.status = "exited".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("container {id}")))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pulls.push(image.to_string());
        if state.pull_failures.contains(image) {
            return Err(Error::Unavailable(format!("pull {image} failed")));
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().images.contains(image))
    }

    async fn image_exposed_ports(&self, image: &str) -> Result<Vec<u16>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .image_ports
            .get(image)
            .cloned()
            .unwrap_or_default())
    }

    async fn image_env(&self, image: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .image_env
            .get(image)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().networks.insert(name.to_string());
        Ok(())
    }

    async fn connect_network(&self, network: &str, container_id: &str, _alias: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.networks.contains(network) {
            return Err(Error::NotFound(format!("network {network}")));
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::NotFound(format!("container {container_id}")))?;
        container.network = Some(network.to_string());
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        Ok(self.networks())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().networks.remove(name);
        Ok(())
    }

    async fn container_logs(
        &self,
        id: &str,
        _tail: Option<usize>,
        _follow: bool,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let framed = self
            .state
            .lock()
            .unwrap()
            .logs
            .get(id)
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(std::io::Cursor::new(framed)))
    }
}
