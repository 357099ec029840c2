pub mod env;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigService;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind, Subscriber};
use crate::logs::LogService;
use crate::models::container::{
    Container, LABEL_ATTACHMENT, LABEL_DOMAIN, LABEL_MANAGED, LABEL_PROXY_PORT,
};
use crate::models::reference::{images_equal, ImageReference};
use crate::models::Route;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::storage::paths::sanitize_name;

pub use env::EnvLoader;

const MAX_DEPLOY_FAILURES: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(10);

/// A route joined with its live container, as shown on the admin surface.
#[derive(Debug, Clone)]
pub struct RouteDetails {
    pub route: Route,
    pub container: Option<Container>,
    pub running: bool,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy)]
struct BackoffState {
    failures: u32,
    next_attempt: Instant,
}

impl BackoffState {
    fn degraded(&self) -> bool {
        self.failures >= MAX_DEPLOY_FAILURES
    }
}

/// The deployment controller: reconciles declared routes with live
/// containers through the runtime port.
///
/// The container map is the single source of truth for `domain ->
/// container`; entries are replaced wholesale, never mutated in place.
/// Deploys for one domain are serialized by a per-domain lock while
/// different domains proceed in parallel.
pub struct ContainerService {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<ConfigService>,
    env: Arc<EnvLoader>,
    logs: Arc<LogService>,
    events: Arc<EventBus>,
    containers: RwLock<HashMap<String, Container>>,
    domain_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    backoff: StdMutex<HashMap<String, BackoffState>>,
    captures: StdMutex<HashMap<String, CancellationToken>>,
    container_log_dir: PathBuf,
    in_container: bool,
}

impl ContainerService {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: Arc<ConfigService>,
        env: Arc<EnvLoader>,
        logs: Arc<LogService>,
        events: Arc<EventBus>,
        data_dir: PathBuf,
        in_container: bool,
    ) -> Result<Arc<ContainerService>> {
        let container_log_dir = data_dir.join("logs").join("containers");
        std::fs::create_dir_all(&container_log_dir)?;
        Ok(Arc::new(ContainerService {
            runtime,
            config,
            env,
            logs,
            events,
            containers: RwLock::new(HashMap::new()),
            domain_locks: Mutex::new(HashMap::new()),
            backoff: StdMutex::new(HashMap::new()),
            captures: StdMutex::new(HashMap::new()),
            container_log_dir,
            in_container,
        }))
    }

    /// True when the process itself runs inside a container, which selects
    /// container-network addressing for proxy targets.
    pub fn in_container(&self) -> bool {
        self.in_container
    }

    async fn domain_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        let mut locks = self.domain_locks.lock().await;
        locks.entry(domain.to_string()).or_default().clone()
    }

    /// Deploys a route: pull if needed, derive the port, prepare the
    /// isolated network and environment, replace any previous container,
    /// start, and record. A manual deploy also resets the failure backoff.
    pub async fn deploy(&self, route: &Route) -> Result<Container> {
        self.deploy_with(route, false).await
    }

    pub async fn deploy_with(&self, route: &Route, force_pull: bool) -> Result<Container> {
        route.validate()?;
        let lock = self.domain_lock(&route.domain).await;
        let _guard = lock.lock().await;

        match self.try_deploy(route, force_pull).await {
            Ok(container) => {
                self.backoff.lock().expect("backoff lock").remove(&route.domain);
                tracing::info!(
                    domain = route.domain,
                    image = route.image,
                    container_id = container.id,
                    "deployed"
                );
                Ok(container)
            }
            Err(e) => {
                if self.record_failure(&route.domain) {
                    self.events.publish(Event::RouteDegraded {
                        domain: route.domain.clone(),
                    });
                }
                Err(Error::DeployFailed {
                    domain: route.domain.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn try_deploy(&self, route: &Route, force_pull: bool) -> Result<Container> {
        let settings = self.config.settings().await;

        if force_pull || !self.runtime.image_exists(&route.image).await? {
            self.runtime.pull_image(&route.image).await?;
        }

        let container_port = match route.port {
            Some(port) => port,
            None => select_port(&self.runtime.image_exposed_ports(&route.image).await?),
        };

        let network = settings.network_isolation.enabled.then(|| {
            format!(
                "{}-{}",
                settings.network_isolation.prefix,
                sanitize_name(&route.domain)
            )
        });
        if let Some(network) = &network {
            self.runtime.create_network(network).await?;
        }

        let image_env = self.runtime.image_env(&route.image).await?;
        let env = self.env.resolved_env(&route.domain, &image_env).await?;

        self.remove_existing(&route.domain).await;

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_DOMAIN.to_string(), route.domain.clone());
        labels.insert(LABEL_PROXY_PORT.to_string(), container_port.to_string());

        let spec = ContainerSpec {
            name: format!("gordon-{}", sanitize_name(&route.domain)),
            image: route.image.clone(),
            env,
            labels,
            network: network.clone(),
            network_alias: Some(route.domain.clone()),
            container_port,
            publish_port: !self.in_container,
        };

        let id = self.runtime.create_container(&spec).await?;
        if let Some(network) = &network {
            self.runtime
                .connect_network(network, &id, &route.domain)
                .await?;
        }
        self.runtime.start_container(&id).await?;

        let container = self.runtime.inspect_container(&id).await?;
        self.containers
            .write()
            .await
            .insert(route.domain.clone(), container.clone());
        self.start_log_capture(&container);
        Ok(container)
    }

    /// Stops and removes whatever container currently serves the domain so
    /// the replacement is an atomic swap from the proxy's point of view.
    async fn remove_existing(&self, domain: &str) {
        let known = self.containers.read().await.get(domain).cloned();
        let existing = match known {
            Some(container) => Some(container),
            None => self
                .runtime
                .list_managed_containers()
                .await
                .ok()
                .and_then(|live| {
                    live.into_iter()
                        .find(|c| !c.is_attachment() && c.domain == domain)
                }),
        };

        if let Some(container) = existing {
            self.stop_capture(domain);
            if let Err(e) = self.runtime.stop_container(&container.id, STOP_GRACE).await {
                tracing::debug!(domain, container_id = container.id, error = %e, "stop before replace failed");
            }
            if let Err(e) = self.runtime.remove_container(&container.id, true).await {
                tracing::warn!(domain, container_id = container.id, error = %e, "remove before replace failed");
            }
            self.containers.write().await.remove(domain);
        }
    }

    pub async fn stop(&self, domain: &str) -> Result<()> {
        let container = self
            .get(domain)
            .await
            .ok_or_else(|| Error::NotFound(format!("container for {domain}")))?;
        self.runtime.stop_container(&container.id, STOP_GRACE).await?;
        if let Ok(refreshed) = self.runtime.inspect_container(&container.id).await {
            self.containers
                .write()
                .await
                .insert(domain.to_string(), refreshed);
        }
        Ok(())
    }

    pub async fn remove(&self, domain: &str) -> Result<()> {
        let container = self
            .get(domain)
            .await
            .ok_or_else(|| Error::NotFound(format!("container for {domain}")))?;
        self.stop_capture(domain);
        let _ = self.runtime.stop_container(&container.id, STOP_GRACE).await;
        self.runtime.remove_container(&container.id, true).await?;
        self.containers.write().await.remove(domain);
        tracing::info!(domain, container_id = container.id, "container removed");
        Ok(())
    }

    pub async fn get(&self, domain: &str) -> Option<Container> {
        self.containers.read().await.get(domain).cloned()
    }

    pub async fn list(&self) -> Vec<Container> {
        let mut containers: Vec<Container> =
            self.containers.read().await.values().cloned().collect();
        containers.sort_by(|a, b| a.domain.cmp(&b.domain));
        containers
    }

    pub async fn list_routes_with_details(&self) -> Vec<RouteDetails> {
        let routes = self.config.get_routes().await;
        let containers = self.containers.read().await;
        let backoff = self.backoff.lock().expect("backoff lock");
        routes
            .into_iter()
            .map(|route| {
                let container = containers.get(&route.domain).cloned();
                let running = container.as_ref().is_some_and(Container::is_running);
                let degraded = backoff
                    .get(&route.domain)
                    .is_some_and(BackoffState::degraded);
                RouteDetails {
                    route,
                    container,
                    running,
                    degraded,
                }
            })
            .collect()
    }

    pub async fn list_networks(&self) -> Result<Vec<String>> {
        self.runtime.list_networks().await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.runtime.ping().await
    }

    /// One reconciliation pass: adopt live state, deploy missing routes
    /// (subject to backoff), remove orphans, then settle attachments.
    pub async fn sync_containers(self: &Arc<Self>) -> Result<()> {
        let routes = self.config.get_routes().await;
        let live = self.runtime.list_managed_containers().await?;

        {
            let mut map = self.containers.write().await;
            map.clear();
            for container in &live {
                if !container.is_attachment() && !container.domain.is_empty() {
                    map.insert(container.domain.clone(), container.clone());
                }
            }
        }

        let mut deploys = Vec::new();
        for route in &routes {
            let satisfied = live.iter().any(|c| {
                !c.is_attachment()
                    && c.domain == route.domain
                    && images_equal(&c.image, &route.image)
                    && c.is_running()
            });
            if satisfied || !self.backoff_allows(&route.domain) {
                continue;
            }
            let service = Arc::clone(self);
            let route = route.clone();
            deploys.push(tokio::spawn(async move {
                if let Err(e) = service.deploy_with(&route, false).await {
                    tracing::warn!(domain = route.domain, error = %e, "reconcile deploy failed");
                }
            }));
        }
        for task in deploys {
            let _ = task.await;
        }

        for container in live.iter().filter(|c| !c.is_attachment()) {
            let declared = routes.iter().any(|r| r.domain == container.domain);
            if !declared {
                tracing::info!(
                    domain = container.domain,
                    container_id = container.id,
                    "removing container without a route"
                );
                self.stop_capture(&container.domain);
                let _ = self.runtime.stop_container(&container.id, STOP_GRACE).await;
                let _ = self.runtime.remove_container(&container.id, true).await;
                self.containers.write().await.remove(&container.domain);
            }
        }

        self.sync_attachments(&routes).await;
        Ok(())
    }

    /// Attachments are settled only after their owning domain is up; group
    /// targets (no matching route) are settled unconditionally.
    async fn sync_attachments(&self, routes: &[Route]) {
        let attachments = self.config.attachments().await;
        let live = match self.runtime.list_managed_containers().await {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!(error = %e, "skipping attachment reconcile");
                return;
            }
        };

        for (target, images) in attachments {
            let owner_route = routes.iter().find(|r| r.domain == target);
            if owner_route.is_some() {
                let owner_up = self
                    .get(&target)
                    .await
                    .is_some_and(|c| c.is_running());
                if !owner_up {
                    continue;
                }
            }
            for image in images {
                if let Err(e) = self.ensure_attachment(&target, &image, &live).await {
                    tracing::warn!(target, image, error = %e, "attachment deploy failed");
                }
            }
        }
    }

    async fn ensure_attachment(
        &self,
        target: &str,
        image: &str,
        live: &[Container],
    ) -> Result<()> {
        let exists = live.iter().any(|c| {
            c.labels.get(LABEL_ATTACHMENT).map(String::as_str) == Some(target)
                && images_equal(&c.image, image)
                && c.is_running()
        });
        if exists {
            return Ok(());
        }

        let settings = self.config.settings().await;
        if !self.runtime.image_exists(image).await? {
            self.runtime.pull_image(image).await?;
        }

        let parsed = ImageReference::parse(image)?;
        let alias = parsed
            .short_name()
            .rsplit('/')
            .next()
            .unwrap_or("attachment")
            .to_string();

        let network = settings.network_isolation.enabled.then(|| {
            format!(
                "{}-{}",
                settings.network_isolation.prefix,
                sanitize_name(target)
            )
        });
        if let Some(network) = &network {
            self.runtime.create_network(network).await?;
        }

        let scope = format!("{target}-{alias}");
        let image_env = self.runtime.image_env(image).await?;
        let env = self.env.resolved_env(&scope, &image_env).await?;

        let ports = self.runtime.image_exposed_ports(image).await?;
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_ATTACHMENT.to_string(), target.to_string());

        let spec = ContainerSpec {
            name: format!("gordon-att-{}-{}", sanitize_name(target), sanitize_name(&alias)),
            image: image.to_string(),
            env,
            labels,
            network: network.clone(),
            network_alias: Some(alias.clone()),
            container_port: select_port(&ports),
            publish_port: false,
        };

        let id = self.runtime.create_container(&spec).await?;
        if let Some(network) = &network {
            self.runtime.connect_network(network, &id, &alias).await?;
        }
        self.runtime.start_container(&id).await?;
        tracing::info!(target, image, container_id = id, "attachment deployed");
        Ok(())
    }

    /// Boot pass: start stopped managed containers that still have a route,
    /// then run a full reconciliation.
    pub async fn auto_start(self: &Arc<Self>) -> Result<()> {
        let routes = self.config.get_routes().await;
        let live = self.runtime.list_managed_containers().await?;
        for container in &live {
            let declared = container.is_attachment()
                || routes.iter().any(|r| r.domain == container.domain);
            if declared && !container.is_running() {
                if let Err(e) = self.runtime.start_container(&container.id).await {
                    tracing::warn!(container_id = container.id, error = %e, "auto-start failed");
                }
            }
        }
        self.sync_containers().await
    }

    /// Best-effort shutdown: stop every managed container with a grace
    /// period, then force-remove. Containers are left removed, networks are
    /// left in place.
    pub async fn shutdown(&self) {
        for (_, token) in self.captures.lock().expect("captures lock").drain() {
            token.cancel();
        }
        let live = match self.runtime.list_managed_containers().await {
            Ok(live) => live,
            Err(e) => {
                tracing::warn!(error = %e, "shutdown: could not list containers");
                return;
            }
        };
        for container in live {
            if let Err(e) = self.runtime.stop_container(&container.id, STOP_GRACE).await {
                tracing::debug!(container_id = container.id, error = %e, "shutdown stop failed");
            }
            if let Err(e) = self.runtime.remove_container(&container.id, true).await {
                tracing::warn!(container_id = container.id, error = %e, "shutdown remove failed");
            }
        }
        self.containers.write().await.clear();
    }

    /// Redeploys the route matching a pushed image, forcing a fresh pull.
    /// With auto-routing enabled, an unmatched push registers a new route
    /// under the registry domain first.
    pub async fn on_image_pushed(self: &Arc<Self>, name: &str, reference: &str) -> Result<Option<String>> {
        if let Some(route) = self.config.route_for_image(name, reference).await {
            self.deploy_with(&route, true).await?;
            return Ok(Some(route.domain));
        }

        let settings = self.config.settings().await;
        if !settings.auto_route.enabled || settings.server.registry_domain.is_empty() {
            return Ok(None);
        }
        if crate::models::reference::is_digest_shaped(reference) {
            return Ok(None);
        }

        let subdomain = name.rsplit('/').next().unwrap_or(name);
        let route = Route {
            domain: format!("{subdomain}.{}", settings.server.registry_domain),
            image: format!("{name}:{reference}"),
            https: false,
            port: None,
        };
        tracing::info!(domain = route.domain, image = route.image, "auto-registering route");
        self.config.add_route(route.clone()).await?;
        self.deploy_with(&route, true).await?;
        Ok(Some(route.domain))
    }

    fn start_log_capture(&self, container: &Container) {
        let token = CancellationToken::new();
        let previous = self
            .captures
            .lock()
            .expect("captures lock")
            .insert(container.domain.clone(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let path = self
            .container_log_dir
            .join(format!("{}.log", sanitize_name(&container.domain)));
        self.logs
            .capture_container_logs(container.id.clone(), path, token);
    }

    fn stop_capture(&self, domain: &str) {
        if let Some(token) = self.captures.lock().expect("captures lock").remove(domain) {
            token.cancel();
        }
    }

    fn backoff_allows(&self, domain: &str) -> bool {
        let backoff = self.backoff.lock().expect("backoff lock");
        match backoff.get(domain) {
            None => true,
            Some(state) => !state.degraded() && state.next_attempt <= Instant::now(),
        }
    }

    /// Records one deploy failure and returns true when the route just
    /// crossed the degradation threshold, so the caller can publish
    /// `RouteDegraded` exactly once per streak.
    fn record_failure(&self, domain: &str) -> bool {
        let mut backoff = self.backoff.lock().expect("backoff lock");
        let state = backoff.entry(domain.to_string()).or_insert(BackoffState {
            failures: 0,
            next_attempt: Instant::now(),
        });
        let was_degraded = state.degraded();
        state.failures += 1;
        let delay = Duration::from_secs(1 << (state.failures - 1).min(5)).min(BACKOFF_CAP);
        state.next_attempt = Instant::now() + delay;
        if state.degraded() {
            tracing::warn!(domain, failures = state.failures, "route degraded");
        } else {
            tracing::debug!(domain, failures = state.failures, retry_in = ?delay, "deploy backoff");
        }
        !was_degraded && state.degraded()
    }
}

/// Port choice from an image's exposed ports: a single exposed port wins,
/// 8080 is preferred among several, otherwise the lowest; 80 when the image
/// exposes nothing.
fn select_port(exposed: &[u16]) -> u16 {
    match exposed {
        [] => 80,
        [only] => *only,
        many if many.contains(&8080) => 8080,
        many => many[0],
    }
}

/// Event-bus subscriber that drives the controller. Handlers spawn so the
/// bus never blocks on a deploy.
pub struct ContainerEvents(pub Arc<ContainerService>);

impl Subscriber for ContainerEvents {
    fn name(&self) -> &str {
        "containers"
    }

    fn can_handle(&self, kind: EventKind) -> bool {
        matches!(
            kind,
            EventKind::ImagePushed
                | EventKind::ConfigReload
                | EventKind::ManualReload
                | EventKind::RouteAdded
                | EventKind::RouteRemoved
        )
    }

    fn handle(&self, event: &Event) {
        let service = Arc::clone(&self.0);
        match event {
            Event::ImagePushed {
                name, reference, ..
            } => {
                let (name, reference) = (name.clone(), reference.clone());
                tokio::spawn(async move {
                    if let Err(e) = service.on_image_pushed(&name, &reference).await {
                        tracing::warn!(name, reference, error = %e, "push-triggered deploy failed");
                    }
                });
            }
            Event::ConfigReload | Event::ManualReload => {
                tokio::spawn(async move {
                    if let Err(e) = service.sync_containers().await {
                        tracing::warn!(error = %e, "reconciliation failed");
                    }
                });
            }
            Event::RouteAdded { domain } => {
                let domain = domain.clone();
                tokio::spawn(async move {
                    match service.config.get_route(&domain).await {
                        Ok(route) => {
                            if let Err(e) = service.deploy(&route).await {
                                tracing::warn!(domain, error = %e, "deploy for new route failed");
                            }
                        }
                        Err(e) => tracing::debug!(domain, error = %e, "route vanished before deploy"),
                    }
                });
            }
            Event::RouteRemoved { domain } => {
                let domain = domain.clone();
                tokio::spawn(async move {
                    if let Err(e) = service.remove(&domain).await {
                        tracing::debug!(domain, error = %e, "cleanup after route removal failed");
                    }
                });
            }
            // The controller raises this event itself.
            Event::RouteDegraded { .. } => {}
        }
    }
}
