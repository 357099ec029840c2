use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigService;
use crate::containers::ContainerService;
use crate::error::{Error, Result};
use crate::proxy::ProxyService;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHealth {
    pub domain: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Periodic per-route probing: the container must be running and the
/// resolved target must answer an HTTP GET. Certificate validation is off;
/// the probes stay inside the deployment.
pub struct HealthService {
    config: Arc<ConfigService>,
    containers: Arc<ContainerService>,
    proxy: Arc<ProxyService>,
    client: reqwest::Client,
    last: RwLock<Vec<DomainHealth>>,
}

impl HealthService {
    pub fn new(
        config: Arc<ConfigService>,
        containers: Arc<ContainerService>,
        proxy: Arc<ProxyService>,
    ) -> Result<Arc<HealthService>> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::internal(format!("health client: {e}")))?;
        Ok(Arc::new(HealthService {
            config,
            containers,
            proxy,
            client,
            last: RwLock::new(Vec::new()),
        }))
    }

    pub async fn check_all(&self) -> Vec<DomainHealth> {
        let mut results = Vec::new();
        for route in self.config.get_routes().await {
            results.push(self.check_domain(&route.domain).await);
        }
        results
    }

    async fn check_domain(&self, domain: &str) -> DomainHealth {
        let unhealthy = |error: String| DomainHealth {
            domain: domain.to_string(),
            healthy: false,
            response_time_ms: 0,
            error: Some(error),
        };

        match self.containers.get(domain).await {
            Some(container) if container.is_running() => {}
            Some(_) => return unhealthy("container is not running".into()),
            None => return unhealthy("no container".into()),
        }

        let target = match self.proxy.get_target(domain).await {
            Ok(target) => target,
            Err(e) => return unhealthy(e.to_string()),
        };

        let url = format!("{}://{}:{}/", target.scheme, target.host, target.port);
        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(_) => DomainHealth {
                domain: domain.to_string(),
                healthy: true,
                response_time_ms: started.elapsed().as_millis() as u64,
                error: None,
            },
            Err(e) => unhealthy(e.to_string()),
        }
    }

    pub async fn last_results(&self) -> Vec<DomainHealth> {
        self.last.read().await.clone()
    }

    /// Probe loop; refreshes `last_results` every `interval` until
    /// cancelled.
    pub async fn run(self: Arc<HealthService>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let results = self.check_all().await;
            for result in &results {
                if !result.healthy {
                    tracing::debug!(
                        domain = result.domain,
                        error = result.error.as_deref().unwrap_or(""),
                        "probe failed"
                    );
                }
            }
            *self.last.write().await = results;
        }
    }
}
