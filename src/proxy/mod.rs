use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, Request, Response, StatusCode};
use axum::response::IntoResponse;
use serde_json::json;
use tokio::sync::RwLock;

use crate::config::ConfigService;
use crate::containers::ContainerService;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, Subscriber};

/// How many consecutive upstream failures evict a cached target so the next
/// request re-resolves.
const FAILURES_BEFORE_EVICT: u32 = 3;

/// Where a domain's traffic goes. `container_id` is empty for external
/// routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
    pub container_id: String,
    pub scheme: String,
}

/// Domain-to-target resolution with a cache invalidated by bus events, plus
/// the HTTP handler that forwards requests to the resolved target.
pub struct ProxyService {
    config: Arc<ConfigService>,
    containers: Arc<ContainerService>,
    cache: RwLock<HashMap<String, ProxyTarget>>,
    failures: StdMutex<HashMap<String, u32>>,
    client: reqwest::Client,
}

impl ProxyService {
    pub fn new(config: Arc<ConfigService>, containers: Arc<ContainerService>) -> Result<Arc<ProxyService>> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::internal(format!("proxy client: {e}")))?;
        Ok(Arc::new(ProxyService {
            config,
            containers,
            cache: RwLock::new(HashMap::new()),
            failures: StdMutex::new(HashMap::new()),
            client,
        }))
    }

    /// Resolves a domain to its target: cache, then external routes, then
    /// the container map. Successful resolutions are cached.
    pub async fn get_target(&self, domain: &str) -> Result<ProxyTarget> {
        let domain = domain.to_ascii_lowercase();
        if let Some(target) = self.cache.read().await.get(&domain) {
            return Ok(target.clone());
        }

        let target = self.resolve(&domain).await?;
        self.cache
            .write()
            .await
            .insert(domain.clone(), target.clone());
        tracing::debug!(domain, host = target.host, port = target.port, "target cached");
        Ok(target)
    }

    async fn resolve(&self, domain: &str) -> Result<ProxyTarget> {
        if let Some(external) = self.config.get_external_route(domain).await {
            return Ok(ProxyTarget {
                host: external.host,
                port: external.port,
                container_id: String::new(),
                scheme: "http".to_string(),
            });
        }

        let container = self
            .containers
            .get(domain)
            .await
            .ok_or_else(|| Error::RouteNotFound {
                domain: domain.to_string(),
            })?;
        if !container.is_running() {
            return Err(Error::Unavailable(format!("container for {domain} is not running")));
        }

        let container_port = container
            .proxy_port()
            .or_else(|| container.ports.first().map(|p| p.container_port))
            .unwrap_or(80);

        // Inside a container the target is the container network address;
        // on the host it is the loopback port mapping.
        let (host, port) = if self.containers.in_container() {
            let ip = container.ip_address.clone().ok_or_else(|| {
                Error::Unavailable(format!("container for {domain} has no network address"))
            })?;
            (ip, container_port)
        } else {
            let host_port = container
                .host_port_for(container_port)
                .or_else(|| container.ports.first().map(|p| p.host_port))
                .ok_or_else(|| {
                    Error::Unavailable(format!("container for {domain} has no published port"))
                })?;
            ("127.0.0.1".to_string(), host_port)
        };

        Ok(ProxyTarget {
            host,
            port,
            container_id: container.id,
            scheme: "http".to_string(),
        })
    }

    /// Drops the whole cache.
    pub async fn refresh_targets(&self) {
        self.cache.write().await.clear();
        self.failures.lock().expect("failure counter lock").clear();
    }

    pub async fn invalidate(&self, domain: &str) {
        self.cache.write().await.remove(domain);
        self.failures
            .lock()
            .expect("failure counter lock")
            .remove(domain);
    }

    pub async fn cached_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.cache.read().await.keys().cloned().collect();
        domains.sort();
        domains
    }

    async fn record_failure(&self, domain: &str) {
        let evict = {
            let mut failures = self.failures.lock().expect("failure counter lock");
            let count = failures.entry(domain.to_string()).or_insert(0);
            *count += 1;
            *count >= FAILURES_BEFORE_EVICT
        };
        if evict {
            tracing::warn!(domain, "evicting target after repeated upstream failures");
            self.invalidate(domain).await;
        }
    }

    fn record_success(&self, domain: &str) {
        self.failures
            .lock()
            .expect("failure counter lock")
            .remove(domain);
    }

    async fn serve(&self, req: Request<Body>) -> Response<Body> {
        let Some(domain) = request_domain(req.headers()) else {
            return error_response(StatusCode::BAD_REQUEST, "missing_host", "request carries no Host header", "");
        };

        let target = match self.get_target(&domain).await {
            Ok(target) => target,
            Err(e) if e.is_not_found() => {
                return error_response(StatusCode::NOT_FOUND, "unknown_domain", &e.to_string(), &domain)
            }
            Err(e) => {
                return error_response(StatusCode::BAD_GATEWAY, "unresolvable", &e.to_string(), &domain)
            }
        };

        self.forward(&domain, &target, req).await
    }

    async fn forward(
        &self,
        domain: &str,
        target: &ProxyTarget,
        req: Request<Body>,
    ) -> Response<Body> {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!(
            "{}://{}:{}{}",
            target.scheme, target.host, target.port, path_and_query
        );

        let mut upstream = self.client.request(parts.method.clone(), &url);
        for (name, value) in &parts.headers {
            if !is_hop_by_hop(name) && name != header::HOST {
                upstream = upstream.header(name, value);
            }
        }
        upstream = upstream
            .header("x-forwarded-host", domain)
            .header("x-forwarded-proto", "http")
            .body(reqwest::Body::wrap_stream(body.into_data_stream()));

        match upstream.send().await {
            Ok(response) => {
                self.record_success(domain);
                let mut builder = Response::builder().status(response.status());
                for (name, value) in response.headers() {
                    if !is_hop_by_hop(name) {
                        builder = builder.header(name, value);
                    }
                }
                builder
                    .body(Body::from_stream(response.bytes_stream()))
                    .unwrap_or_else(|_| {
                        StatusCode::BAD_GATEWAY.into_response()
                    })
            }
            Err(e) => {
                tracing::warn!(domain, container_id = target.container_id, error = %e, "upstream request failed");
                self.record_failure(domain).await;
                error_response(StatusCode::BAD_GATEWAY, "bad_gateway", &e.to_string(), domain)
            }
        }
    }
}

/// Axum entry point for the proxy listener.
pub async fn handle(
    State(proxy): State<Arc<ProxyService>>,
    req: Request<Body>,
) -> Response<Body> {
    proxy.serve(req).await
}

/// Request domain: the Host header, port stripped, lowercased.
fn request_domain(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.rsplit_once(':').map_or(host, |(name, port)| {
        if port.chars().all(|c| c.is_ascii_digit()) {
            name
        } else {
            host
        }
    });
    Some(host.to_ascii_lowercase())
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn error_response(status: StatusCode, code: &str, detail: &str, domain: &str) -> Response<Body> {
    let body = json!({
        "error": code,
        "domain": domain,
        "detail": detail,
    });
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| status.into_response())
}

/// Event-bus subscriber keeping the cache honest: a push invalidates the
/// matching domain, a reload flushes everything.
pub struct ProxyEvents(pub Arc<ProxyService>);

impl Subscriber for ProxyEvents {
    fn name(&self) -> &str {
        "proxy"
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
        let proxy = Arc::clone(&self.0);
        match event {
            Event::ImagePushed {
                name, reference, ..
            } => {
                let (name, reference) = (name.clone(), reference.clone());
                tokio::spawn(async move {
                    if let Some(route) = proxy.config.route_for_image(&name, &reference).await {
                        proxy.invalidate(&route.domain).await;
                    }
                });
            }
            Event::ConfigReload | Event::ManualReload => {
                tokio::spawn(async move { proxy.refresh_targets().await });
            }
            Event::RouteAdded { domain } | Event::RouteRemoved { domain } => {
                let domain = domain.clone();
                tokio::spawn(async move { proxy.invalidate(&domain).await });
            }
            // A degraded route keeps serving whatever still runs.
            Event::RouteDegraded { .. } => {}
        }
    }
}
