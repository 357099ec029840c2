use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::config::ConfigService;
use crate::containers::ContainerService;
use crate::grpc::proto;
use crate::grpc::{container_to_proto, route_from_proto, route_to_proto, AuthService};
use crate::health::HealthService;
use crate::logs::LogService;
use crate::models::Attachment;

/// Authenticated management surface. Every method except
/// `AuthenticatePassword` requires a bearer token with the operation's
/// `admin:<resource>:<action>` scope.
pub struct AdminServer {
    auth: Arc<AuthService>,
    config: Arc<ConfigService>,
    containers: Arc<ContainerService>,
    health: Arc<HealthService>,
    logs: Arc<LogService>,
    started: Instant,
}

impl AdminServer {
    pub fn new(
        auth: Arc<AuthService>,
        config: Arc<ConfigService>,
        containers: Arc<ContainerService>,
        health: Arc<HealthService>,
        logs: Arc<LogService>,
    ) -> AdminServer {
        AdminServer {
            auth,
            config,
            containers,
            health,
            logs,
            started: Instant::now(),
        }
    }
}

#[tonic::async_trait]
impl proto::admin_service_server::AdminService for AdminServer {
    async fn authenticate_password(
        &self,
        request: Request<proto::AuthenticatePasswordRequest>,
    ) -> Result<Response<proto::AuthenticatePasswordResponse>, Status> {
        let req = request.into_inner();
        self.auth.verify_password(&req.password)?;

        let scopes = vec!["admin:*".to_string()];
        // Password-derived sessions expire after 30 days.
        let (token, secret) = self
            .auth
            .tokens()
            .save("admin", scopes.clone(), Some(30 * 24 * 3600))
            .await
            .map_err(Status::from)?;

        use secrecy::ExposeSecret;
        Ok(Response::new(proto::AuthenticatePasswordResponse {
            token: secret.expose_secret().clone(),
            subject: token.subject,
            scopes,
        }))
    }

    async fn add_route(
        &self,
        request: Request<proto::AddRouteRequest>,
    ) -> Result<Response<proto::AddRouteResponse>, Status> {
        self.auth.authorize(&request, "routes", "write")?;
        let route = route_from_proto(
            request
                .into_inner()
                .route
                .ok_or_else(|| Status::invalid_argument("route is required"))?,
        )?;
        self.config.add_route(route.clone()).await.map_err(Status::from)?;
        Ok(Response::new(proto::AddRouteResponse {
            route: Some(route_to_proto(route)),
        }))
    }

    async fn update_route(
        &self,
        request: Request<proto::UpdateRouteRequest>,
    ) -> Result<Response<proto::UpdateRouteResponse>, Status> {
        self.auth.authorize(&request, "routes", "write")?;
        let route = route_from_proto(
            request
                .into_inner()
                .route
                .ok_or_else(|| Status::invalid_argument("route is required"))?,
        )?;
        self.config.update_route(route.clone()).await.map_err(Status::from)?;
        Ok(Response::new(proto::UpdateRouteResponse {
            route: Some(route_to_proto(route)),
        }))
    }

    async fn remove_route(
        &self,
        request: Request<proto::RemoveRouteRequest>,
    ) -> Result<Response<proto::RemoveRouteResponse>, Status> {
        self.auth.authorize(&request, "routes", "delete")?;
        let domain = request.into_inner().domain;
        self.config.remove_route(&domain).await.map_err(Status::from)?;
        Ok(Response::new(proto::RemoveRouteResponse {}))
    }

    async fn list_routes(
        &self,
        request: Request<proto::ListRoutesRequest>,
    ) -> Result<Response<proto::ListRoutesResponse>, Status> {
        self.auth.authorize(&request, "routes", "read")?;
        let details = self.containers.list_routes_with_details().await;
        Ok(Response::new(proto::ListRoutesResponse {
            routes: details
                .into_iter()
                .map(|d| proto::RouteDetails {
                    route: Some(route_to_proto(d.route)),
                    container: d.container.map(container_to_proto),
                    running: d.running,
                })
                .collect(),
        }))
    }

    async fn add_attachment(
        &self,
        request: Request<proto::AddAttachmentRequest>,
    ) -> Result<Response<proto::AddAttachmentResponse>, Status> {
        self.auth.authorize(&request, "attachments", "write")?;
        let attachment = request
            .into_inner()
            .attachment
            .ok_or_else(|| Status::invalid_argument("attachment is required"))?;
        self.config
            .add_attachment(Attachment {
                target: attachment.target,
                image: attachment.image,
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(proto::AddAttachmentResponse {}))
    }

    async fn remove_attachment(
        &self,
        request: Request<proto::RemoveAttachmentRequest>,
    ) -> Result<Response<proto::RemoveAttachmentResponse>, Status> {
        self.auth.authorize(&request, "attachments", "delete")?;
        let attachment = request
            .into_inner()
            .attachment
            .ok_or_else(|| Status::invalid_argument("attachment is required"))?;
        self.config
            .remove_attachment(&Attachment {
                target: attachment.target,
                image: attachment.image,
            })
            .await
            .map_err(Status::from)?;
        Ok(Response::new(proto::RemoveAttachmentResponse {}))
    }

    async fn status(
        &self,
        request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        self.auth.authorize(&request, "status", "read")?;
        let routes = self.config.get_routes().await;
        let containers = self.containers.list().await;
        Ok(Response::new(proto::StatusResponse {
            version: crate::VERSION.to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            route_count: routes.len() as u32,
            containers_running: containers.iter().filter(|c| c.is_running()).count() as u32,
        }))
    }

    async fn health(
        &self,
        request: Request<proto::HealthRequest>,
    ) -> Result<Response<proto::HealthResponse>, Status> {
        self.auth.authorize(&request, "health", "read")?;
        let domains = self
            .health
            .check_all()
            .await
            .into_iter()
            .map(|h| proto::DomainHealth {
                domain: h.domain,
                healthy: h.healthy,
                response_time_ms: h.response_time_ms,
                error: h.error.unwrap_or_default(),
            })
            .collect();
        Ok(Response::new(proto::HealthResponse { domains }))
    }

    async fn get_config(
        &self,
        request: Request<proto::GetConfigRequest>,
    ) -> Result<Response<proto::GetConfigResponse>, Status> {
        self.auth.authorize(&request, "config", "read")?;
        let config_toml = self.config.to_toml().await.map_err(Status::from)?;
        Ok(Response::new(proto::GetConfigResponse { config_toml }))
    }

    async fn reload(
        &self,
        request: Request<proto::ReloadRequest>,
    ) -> Result<Response<proto::ReloadResponse>, Status> {
        self.auth.authorize(&request, "config", "write")?;
        self.config.reload().await.map_err(Status::from)?;
        Ok(Response::new(proto::ReloadResponse {}))
    }

    async fn deploy(
        &self,
        request: Request<proto::DeployRequest>,
    ) -> Result<Response<proto::DeployResponse>, Status> {
        self.auth.authorize(&request, "deploy", "write")?;
        let domain = request.into_inner().domain;
        let route = self.config.get_route(&domain).await.map_err(Status::from)?;
        let container = self
            .containers
            .deploy_with(&route, true)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(proto::DeployResponse {
            container: Some(container_to_proto(container)),
        }))
    }

    type LogsStream = Pin<Box<dyn Stream<Item = Result<proto::LogLine, Status>> + Send + 'static>>;

    async fn logs(
        &self,
        request: Request<proto::LogsRequest>,
    ) -> Result<Response<Self::LogsStream>, Status> {
        self.auth.authorize(&request, "logs", "read")?;
        let req = request.into_inner();
        let tail = if req.tail == 0 { 100 } else { req.tail as usize };
        let cancel = CancellationToken::new();

        let (tx, rx) = mpsc::channel::<Result<proto::LogLine, Status>>(64);

        if req.domain.is_empty() {
            let mut lines = self.logs.process_logs(tail, req.follow, cancel.clone());
            tokio::spawn(async move {
                // Dropping the guard on exit stops the underlying follower.
                let _guard = cancel.drop_guard();
                while let Some(line) = lines.recv().await {
                    let message = proto::LogLine {
                        line,
                        source: "process".to_string(),
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
            });
        } else {
            let container = self
                .containers
                .get(&req.domain)
                .await
                .ok_or_else(|| Status::not_found(format!("no container for {}", req.domain)))?;
            let mut lines = self
                .logs
                .container_logs(&container.id, Some(tail), req.follow, cancel.clone())
                .await
                .map_err(Status::from)?;
            tokio::spawn(async move {
                let _guard = cancel.drop_guard();
                while let Some(line) = lines.recv().await {
                    let message = proto::LogLine {
                        line: line.line,
                        source: line.source.as_str().to_string(),
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        return;
                    }
                }
            });
        }

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}
