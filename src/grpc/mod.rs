pub mod admin;
pub mod auth;
pub mod core;
pub mod secrets;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::models::{Container, ExternalRoute, Route};
use crate::proxy::ProxyTarget;

pub mod proto {
    tonic::include_proto!("gordon.v1");
}

pub use self::admin::AdminServer;
pub use self::auth::AuthService;
pub use self::core::{CoreServer, WatcherEvents, WatcherSet};
pub use self::secrets::SecretsServer;

impl From<Error> for tonic::Status {
    fn from(err: Error) -> tonic::Status {
        use tonic::Status;
        match &err {
            Error::RouteNotFound { .. }
            | Error::AttachmentNotFound { .. }
            | Error::BlobNotFound { .. }
            | Error::ManifestNotFound { .. }
            | Error::UploadNotFound { .. }
            | Error::NotFound(_) => Status::not_found(err.to_string()),
            Error::RouteExists { .. }
            | Error::AttachmentExists { .. }
            | Error::AlreadyExists(_) => Status::already_exists(err.to_string()),
            Error::RouteDomainEmpty
            | Error::RouteImageEmpty
            | Error::AttachmentImageEmpty
            | Error::AttachmentTargetEmpty
            | Error::DigestMismatch { .. }
            | Error::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            Error::PermissionDenied(_) => Status::permission_denied(err.to_string()),
            Error::Unauthenticated(_) => Status::unauthenticated(err.to_string()),
            Error::Unavailable(_) | Error::DeployFailed { .. } => {
                Status::unavailable(err.to_string())
            }
            Error::JobRunning { .. } => Status::failed_precondition(err.to_string()),
            Error::Timeout(_) => Status::deadline_exceeded(err.to_string()),
            Error::Cancelled => Status::cancelled(err.to_string()),
            Error::Storage(_) | Error::Internal(_) => Status::internal(err.to_string()),
        }
    }
}

/// Serves the three services until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    core: CoreServer,
    admin: AdminServer,
    secrets: SecretsServer,
    cancel: CancellationToken,
) -> crate::error::Result<()> {
    tonic::transport::Server::builder()
        .add_service(proto::core_service_server::CoreServiceServer::new(core))
        .add_service(proto::admin_service_server::AdminServiceServer::new(admin))
        .add_service(proto::secrets_service_server::SecretsServiceServer::new(
            secrets,
        ))
        .serve_with_shutdown(addr, cancel.cancelled_owned())
        .await
        .map_err(|e| Error::Unavailable(format!("grpc server: {e}")))
}

pub(crate) fn route_to_proto(route: Route) -> proto::Route {
    proto::Route {
        domain: route.domain,
        image: route.image,
        https: route.https,
        port: route.port.map_or(0, u32::from),
    }
}

pub(crate) fn route_from_proto(route: proto::Route) -> Result<Route, tonic::Status> {
    let port = match route.port {
        0 => None,
        p => Some(
            u16::try_from(p)
                .map_err(|_| tonic::Status::invalid_argument("port out of range"))?,
        ),
    };
    Ok(Route {
        domain: route.domain,
        image: route.image,
        https: route.https,
        port,
    })
}

pub(crate) fn external_route_to_proto(route: ExternalRoute) -> proto::ExternalRoute {
    proto::ExternalRoute {
        domain: route.domain,
        host: route.host,
        port: u32::from(route.port),
    }
}

pub(crate) fn container_to_proto(container: Container) -> proto::ContainerInfo {
    proto::ContainerInfo {
        id: container.id,
        image: container.image,
        domain: container.domain,
        status: container.status,
        network: container.network.unwrap_or_default(),
        ports: container
            .ports
            .into_iter()
            .map(|p| proto::PortBinding {
                container_port: u32::from(p.container_port),
                host_port: u32::from(p.host_port),
                host_ip: p.host_ip,
            })
            .collect(),
    }
}

pub(crate) fn target_to_proto(target: ProxyTarget) -> proto::ProxyTarget {
    proto::ProxyTarget {
        host: target.host,
        port: u32::from(target.port),
        container_id: target.container_id,
        scheme: target.scheme,
    }
}
