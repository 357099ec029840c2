use std::sync::Arc;

use axum::Router;

pub mod config;
pub mod containers;
pub mod error;
pub mod events;
pub mod grpc;
pub mod handlers;
pub mod health;
pub mod logs;
pub mod models;
pub mod proxy;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod runtime;
pub mod scheduler;
pub mod secrets;
pub mod storage;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for the registry HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<registry::RegistryService>,
    pub limiter: Arc<rate_limit::RateLimiter>,
}

/// The OCI registry application.
pub fn create_registry_app(state: AppState) -> Router {
    routes::registry_v2_router(state)
}
