// Router for the OCI Distribution v2 surface. Repository names with one
// namespace level (`org/name`) get their own patterns; the handlers join the
// segments back together.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::handlers::registry_v2;
use crate::AppState;

pub fn registry_v2_router(state: AppState) -> Router {
    Router::new()
        .route("/v2", get(registry_v2::version_check))
        .route("/v2/", get(registry_v2::version_check))
        .route("/v2/_catalog", get(registry_v2::get_catalog))
        // Tag listing
        .route("/v2/:name/tags/list", get(registry_v2::list_tags))
        .route(
            "/v2/:name/:sub/tags/list",
            get(registry_v2::list_tags_namespaced),
        )
        // Manifests
        .route(
            "/v2/:name/manifests/:reference",
            get(registry_v2::get_manifest)
                .head(registry_v2::head_manifest)
                .put(registry_v2::put_manifest)
                .delete(registry_v2::delete_manifest),
        )
        .route(
            "/v2/:name/:sub/manifests/:reference",
            get(registry_v2::get_manifest_namespaced)
                .head(registry_v2::head_manifest_namespaced)
                .put(registry_v2::put_manifest_namespaced)
                .delete(registry_v2::delete_manifest_namespaced),
        )
        // Blobs
        .route(
            "/v2/:name/blobs/:digest",
            get(registry_v2::get_blob).head(registry_v2::head_blob),
        )
        .route(
            "/v2/:name/:sub/blobs/:digest",
            get(registry_v2::get_blob_namespaced).head(registry_v2::head_blob_namespaced),
        )
        // Chunked uploads
        .route(
            "/v2/:name/blobs/uploads/",
            post(registry_v2::start_blob_upload),
        )
        .route(
            "/v2/:name/:sub/blobs/uploads/",
            post(registry_v2::start_blob_upload_namespaced),
        )
        .route(
            "/v2/:name/blobs/uploads/:uuid",
            get(registry_v2::get_upload_status)
                .patch(registry_v2::upload_blob_chunk)
                .put(registry_v2::complete_blob_upload)
                .delete(registry_v2::cancel_blob_upload),
        )
        .route(
            "/v2/:name/:sub/blobs/uploads/:uuid",
            get(registry_v2::get_upload_status_namespaced)
                .patch(registry_v2::upload_blob_chunk_namespaced)
                .put(registry_v2::complete_blob_upload_namespaced)
                .delete(registry_v2::cancel_blob_upload_namespaced),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Per-client admission control on the registry surface. Keys are
/// `ip:<addr>`, falling back to `global` when the connection address is not
/// available.
async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| format!("ip:{}", info.0.ip()))
        .unwrap_or_else(|| "global".to_string());

    if !state.limiter.allow(&key) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "errors": [{
                    "code": "TOOMANYREQUESTS",
                    "message": "rate limit exceeded",
                    "detail": {}
                }]
            })),
        )
            .into_response();
    }
    next.run(request).await
}
