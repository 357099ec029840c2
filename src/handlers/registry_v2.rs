// OCI Distribution v2 HTTP surface backing `docker push` / `docker pull`.
// Reference: https://github.com/opencontainers/distribution-spec

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;

use crate::error::Error;
use crate::storage::manifests::DEFAULT_MANIFEST_CONTENT_TYPE;
use crate::AppState;

const API_VERSION_HEADER: (&str, &str) = ("Docker-Distribution-API-Version", "registry/2.0");

#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub repositories: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TagListResponse {
    pub name: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct FinalizeQuery {
    pub digest: String,
}

/// Registry error body: `{"errors": [{code, message, detail}]}`.
fn registry_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        [API_VERSION_HEADER],
        Json(json!({
            "errors": [{
                "code": code,
                "message": message,
                "detail": {}
            }]
        })),
    )
        .into_response()
}

fn error_response(err: Error) -> Response {
    match &err {
        Error::InvalidArgument(msg) => registry_error(StatusCode::BAD_REQUEST, "NAME_INVALID", msg),
        Error::DigestMismatch { .. } => {
            registry_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID", &err.to_string())
        }
        Error::BlobNotFound { .. } => {
            registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", &err.to_string())
        }
        Error::ManifestNotFound { .. } => {
            registry_error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", &err.to_string())
        }
        Error::UploadNotFound { .. } => registry_error(
            StatusCode::NOT_FOUND,
            "BLOB_UPLOAD_UNKNOWN",
            &err.to_string(),
        ),
        Error::NotFound(msg) => registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", msg),
        _ => {
            tracing::error!(error = %err, "registry request failed");
            registry_error(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", "internal error")
        }
    }
}

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// GET /v2/ - version check; an empty 200 signals v2 support.
pub async fn version_check() -> impl IntoResponse {
    (StatusCode::OK, [API_VERSION_HEADER], Json(json!({})))
}

/// GET /v2/_catalog
pub async fn get_catalog(State(state): State<AppState>) -> Response {
    match state.registry.manifests().list_repositories() {
        Ok(repositories) => (StatusCode::OK, Json(CatalogResponse { repositories })).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /v2/<name>/tags/list
pub async fn list_tags(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    tags_response(&state, name).await
}

pub async fn list_tags_namespaced(
    State(state): State<AppState>,
    Path((org, name)): Path<(String, String)>,
) -> Response {
    tags_response(&state, format!("{org}/{name}")).await
}

async fn tags_response(state: &AppState, name: String) -> Response {
    match state.registry.manifests().list_tags(&name).await {
        Ok(tags) => (StatusCode::OK, Json(TagListResponse { name, tags })).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /v2/<name>/manifests/<reference>
pub async fn get_manifest(
    State(state): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
) -> Response {
    manifest_response(&state, name, reference, true).await
}

pub async fn get_manifest_namespaced(
    State(state): State<AppState>,
    Path((org, name, reference)): Path<(String, String, String)>,
) -> Response {
    manifest_response(&state, format!("{org}/{name}"), reference, true).await
}

/// HEAD /v2/<name>/manifests/<reference>
pub async fn head_manifest(
    State(state): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
) -> Response {
    manifest_response(&state, name, reference, false).await
}

pub async fn head_manifest_namespaced(
    State(state): State<AppState>,
    Path((org, name, reference)): Path<(String, String, String)>,
) -> Response {
    manifest_response(&state, format!("{org}/{name}"), reference, false).await
}

async fn manifest_response(
    state: &AppState,
    name: String,
    reference: String,
    include_body: bool,
) -> Response {
    match state.registry.manifests().get_manifest(&name, &reference).await {
        Ok((data, content_type)) => {
            let digest = digest_of(&data);
            let builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, data.len())
                .header("Docker-Content-Digest", digest);
            let body = if include_body {
                Body::from(data)
            } else {
                Body::empty()
            };
            builder.body(body).unwrap_or_else(|_| {
                registry_error(StatusCode::INTERNAL_SERVER_ERROR, "UNKNOWN", "internal error")
            })
        }
        Err(e) => error_response(e),
    }
}

/// PUT /v2/<name>/manifests/<reference>
pub async fn put_manifest(
    State(state): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    store_manifest(&state, name, reference, headers, body).await
}

pub async fn put_manifest_namespaced(
    State(state): State<AppState>,
    Path((org, name, reference)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    store_manifest(&state, format!("{org}/{name}"), reference, headers, body).await
}

async fn store_manifest(
    state: &AppState,
    name: String,
    reference: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_MANIFEST_CONTENT_TYPE)
        .to_string();
    let digest = digest_of(&body);

    match state
        .registry
        .put_manifest(&name, &reference, &content_type, body)
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            [
                ("Docker-Content-Digest", digest),
                (
                    "Location",
                    format!("/v2/{name}/manifests/{reference}"),
                ),
            ],
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /v2/<name>/manifests/<reference>
pub async fn delete_manifest(
    State(state): State<AppState>,
    Path((name, reference)): Path<(String, String)>,
) -> Response {
    remove_manifest(&state, name, reference).await
}

pub async fn delete_manifest_namespaced(
    State(state): State<AppState>,
    Path((org, name, reference)): Path<(String, String, String)>,
) -> Response {
    remove_manifest(&state, format!("{org}/{name}"), reference).await
}

async fn remove_manifest(state: &AppState, name: String, reference: String) -> Response {
    match state.registry.manifests().delete_manifest(&name, &reference).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /v2/<name>/blobs/<digest>
pub async fn get_blob(
    State(state): State<AppState>,
    Path((_name, digest)): Path<(String, String)>,
) -> Response {
    blob_response(&state, digest, true).await
}

pub async fn get_blob_namespaced(
    State(state): State<AppState>,
    Path((_org, _name, digest)): Path<(String, String, String)>,
) -> Response {
    blob_response(&state, digest, true).await
}

/// HEAD /v2/<name>/blobs/<digest>
pub async fn head_blob(
    State(state): State<AppState>,
    Path((_name, digest)): Path<(String, String)>,
) -> Response {
    blob_response(&state, digest, false).await
}

pub async fn head_blob_namespaced(
    State(state): State<AppState>,
    Path((_org, _name, digest)): Path<(String, String, String)>,
) -> Response {
    blob_response(&state, digest, false).await
}

/// Blobs are content-addressed and shared across repositories, so the
/// repository segment only scopes authorization, not lookup.
async fn blob_response(state: &AppState, digest: String, include_body: bool) -> Response {
    if !include_body {
        return match state.registry.blobs().blob_size(&digest).await {
            Ok(size) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header("Docker-Content-Digest", digest)
                .body(Body::empty())
                .expect("static response"),
            Err(e) => error_response(e),
        };
    }

    match state.registry.blobs().open_blob(&digest).await {
        Ok((file, size)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header("Docker-Content-Digest", digest)
            .body(Body::from_stream(ReaderStream::new(file)))
            .expect("static response"),
        Err(e) => error_response(e),
    }
}

/// POST /v2/<name>/blobs/uploads/
pub async fn start_blob_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    begin_upload(&state, name).await
}

pub async fn start_blob_upload_namespaced(
    State(state): State<AppState>,
    Path((org, name)): Path<(String, String)>,
) -> Response {
    begin_upload(&state, format!("{org}/{name}")).await
}

async fn begin_upload(state: &AppState, name: String) -> Response {
    match state.registry.blobs().start_upload(&name).await {
        Ok(uuid) => (
            StatusCode::ACCEPTED,
            [
                ("Location", format!("/v2/{name}/blobs/uploads/{uuid}")),
                ("Range", "0-0".to_string()),
                ("Docker-Upload-UUID", uuid),
            ],
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /v2/<name>/blobs/uploads/<uuid> - upload progress.
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path((_name, uuid)): Path<(String, String)>,
) -> Response {
    upload_status(&state, uuid).await
}

async fn upload_status(state: &AppState, uuid: String) -> Response {
    match state.registry.blobs().upload_status(&uuid).await {
        Ok(session) => (
            StatusCode::NO_CONTENT,
            [
                ("Range", range_header(session.offset)),
                ("Docker-Upload-UUID", uuid),
            ],
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// PATCH /v2/<name>/blobs/uploads/<uuid> - append a chunk.
pub async fn upload_blob_chunk(
    State(state): State<AppState>,
    Path((_name, uuid)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    append_chunk(&state, uuid, body).await
}

pub async fn upload_blob_chunk_namespaced(
    State(state): State<AppState>,
    Path((_org, _name, uuid)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    append_chunk(&state, uuid, body).await
}

async fn append_chunk(state: &AppState, uuid: String, body: Bytes) -> Response {
    let mut reader: &[u8] = &body;
    match state.registry.blobs().append_chunk(&uuid, &mut reader).await {
        Ok(offset) => (
            StatusCode::ACCEPTED,
            [
                ("Range", range_header(offset)),
                ("Docker-Upload-UUID", uuid),
            ],
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// PUT /v2/<name>/blobs/uploads/<uuid>?digest=... - final chunk plus
/// digest verification.
pub async fn complete_blob_upload(
    State(state): State<AppState>,
    Path((name, uuid)): Path<(String, String)>,
    Query(query): Query<FinalizeQuery>,
    body: Bytes,
) -> Response {
    finalize_upload(&state, name, uuid, query.digest, body).await
}

pub async fn complete_blob_upload_namespaced(
    State(state): State<AppState>,
    Path((org, name, uuid)): Path<(String, String, String)>,
    Query(query): Query<FinalizeQuery>,
    body: Bytes,
) -> Response {
    finalize_upload(&state, format!("{org}/{name}"), uuid, query.digest, body).await
}

async fn finalize_upload(
    state: &AppState,
    name: String,
    uuid: String,
    digest: String,
    body: Bytes,
) -> Response {
    if !body.is_empty() {
        let mut reader: &[u8] = &body;
        if let Err(e) = state.registry.blobs().append_chunk(&uuid, &mut reader).await {
            return error_response(e);
        }
    }
    match state.registry.blobs().finish_upload(&uuid, &digest).await {
        Ok(digest) => (
            StatusCode::CREATED,
            [
                ("Location", format!("/v2/{name}/blobs/{digest}")),
                ("Docker-Content-Digest", digest),
            ],
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /v2/<name>/blobs/uploads/<uuid> - abandon the upload.
pub async fn cancel_blob_upload(
    State(state): State<AppState>,
    Path((_name, uuid)): Path<(String, String)>,
) -> Response {
    match state.registry.blobs().cancel_upload(&uuid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn cancel_blob_upload_namespaced(
    State(state): State<AppState>,
    Path((_org, _name, uuid)): Path<(String, String, String)>,
) -> Response {
    match state.registry.blobs().cancel_upload(&uuid).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_upload_status_namespaced(
    State(state): State<AppState>,
    Path((_org, _name, uuid)): Path<(String, String, String)>,
) -> Response {
    upload_status(&state, uuid).await
}

/// `Range: 0-<last>`; an empty upload reports `0-0`.
fn range_header(offset: u64) -> String {
    format!("0-{}", offset.saturating_sub(1))
}
