mod utils;

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use gordon::events::EventBus;
use gordon::rate_limit::RateLimiter;
use gordon::registry::RegistryService;
use gordon::storage::{BlobStore, ManifestStore};
use gordon::{create_registry_app, AppState};

fn app(dir: &tempfile::TempDir) -> axum::Router {
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(RegistryService::new(
        Arc::new(BlobStore::new(dir.path()).unwrap()),
        Arc::new(ManifestStore::new(dir.path()).unwrap()),
        events,
    ));
    create_registry_app(AppState {
        registry,
        limiter: Arc::new(RateLimiter::new(1000.0, 1000)),
    })
}

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes()
        .to_vec()
}

fn header_value<'r>(response: &'r axum::response::Response, name: &str) -> &'r str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}

#[tokio::test]
async fn version_check_is_empty_200() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let response = app(&dir)
        .oneshot(Request::get("/v2/").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_value(&response, "Docker-Distribution-API-Version"),
        "registry/2.0"
    );
    Ok(())
}

#[tokio::test]
async fn full_blob_upload_flow() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(&dir);
    let content = b"HELLO";
    let digest = digest_of(content);

    // POST starts the session.
    let response = app
        .clone()
        .oneshot(Request::post("/v2/myapp/blobs/uploads/").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_value(&response, "Range"), "0-0");
    let location = header_value(&response, "Location").to_string();
    let uuid = header_value(&response, "Docker-Upload-UUID").to_string();
    assert_eq!(location, format!("/v2/myapp/blobs/uploads/{uuid}"));

    // PATCH appends bytes.
    let response = app
        .clone()
        .oneshot(
            Request::patch(location.as_str())
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from(content.as_slice()))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_value(&response, "Range"), "0-4");

    // PUT finalizes against the digest.
    let response = app
        .clone()
        .oneshot(
            Request::put(format!("{location}?digest={digest}")).body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_value(&response, "Docker-Content-Digest"), digest);

    // HEAD then GET serve it back.
    let response = app
        .clone()
        .oneshot(
            Request::head(format!("/v2/myapp/blobs/{digest}")).body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_value(&response, header::CONTENT_LENGTH.as_str()), "5");

    let response = app
        .oneshot(Request::get(format!("/v2/myapp/blobs/{digest}")).body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, content);
    Ok(())
}

#[tokio::test]
async fn upload_can_be_cancelled() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(&dir);

    let response = app
        .clone()
        .oneshot(Request::post("/v2/myapp/blobs/uploads/").body(Body::empty())?)
        .await?;
    let location = header_value(&response, "Location").to_string();

    let response = app
        .clone()
        .oneshot(Request::delete(location.as_str()).body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The session is gone.
    let response = app
        .oneshot(Request::get(location.as_str()).body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn digest_mismatch_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(&dir);

    let response = app
        .clone()
        .oneshot(Request::post("/v2/myapp/blobs/uploads/").body(Body::empty())?)
        .await?;
    let location = header_value(&response, "Location").to_string();
    let wrong = digest_of(b"something else");

    let response = app
        .oneshot(
            Request::put(format!("{location}?digest={wrong}"))
                .body(Body::from(&b"actual content"[..]))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = String::from_utf8(body_bytes(response).await)?;
    assert!(body.contains("DIGEST_INVALID"));
    Ok(())
}

#[tokio::test]
async fn manifest_put_get_tags_and_catalog() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(&dir);
    let manifest = br#"{"schemaVersion":2,"version":1}"#;

    let response = app
        .clone()
        .oneshot(
            Request::put("/v2/myapp/manifests/latest")
                .header(header::CONTENT_TYPE, "application/vnd.oci.image.manifest.v1+json")
                .body(Body::from(manifest.as_slice()))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_value(&response, "Docker-Content-Digest"),
        digest_of(manifest)
    );

    let response = app
        .clone()
        .oneshot(Request::get("/v2/myapp/manifests/latest").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_value(&response, header::CONTENT_TYPE.as_str()),
        "application/vnd.oci.image.manifest.v1+json"
    );
    assert_eq!(body_bytes(response).await, manifest);

    let response = app
        .clone()
        .oneshot(Request::get("/v2/myapp/tags/list").body(Body::empty())?)
        .await?;
    let tags: serde_json::Value = serde_json::from_slice(&body_bytes(response).await)?;
    assert_eq!(tags["name"], "myapp");
    assert_eq!(tags["tags"], serde_json::json!(["latest"]));

    let response = app
        .oneshot(Request::get("/v2/_catalog").body(Body::empty())?)
        .await?;
    let catalog: serde_json::Value = serde_json::from_slice(&body_bytes(response).await)?;
    assert_eq!(catalog["repositories"], serde_json::json!(["myapp"]));
    Ok(())
}

#[tokio::test]
async fn namespaced_repositories_use_two_segments() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(&dir);
    let manifest = br#"{"schemaVersion":2}"#;

    let response = app
        .clone()
        .oneshot(
            Request::put("/v2/team/api/manifests/v1")
                .header(header::CONTENT_TYPE, "application/vnd.oci.image.manifest.v1+json")
                .body(Body::from(manifest.as_slice()))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(Request::get("/v2/team/api/tags/list").body(Body::empty())?)
        .await?;
    let tags: serde_json::Value = serde_json::from_slice(&body_bytes(response).await)?;
    assert_eq!(tags["name"], "team/api");

    let response = app
        .oneshot(Request::delete("/v2/team/api/manifests/v1").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    Ok(())
}

#[tokio::test]
async fn traversal_attempts_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(&dir);

    // Repository names are validated before touching the filesystem.
    let response = app
        .clone()
        .oneshot(
            Request::put("/v2/UPPER/manifests/latest").body(Body::from(&b"{}"[..]))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(Request::get("/v2/myapp/blobs/sha256:notahexdigest").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn missing_manifest_and_blob_are_404() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let app = app(&dir);

    let response = app
        .clone()
        .oneshot(Request::get("/v2/myapp/manifests/ghost").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = String::from_utf8(body_bytes(response).await)?;
    assert!(body.contains("MANIFEST_UNKNOWN"));

    let missing = digest_of(b"missing");
    let response = app
        .oneshot(Request::get(format!("/v2/myapp/blobs/{missing}")).body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn rate_limiter_returns_429_when_exhausted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(RegistryService::new(
        Arc::new(BlobStore::new(dir.path()).unwrap()),
        Arc::new(ManifestStore::new(dir.path()).unwrap()),
        events,
    ));
    let app = create_registry_app(AppState {
        registry,
        limiter: Arc::new(RateLimiter::new(0.0, 2)),
    });

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(Request::get("/v2/").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app
        .oneshot(Request::get("/v2/").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    Ok(())
}
