use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::storage::{BlobStore, ManifestStore};

/// Orchestrates the blob and manifest stores and announces pushes on the
/// event bus. Event delivery problems are logged, never surfaced to the
/// pushing client.
pub struct RegistryService {
    blobs: Arc<BlobStore>,
    manifests: Arc<ManifestStore>,
    events: Arc<EventBus>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub blobs_removed: usize,
    pub uploads_removed: usize,
}

impl RegistryService {
    pub fn new(
        blobs: Arc<BlobStore>,
        manifests: Arc<ManifestStore>,
        events: Arc<EventBus>,
    ) -> RegistryService {
        RegistryService {
            blobs,
            manifests,
            events,
        }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.manifests
    }

    /// Stores the manifest, then publishes `ImagePushed` so the controller
    /// redeploys and the proxy drops its cached target.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<()> {
        self.manifests
            .put_manifest(repository, reference, content_type, &data)
            .await?;

        self.events.publish(Event::ImagePushed {
            name: repository.to_string(),
            reference: reference.to_string(),
            annotations: extract_annotations(&data),
            manifest: data,
        });
        Ok(())
    }

    /// Deletes blobs no stored manifest references, plus stale upload
    /// scratch files.
    pub async fn prune(&self, upload_max_age: Duration) -> Result<PruneReport> {
        let mut referenced: HashSet<String> = HashSet::new();
        for repository in self.manifests.list_repositories()? {
            for reference in self.manifests.list_references(&repository).await? {
                let (data, _) = self.manifests.get_manifest(&repository, &reference).await?;
                referenced.extend(referenced_digests(&data));
            }
        }

        let mut report = PruneReport::default();
        for digest in self.blobs.list_blobs().await? {
            if !referenced.contains(&digest) && self.blobs.delete_blob(&digest).await? {
                tracing::info!(digest, "pruned unreferenced blob");
                report.blobs_removed += 1;
            }
        }
        report.uploads_removed = self.blobs.prune_stale_uploads(upload_max_age).await?;
        Ok(report)
    }
}

/// OCI `annotations` map from the manifest document, when present.
fn extract_annotations(manifest: &[u8]) -> HashMap<String, String> {
    serde_json::from_slice::<serde_json::Value>(manifest)
        .ok()
        .and_then(|doc| {
            doc.get("annotations").map(|annotations| {
                annotations
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                            .collect()
                    })
                    .unwrap_or_default()
            })
        })
        .unwrap_or_default()
}

/// Digests of the config and layer blobs a manifest points at.
fn referenced_digests(manifest: &[u8]) -> Vec<String> {
    let Ok(doc) = serde_json::from_slice::<serde_json::Value>(manifest) else {
        return Vec::new();
    };
    let mut digests = Vec::new();
    if let Some(digest) = doc.pointer("/config/digest").and_then(|d| d.as_str()) {
        digests.push(digest.to_string());
    }
    if let Some(layers) = doc.get("layers").and_then(|l| l.as_array()) {
        digests.extend(
            layers
                .iter()
                .filter_map(|layer| layer.get("digest").and_then(|d| d.as_str()))
                .map(str::to_string),
        );
    }
    // Image indexes reference other manifests the same way.
    if let Some(manifests) = doc.get("manifests").and_then(|m| m.as_array()) {
        digests.extend(
            manifests
                .iter()
                .filter_map(|m| m.get("digest").and_then(|d| d.as_str()))
                .map(str::to_string),
        );
    }
    digests
}
