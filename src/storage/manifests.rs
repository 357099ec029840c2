use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::reference::is_digest_shaped;
use crate::storage::paths::{join_within, valid_repository_name};

/// Fallback when a manifest's content-type sidecar is missing or corrupt.
pub const DEFAULT_MANIFEST_CONTENT_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

const MEDIATYPE_SUFFIX: &str = ".mediatype";
const TMP_PREFIX: &str = ".tmp-";

/// Tag-to-manifest mapping per repository.
///
/// Layout: `repositories/<repo>/manifests/<reference>` holds the manifest
/// bytes and `<reference>.mediatype` the content type. Repository names may
/// contain `/`, producing nested directories.
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<ManifestStore> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("repositories"))?;
        Ok(ManifestStore { root })
    }

    fn manifests_dir(&self, repository: &str) -> Result<PathBuf> {
        if !valid_repository_name(repository) {
            return Err(Error::invalid(format!("invalid repository name: {repository}")));
        }
        Ok(join_within(&self.root.join("repositories"), repository)?.join("manifests"))
    }

    fn manifest_path(&self, repository: &str, reference: &str) -> Result<PathBuf> {
        validate_reference(reference)?;
        Ok(self.manifests_dir(repository)?.join(reference))
    }

    /// Writes the manifest and its content-type sidecar, each with a
    /// temp-file-plus-rename so a reader never observes a partial write.
    /// Tags are mutable (re-push overwrites); digests are immutable in
    /// practice because identical content rewrites identical bytes.
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        content_type: &str,
        data: &[u8],
    ) -> Result<()> {
        let path = self.manifest_path(repository, reference)?;
        let dir = path.parent().expect("manifest path has a parent").to_path_buf();
        fs::create_dir_all(&dir).await?;

        write_atomic(&dir, &path, data).await?;
        let sidecar = sidecar_path(&path);
        write_atomic(&dir, &sidecar, content_type.as_bytes()).await?;

        tracing::info!(repository, reference, content_type, "manifest stored");
        Ok(())
    }

    pub async fn get_manifest(&self, repository: &str, reference: &str) -> Result<(Bytes, String)> {
        let path = self.manifest_path(repository, reference)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ManifestNotFound {
                    repository: repository.to_string(),
                    reference: reference.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let content_type = match fs::read(sidecar_path(&path)).await {
            Ok(raw) => String::from_utf8(raw)
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| DEFAULT_MANIFEST_CONTENT_TYPE.to_string()),
            Err(_) => DEFAULT_MANIFEST_CONTENT_TYPE.to_string(),
        };

        Ok((Bytes::from(data), content_type))
    }

    pub async fn manifest_exists(&self, repository: &str, reference: &str) -> Result<bool> {
        Ok(fs::try_exists(&self.manifest_path(repository, reference)?).await?)
    }

    /// Removes the manifest and its sidecar. A missing sidecar is not an
    /// error; a missing manifest is.
    pub async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()> {
        let path = self.manifest_path(repository, reference)?;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ManifestNotFound {
                    repository: repository.to_string(),
                    reference: reference.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        let _ = fs::remove_file(sidecar_path(&path)).await;
        tracing::info!(repository, reference, "manifest deleted");
        Ok(())
    }

    /// Tags in a repository, sorted. Content-type sidecars and digest-shaped
    /// references are excluded.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let dir = self.manifests_dir(repository)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("repository {repository}")))
            }
            Err(e) => return Err(e.into()),
        };

        let mut tags = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(MEDIATYPE_SUFFIX) || name.starts_with(TMP_PREFIX) || is_digest_shaped(name) {
                continue;
            }
            tags.push(name.to_string());
        }
        tags.sort();
        Ok(tags)
    }

    /// Every stored reference including digest-shaped ones, for garbage
    /// collection walks.
    pub async fn list_references(&self, repository: &str) -> Result<Vec<String>> {
        let dir = self.manifests_dir(repository)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut references = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(MEDIATYPE_SUFFIX) || name.starts_with(TMP_PREFIX) {
                continue;
            }
            references.push(name.to_string());
        }
        references.sort();
        Ok(references)
    }

    /// Every directory under `repositories/` that contains a `manifests/`
    /// subdirectory, as `/`-joined names, sorted.
    pub fn list_repositories(&self) -> Result<Vec<String>> {
        let mut repositories = Vec::new();
        collect_repositories(&self.root.join("repositories"), "", &mut repositories)?;
        repositories.sort();
        Ok(repositories)
    }
}

fn sidecar_path(manifest_path: &Path) -> PathBuf {
    let mut name = manifest_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    name.push_str(MEDIATYPE_SUFFIX);
    manifest_path.with_file_name(name)
}

/// References are tags (`[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`) or digests.
/// Digest-shaped tags are accepted for storage; only listing filters them.
fn validate_reference(reference: &str) -> Result<()> {
    if is_digest_shaped(reference) {
        return Ok(());
    }
    let mut chars = reference.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid_first || !valid_rest || reference.len() > 128 {
        return Err(Error::invalid(format!("invalid reference: {reference}")));
    }
    Ok(())
}

fn collect_repositories(dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == "manifests" {
            continue;
        }
        let repo_name = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        if entry.path().join("manifests").is_dir() {
            out.push(repo_name.clone());
        }
        collect_repositories(&entry.path(), &repo_name, out)?;
    }
    Ok(())
}

async fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<()> {
    let tmp = dir.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, dest).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
