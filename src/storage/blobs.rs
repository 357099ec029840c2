use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::reference::validate_digest;
use crate::storage::paths::{join_within, valid_repository_name};

/// Content-addressed blob store with resumable chunked uploads.
///
/// Finished blobs live under `blobs/sha256/<first2>/<hex>`; in-flight uploads
/// under `uploads/<uuid>`. The digest is computed once at finalize, never
/// from an interrupted incremental hash.
pub struct BlobStore {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
}

/// One chunked upload. Sessions have a single owner; appends on the same
/// UUID are serialized by the per-session lock.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub repository: String,
    pub offset: u64,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<BlobStore> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("blobs"))?;
        std::fs::create_dir_all(root.join("uploads"))?;
        Ok(BlobStore {
            root,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        validate_digest(digest)?;
        let hex = &digest["sha256:".len()..];
        join_within(&self.root, &format!("blobs/sha256/{}/{}", &hex[..2], hex))
    }

    fn upload_path(&self, uuid: &str) -> Result<PathBuf> {
        join_within(&self.root, &format!("uploads/{uuid}"))
    }

    async fn session(&self, uuid: &str) -> Result<Arc<Mutex<UploadSession>>> {
        self.sessions
            .read()
            .await
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::UploadNotFound { uuid: uuid.to_string() })
    }

    /// Creates a scratch file and returns the session UUID. The UUID
    /// namespace is flat; the repository is recorded for bookkeeping only.
    pub async fn start_upload(&self, repository: &str) -> Result<String> {
        if !valid_repository_name(repository) {
            return Err(Error::invalid(format!("invalid repository name: {repository}")));
        }
        let uuid = Uuid::new_v4().to_string();
        fs::File::create(self.upload_path(&uuid)?).await?;
        self.sessions.write().await.insert(
            uuid.clone(),
            Arc::new(Mutex::new(UploadSession {
                repository: repository.to_string(),
                offset: 0,
            })),
        );
        tracing::debug!(uuid, repository, "upload started");
        Ok(uuid)
    }

    /// Appends bytes to an upload and returns the new offset. On a write
    /// error the file is truncated back to the recorded offset, so a failed
    /// append leaves the session unchanged.
    pub async fn append_chunk<R>(&self, uuid: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let session = self.session(uuid).await?;
        let mut session = session.lock().await;

        let path = self.upload_path(uuid)?;
        let mut file = match fs::OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::UploadNotFound { uuid: uuid.to_string() })
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(session.offset)).await?;

        let written = match tokio::io::copy(reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                let _ = file.set_len(session.offset).await;
                return Err(e.into());
            }
        };
        file.sync_all().await?;

        session.offset += written;
        tracing::debug!(uuid, offset = session.offset, "chunk appended");
        Ok(session.offset)
    }

    /// Current `(repository, offset)` of an upload.
    pub async fn upload_status(&self, uuid: &str) -> Result<UploadSession> {
        let session = self.session(uuid).await?;
        let session = session.lock().await;
        Ok(session.clone())
    }

    /// Verifies the uploaded content against `expected` and atomically moves
    /// it into the blob tree. A mismatch keeps the session alive so the
    /// client can cancel or retry. Finishing a digest that already exists is
    /// an idempotent success.
    pub async fn finish_upload(&self, uuid: &str, expected: &str) -> Result<String> {
        let dest = self.blob_path(expected)?;
        let session = self.session(uuid).await?;
        let guard = session.lock().await;

        let scratch = self.upload_path(uuid)?;
        let mut file = fs::File::open(&scratch).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != expected {
            return Err(Error::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        drop(file);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::try_exists(&dest).await? {
            fs::remove_file(&scratch).await?;
        } else {
            fs::rename(&scratch, &dest).await?;
        }

        let repository = guard.repository.clone();
        drop(guard);
        self.sessions.write().await.remove(uuid);
        tracing::info!(uuid, digest = expected, repository, "upload finished");
        Ok(expected.to_string())
    }

    /// Deletes the scratch file and forgets the session.
    pub async fn cancel_upload(&self, uuid: &str) -> Result<()> {
        self.session(uuid).await?;
        match fs::remove_file(self.upload_path(uuid)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.sessions.write().await.remove(uuid);
        tracing::debug!(uuid, "upload cancelled");
        Ok(())
    }

    pub async fn get_blob(&self, digest: &str) -> Result<bytes::Bytes> {
        let path = self.blob_path(digest)?;
        match fs::read(&path).await {
            Ok(data) => Ok(bytes::Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens the blob for streaming reads.
    pub async fn open_blob(&self, digest: &str) -> Result<(fs::File, u64)> {
        let path = self.blob_path(digest)?;
        match fs::File::open(&path).await {
            Ok(file) => {
                let size = file.metadata().await?.len();
                Ok((file, size))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// On-disk location for zero-copy serving. Fails if the blob is absent.
    pub async fn get_blob_path(&self, digest: &str) -> Result<PathBuf> {
        let path = self.blob_path(digest)?;
        if !fs::try_exists(&path).await? {
            return Err(Error::BlobNotFound {
                digest: digest.to_string(),
            });
        }
        Ok(path)
    }

    pub async fn blob_exists(&self, digest: &str) -> Result<bool> {
        Ok(fs::try_exists(&self.blob_path(digest)?).await?)
    }

    pub async fn blob_size(&self, digest: &str) -> Result<u64> {
        let path = self.blob_path(digest)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::BlobNotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_blob(&self, digest: &str) -> Result<bool> {
        match fs::remove_file(self.blob_path(digest)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All stored digests, from the two-level fan-out.
    pub async fn list_blobs(&self) -> Result<Vec<String>> {
        let algo_dir = self.root.join("blobs").join("sha256");
        let mut digests = Vec::new();
        let mut outer = match fs::read_dir(&algo_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(digests),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = outer.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut inner = fs::read_dir(entry.path()).await?;
            while let Some(blob) = inner.next_entry().await? {
                if let Some(hex) = blob.file_name().to_str() {
                    digests.push(format!("sha256:{hex}"));
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Removes upload scratch files older than `max_age` that no live
    /// session owns. Returns the number of files removed.
    pub async fn prune_stale_uploads(&self, max_age: Duration) -> Result<usize> {
        let sessions = self.sessions.read().await;
        let cutoff = SystemTime::now() - max_age;
        let mut removed = 0;
        let mut dir = fs::read_dir(self.root.join("uploads")).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(uuid) = name.to_str() else { continue };
            if sessions.contains_key(uuid) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if modified <= cutoff {
                fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
