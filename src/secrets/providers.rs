use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::Secret;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::secrets::SecretProvider;
use crate::storage::paths::join_within;

/// Reads secrets from process environment variables.
pub struct EnvProvider;

#[async_trait]
impl SecretProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn get_secret(&self, path: &str) -> Result<Secret<String>> {
        std::env::var(path)
            .map(Secret::new)
            .map_err(|_| Error::NotFound(format!("environment variable {path}")))
    }
}

/// Reads plaintext secret files under a fixed directory. Unencrypted on
/// purpose; the directory permissions are the only protection.
pub struct FileProvider {
    root: PathBuf,
}

impl FileProvider {
    pub fn new<P: Into<PathBuf>>(root: P) -> FileProvider {
        FileProvider { root: root.into() }
    }
}

#[async_trait]
impl SecretProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn is_available(&self) -> bool {
        self.root.is_dir()
    }

    async fn get_secret(&self, path: &str) -> Result<Secret<String>> {
        let full = join_within(&self.root, path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(contents) => Ok(Secret::new(contents.trim_end_matches('\n').to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("secret {path}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Shells out to `pass show <path>`.
pub struct PassProvider;

#[async_trait]
impl SecretProvider for PassProvider {
    fn name(&self) -> &str {
        "pass"
    }

    async fn is_available(&self) -> bool {
        Command::new("pass")
            .arg("version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn get_secret(&self, path: &str) -> Result<Secret<String>> {
        let output = Command::new("pass")
            .args(["show", path])
            .output()
            .await
            .map_err(|e| Error::Unavailable(format!("pass: {e}")))?;
        if !output.status.success() {
            return Err(Error::NotFound(format!("secret {path}")));
        }
        let value = String::from_utf8(output.stdout)
            .map_err(|_| Error::internal("pass returned non-utf8 output"))?;
        // First line only; pass stores metadata on the following lines.
        Ok(Secret::new(
            value.lines().next().unwrap_or_default().to_string(),
        ))
    }
}

/// Shells out to `sops --decrypt <file>` and returns the decrypted document.
pub struct SopsProvider;

#[async_trait]
impl SecretProvider for SopsProvider {
    fn name(&self) -> &str {
        "sops"
    }

    async fn is_available(&self) -> bool {
        Command::new("sops")
            .arg("--version")
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    async fn get_secret(&self, path: &str) -> Result<Secret<String>> {
        let output = Command::new("sops")
            .args(["--decrypt", path])
            .output()
            .await
            .map_err(|e| Error::Unavailable(format!("sops: {e}")))?;
        if !output.status.success() {
            return Err(Error::NotFound(format!("secret {path}")));
        }
        let value = String::from_utf8(output.stdout)
            .map_err(|_| Error::internal("sops returned non-utf8 output"))?;
        Ok(Secret::new(value.trim_end_matches('\n').to_string()))
    }
}
