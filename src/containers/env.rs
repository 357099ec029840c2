use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use crate::error::Result;
use crate::secrets::SecretResolver;
use crate::storage::paths::sanitize_name;

/// Per-scope env files plus the merge and secret-resolution step that turns
/// them into a container environment. A scope is a domain, or a
/// `target-image` pair for attachments.
pub struct EnvLoader {
    dir: PathBuf,
    resolver: Arc<SecretResolver>,
}

impl EnvLoader {
    pub fn new<P: AsRef<Path>>(data_dir: P, resolver: Arc<SecretResolver>) -> Result<EnvLoader> {
        let dir = data_dir.as_ref().join("env");
        std::fs::create_dir_all(&dir)?;
        Ok(EnvLoader { dir, resolver })
    }

    fn env_path(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{}.env", sanitize_name(scope)))
    }

    /// The stored variables for a scope; an absent file is an empty map.
    pub fn get_all(&self, scope: &str) -> Result<BTreeMap<String, String>> {
        let path = self.env_path(scope);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let mut vars = BTreeMap::new();
        for item in dotenvy::from_path_iter(&path)
            .map_err(|e| crate::error::Error::internal(format!("env file: {e}")))?
        {
            let (key, value) =
                item.map_err(|e| crate::error::Error::internal(format!("env file: {e}")))?;
            vars.insert(key, value);
        }
        Ok(vars)
    }

    pub async fn set(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        let mut vars = self.get_all(scope)?;
        vars.insert(key.to_string(), value.to_string());
        self.write(scope, &vars).await
    }

    pub async fn set_all(&self, scope: &str, vars: &BTreeMap<String, String>) -> Result<()> {
        self.write(scope, vars).await
    }

    pub async fn remove(&self, scope: &str, key: &str) -> Result<()> {
        let mut vars = self.get_all(scope)?;
        vars.remove(key);
        self.write(scope, &vars).await
    }

    pub async fn delete(&self, scope: &str) -> Result<()> {
        match fs::remove_file(self.env_path(scope)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Final environment for a deploy: the image's ENV entries are the
    /// baseline, stored variables win on key collision, and secret
    /// references in stored values are expanded. Returned as `KEY=VALUE`.
    pub async fn resolved_env(&self, scope: &str, image_env: &[String]) -> Result<Vec<String>> {
        let mut merged: BTreeMap<String, String> = image_env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        for (key, value) in self.get_all(scope)? {
            let resolved = self.resolver.resolve(&value).await?;
            merged.insert(key, resolved);
        }

        Ok(merged
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect())
    }

    async fn write(&self, scope: &str, vars: &BTreeMap<String, String>) -> Result<()> {
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}={}\n", quote_value(value)));
        }
        let path = self.env_path(scope);
        let tmp = path.with_extension("env.tmp");
        fs::write(&tmp, contents.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Values that would confuse the dotenv parser get quoted. Single quotes
/// keep `$` literal so stored secret references survive the round trip;
/// everything else gets double quotes with escapes.
fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\' | '$'));
    if !needs_quotes {
        return value.to_string();
    }
    if value.contains('$') && !value.contains('\'') {
        return format!("'{value}'");
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
