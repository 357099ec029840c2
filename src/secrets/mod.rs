pub mod providers;
pub mod tokens;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};

use crate::error::{Error, Result};

pub use providers::{EnvProvider, FileProvider, PassProvider, SopsProvider};
pub use tokens::TokenStore;

/// A secret backend. The set is closed (`env`, `file`, `pass`, `sops`) and
/// selected at startup; lookups happen at deploy time.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn is_available(&self) -> bool;
    async fn get_secret(&self, path: &str) -> Result<Secret<String>>;
}

/// Resolves `${provider:path}` references inside configuration and env
/// values. Values without references pass through untouched.
#[derive(Default)]
pub struct SecretResolver {
    providers: HashMap<String, Arc<dyn SecretProvider>>,
}

impl SecretResolver {
    pub fn new() -> SecretResolver {
        SecretResolver::default()
    }

    pub fn register(&mut self, provider: Arc<dyn SecretProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn SecretProvider>> {
        self.providers.get(name).cloned()
    }

    /// Expands every `${provider:path}` occurrence in `value`. An unknown
    /// provider or an unterminated reference is an error; deploys must not
    /// start with half-resolved environments.
    pub async fn resolve(&self, value: &str) -> Result<String> {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| Error::invalid("unterminated secret reference"))?;
            let reference = &after[..end];
            let (provider_name, path) = reference
                .split_once(':')
                .ok_or_else(|| Error::invalid(format!("malformed secret reference: {reference}")))?;
            let provider = self
                .providers
                .get(provider_name)
                .ok_or_else(|| Error::invalid(format!("unknown secret provider: {provider_name}")))?;
            let secret = provider.get_secret(path).await?;
            out.push_str(secret.expose_secret());
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
