use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::Engine;
use chrono::{Duration, Utc};
use rand::RngCore;
use secrecy::Secret;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Token;
use crate::storage::paths::sanitize_name;

const REVOKED_FILE: &str = "revoked.json";

/// File-backed admin token store with an in-memory index for synchronous
/// validation on the request path.
///
/// Tokens live at `secrets/gordon/registry/tokens/<subject>.json`; the
/// revocation list is a set of token IDs in `revoked.json`.
pub struct TokenStore {
    dir: PathBuf,
    index: RwLock<Index>,
}

#[derive(Default)]
struct Index {
    by_subject: HashMap<String, Token>,
    hash_to_subject: HashMap<String, String>,
    revoked: HashSet<String>,
}

impl TokenStore {
    /// Opens the store under `<data_dir>/secrets/gordon/registry`, loading
    /// every persisted token and the revocation list.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<TokenStore> {
        let dir = data_dir.as_ref().join("secrets").join("gordon").join("registry");
        std::fs::create_dir_all(dir.join("tokens"))?;

        let mut index = Index::default();
        if let Ok(raw) = std::fs::read(dir.join(REVOKED_FILE)) {
            index.revoked = serde_json::from_slice(&raw)
                .map_err(|e| Error::internal(format!("revocation list: {e}")))?;
        }
        for entry in std::fs::read_dir(dir.join("tokens"))? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read(entry.path())?;
            match serde_json::from_slice::<Token>(&raw) {
                Ok(token) => index.insert(token),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable token file"),
            }
        }

        Ok(TokenStore {
            dir,
            index: RwLock::new(index),
        })
    }

    /// Issues a token for `subject`, replacing any previous one. The secret
    /// is returned exactly once; only its SHA-256 lands on disk.
    pub async fn save(
        &self,
        subject: &str,
        scopes: Vec<String>,
        ttl_seconds: Option<i64>,
    ) -> Result<(Token, Secret<String>)> {
        if subject.is_empty() {
            return Err(Error::invalid("token subject is empty"));
        }
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let secret = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);

        let now = Utc::now();
        let token = Token {
            id: Uuid::new_v4().to_string(),
            subject: subject.to_string(),
            scopes,
            issued_at: now,
            expires_at: ttl_seconds.map(|s| now + Duration::seconds(s)),
            revoked: false,
            token_hash: hash_secret(&secret),
        };

        let path = self.token_path(subject);
        let serialized = serde_json::to_vec_pretty(&token)
            .map_err(|e| Error::internal(format!("serialize token: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.index.write().expect("token index poisoned").insert(token.clone());
        tracing::info!(subject, token_id = token.id, "token issued");
        Ok((token, Secret::new(secret)))
    }

    pub fn get(&self, subject: &str) -> Result<Token> {
        let index = self.index.read().expect("token index poisoned");
        index
            .by_subject
            .get(subject)
            .map(|t| index.with_revocation(t))
            .ok_or_else(|| Error::NotFound(format!("token for {subject}")))
    }

    pub fn list(&self) -> Vec<Token> {
        let index = self.index.read().expect("token index poisoned");
        let mut tokens: Vec<Token> = index
            .by_subject
            .values()
            .map(|t| index.with_revocation(t))
            .collect();
        tokens.sort_by(|a, b| a.subject.cmp(&b.subject));
        tokens
    }

    /// Adds the token ID to the revocation set and persists it.
    pub async fn revoke(&self, id: &str) -> Result<()> {
        let revoked = {
            let mut index = self.index.write().expect("token index poisoned");
            if !index.by_subject.values().any(|t| t.id == id) {
                return Err(Error::NotFound(format!("token {id}")));
            }
            index.revoked.insert(id.to_string());
            index.revoked.clone()
        };
        let serialized = serde_json::to_vec_pretty(&revoked)
            .map_err(|e| Error::internal(format!("serialize revocation list: {e}")))?;
        let path = self.dir.join(REVOKED_FILE);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(token_id = id, "token revoked");
        Ok(())
    }

    pub async fn delete(&self, subject: &str) -> Result<()> {
        {
            let mut index = self.index.write().expect("token index poisoned");
            let token = index
                .by_subject
                .remove(subject)
                .ok_or_else(|| Error::NotFound(format!("token for {subject}")))?;
            index.hash_to_subject.remove(&token.token_hash);
        }
        match tokio::fs::remove_file(self.token_path(subject)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Validates a presented secret. Synchronous so callers on the request
    /// path never block on disk.
    pub fn validate(&self, secret: &str) -> Result<Token> {
        let hash = hash_secret(secret);
        let index = self.index.read().expect("token index poisoned");
        let subject = index
            .hash_to_subject
            .get(&hash)
            .ok_or_else(|| Error::Unauthenticated("unknown token".into()))?;
        let token = index
            .by_subject
            .get(subject)
            .ok_or_else(|| Error::Unauthenticated("unknown token".into()))?;
        if index.revoked.contains(&token.id) {
            return Err(Error::Unauthenticated("token revoked".into()));
        }
        if token.is_expired(Utc::now()) {
            return Err(Error::Unauthenticated("token expired".into()));
        }
        Ok(index.with_revocation(token))
    }

    fn token_path(&self, subject: &str) -> PathBuf {
        self.dir
            .join("tokens")
            .join(format!("{}.json", sanitize_name(subject)))
    }
}

impl Index {
    fn insert(&mut self, token: Token) {
        if let Some(previous) = self.by_subject.get(&token.subject) {
            self.hash_to_subject.remove(&previous.token_hash);
        }
        self.hash_to_subject
            .insert(token.token_hash.clone(), token.subject.clone());
        self.by_subject.insert(token.subject.clone(), token);
    }

    fn with_revocation(&self, token: &Token) -> Token {
        let mut token = token.clone();
        token.revoked = self.revoked.contains(&token.id);
        token
    }
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
