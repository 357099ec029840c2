use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An admin token. Only the SHA-256 hash of the secret is persisted; the
/// secret itself is returned once at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub subject: String,
    pub scopes: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
    pub token_hash: String,
}

impl Token {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// At least one `admin:` scope is required to reach the admin surface.
    pub fn has_admin_scope(&self) -> bool {
        self.scopes.iter().any(|s| s.starts_with("admin:"))
    }

    /// Checks `admin:<resource>:<action>`, honoring `admin:*` and
    /// `admin:<resource>:*` wildcards.
    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.scopes.iter().any(|scope| {
            scope == "admin:*"
                || scope == &format!("admin:{resource}:*")
                || scope == &format!("admin:{resource}:{action}")
        })
    }
}
