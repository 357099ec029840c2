use std::sync::Arc;

use constant_time_eq::constant_time_eq;
use secrecy::{ExposeSecret, Secret};
use tonic::{Request, Status};

use crate::secrets::TokenStore;

/// Identity attached to an authenticated admin request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub scopes: Vec<String>,
    pub token_id: String,
}

impl AuthContext {
    /// `admin:<resource>:<action>` with `admin:*` and `admin:<resource>:*`
    /// wildcards.
    pub fn allows(&self, resource: &str, action: &str) -> bool {
        self.scopes.iter().any(|scope| {
            scope == "admin:*"
                || scope == &format!("admin:{resource}:*")
                || scope == &format!("admin:{resource}:{action}")
        })
    }
}

/// Bearer-token authentication for the admin and secrets services. Every
/// guarded method extracts `authorization: Bearer <token>`, requires at
/// least one `admin:` scope, and then checks the per-operation scope.
/// `AuthenticatePassword` is the single unauthenticated entry point.
pub struct AuthService {
    tokens: Arc<TokenStore>,
    admin_password: Option<Secret<String>>,
}

impl AuthService {
    pub fn new(tokens: Arc<TokenStore>, admin_password: Option<Secret<String>>) -> AuthService {
        AuthService {
            tokens,
            admin_password,
        }
    }

    /// Reads the bootstrap password from `GORDON_ADMIN_PASSWORD`.
    pub fn from_env(tokens: Arc<TokenStore>) -> AuthService {
        let admin_password = std::env::var("GORDON_ADMIN_PASSWORD").ok().map(Secret::new);
        AuthService::new(tokens, admin_password)
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn authenticate<T>(&self, request: &Request<T>) -> Result<AuthContext, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization"))?;
        let secret = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Status::unauthenticated("expected bearer token"))?;

        let token = self.tokens.validate(secret).map_err(Status::from)?;
        if !token.has_admin_scope() {
            return Err(Status::permission_denied("admin scope required"));
        }
        Ok(AuthContext {
            subject: token.subject,
            scopes: token.scopes,
            token_id: token.id,
        })
    }

    pub fn check_access(
        &self,
        ctx: &AuthContext,
        resource: &str,
        action: &str,
    ) -> Result<(), Status> {
        if ctx.allows(resource, action) {
            Ok(())
        } else {
            Err(Status::permission_denied(format!(
                "scope admin:{resource}:{action} required"
            )))
        }
    }

    /// Guard plus per-operation scope check in one step.
    pub fn authorize<T>(
        &self,
        request: &Request<T>,
        resource: &str,
        action: &str,
    ) -> Result<AuthContext, Status> {
        let ctx = self.authenticate(request)?;
        self.check_access(&ctx, resource, action)?;
        Ok(ctx)
    }

    pub fn verify_password(&self, candidate: &str) -> Result<(), Status> {
        let expected = self
            .admin_password
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("password authentication is not configured"))?;
        if constant_time_eq(expected.expose_secret().as_bytes(), candidate.as_bytes()) {
            Ok(())
        } else {
            Err(Status::unauthenticated("invalid password"))
        }
    }
}
