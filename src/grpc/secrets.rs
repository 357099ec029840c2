use std::sync::Arc;

use secrecy::ExposeSecret;
use tonic::{Request, Response, Status};

use crate::grpc::proto;
use crate::grpc::AuthService;
use crate::models::Token;
use crate::secrets::SecretResolver;

/// Token lifecycle plus direct secret lookup, gated by `admin:secrets:*`
/// scopes.
pub struct SecretsServer {
    auth: Arc<AuthService>,
    resolver: Arc<SecretResolver>,
}

impl SecretsServer {
    pub fn new(auth: Arc<AuthService>, resolver: Arc<SecretResolver>) -> SecretsServer {
        SecretsServer { auth, resolver }
    }
}

fn token_to_proto(token: Token) -> proto::TokenInfo {
    proto::TokenInfo {
        id: token.id,
        subject: token.subject,
        scopes: token.scopes,
        issued_at: token.issued_at.timestamp(),
        expires_at: token.expires_at.map_or(0, |t| t.timestamp()),
        revoked: token.revoked,
    }
}

#[tonic::async_trait]
impl proto::secrets_service_server::SecretsService for SecretsServer {
    async fn save_token(
        &self,
        request: Request<proto::SaveTokenRequest>,
    ) -> Result<Response<proto::SaveTokenResponse>, Status> {
        self.auth.authorize(&request, "secrets", "write")?;
        let req = request.into_inner();
        let ttl = (req.expires_in_seconds > 0).then_some(req.expires_in_seconds);
        let (token, secret) = self
            .auth
            .tokens()
            .save(&req.subject, req.scopes, ttl)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(proto::SaveTokenResponse {
            token: Some(token_to_proto(token)),
            secret: secret.expose_secret().clone(),
        }))
    }

    async fn get_token(
        &self,
        request: Request<proto::GetTokenRequest>,
    ) -> Result<Response<proto::GetTokenResponse>, Status> {
        self.auth.authorize(&request, "secrets", "read")?;
        let subject = request.into_inner().subject;
        let token = self.auth.tokens().get(&subject).map_err(Status::from)?;
        Ok(Response::new(proto::GetTokenResponse {
            token: Some(token_to_proto(token)),
        }))
    }

    async fn list_tokens(
        &self,
        request: Request<proto::ListTokensRequest>,
    ) -> Result<Response<proto::ListTokensResponse>, Status> {
        self.auth.authorize(&request, "secrets", "read")?;
        let tokens = self
            .auth
            .tokens()
            .list()
            .into_iter()
            .map(token_to_proto)
            .collect();
        Ok(Response::new(proto::ListTokensResponse { tokens }))
    }

    async fn revoke_token(
        &self,
        request: Request<proto::RevokeTokenRequest>,
    ) -> Result<Response<proto::RevokeTokenResponse>, Status> {
        self.auth.authorize(&request, "secrets", "write")?;
        let id = request.into_inner().id;
        self.auth.tokens().revoke(&id).await.map_err(Status::from)?;
        Ok(Response::new(proto::RevokeTokenResponse {}))
    }

    async fn delete_token(
        &self,
        request: Request<proto::DeleteTokenRequest>,
    ) -> Result<Response<proto::DeleteTokenResponse>, Status> {
        self.auth.authorize(&request, "secrets", "delete")?;
        let subject = request.into_inner().subject;
        self.auth.tokens().delete(&subject).await.map_err(Status::from)?;
        Ok(Response::new(proto::DeleteTokenResponse {}))
    }

    async fn fetch_secret(
        &self,
        request: Request<proto::FetchSecretRequest>,
    ) -> Result<Response<proto::FetchSecretResponse>, Status> {
        self.auth.authorize(&request, "secrets", "read")?;
        let req = request.into_inner();
        let provider = self
            .resolver
            .provider(&req.provider)
            .ok_or_else(|| Status::invalid_argument(format!("unknown provider: {}", req.provider)))?;
        let value = provider.get_secret(&req.path).await.map_err(Status::from)?;
        Ok(Response::new(proto::FetchSecretResponse {
            value: value.expose_secret().clone(),
        }))
    }
}
