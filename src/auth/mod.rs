//! Request authentication.
//!
//! The gateway runs in one of two modes chosen at startup:
//!
//! - `api-key`: compare the `x-api-key` header with the configured key. With
//!   no key configured every request is allowed (local/dev use).
//! - token (`cognito`): require `Authorization: Bearer <token>` and verify it
//!   against the configured issuer's JWKS.
//!
//! [`require_auth`] is installed as a route layer on protected routes, so it
//! runs before any body extraction.

pub mod jwks;
pub mod token;

#[cfg(test)]
pub(crate) mod test_keys;

use crate::clock::Clock;
use crate::config::Settings;
use crate::errors::ApiError;
use crate::routes::request_meta;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use jwks::JwksCache;
use std::sync::Arc;
use token::TokenVerifier;
use tracing::{debug, error, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Why a bearer token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is not a well-formed compact JWT")]
    MalformedToken,
    #[error("token key id is not published by the issuer")]
    UnknownKey,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token issuer does not match")]
    IssuerMismatch,
    #[error("token audience does not match")]
    AudienceMismatch,
    #[error("token has expired")]
    TokenExpired,
    #[error("issuer signing keys could not be fetched")]
    UpstreamUnavailable,
}

impl TokenError {
    /// Stable name reported in `error.details.reason`.
    pub const fn reason(&self) -> &'static str {
        match self {
            TokenError::MalformedToken => "MalformedToken",
            TokenError::UnknownKey => "UnknownKey",
            TokenError::BadSignature => "BadSignature",
            TokenError::IssuerMismatch => "IssuerMismatch",
            TokenError::AudienceMismatch => "AudienceMismatch",
            TokenError::TokenExpired => "TokenExpired",
            TokenError::UpstreamUnavailable => "UpstreamUnavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid API key")]
    InvalidApiKey,
    #[error("Missing Authorization header")]
    MissingAuthorization,
    #[error("Invalid token")]
    InvalidToken(#[from] TokenError),
    #[error("Server authentication is misconfigured: {0}")]
    ServerMisconfigured(String),
    #[error("Unsupported AUTH_MODE: {0}")]
    UnsupportedAuthMode(String),
}

/// Authentication mode, fixed for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey {
        key: Option<String>,
    },
    Token {
        issuer: Option<String>,
        audience: Option<String>,
    },
}

impl AuthMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuthMode::ApiKey { .. } => "api-key",
            AuthMode::Token { .. } => "token",
        }
    }

    /// Resolve the configured mode.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnsupportedAuthMode` for an unknown mode string.
    pub fn from_settings(settings: &Settings) -> Result<Self, AuthError> {
        match settings.auth_mode.trim().to_lowercase().as_str() {
            "api-key" | "apikey" | "api_key" => Ok(AuthMode::ApiKey {
                key: settings.api_key.clone(),
            }),
            "cognito" | "token" | "bearer" => Ok(AuthMode::Token {
                issuer: settings.cognito_issuer.clone(),
                audience: settings.cognito_audience.clone(),
            }),
            other => Err(AuthError::UnsupportedAuthMode(other.to_string())),
        }
    }
}

/// Outcome of authenticating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(AuthError),
}

pub struct AuthGateway {
    mode: AuthMode,
    verifier: TokenVerifier,
}

impl AuthGateway {
    pub fn new(mode: AuthMode, verifier: TokenVerifier) -> Self {
        match &mode {
            AuthMode::ApiKey { key: None } => {
                warn!("AUTH_MODE=api-key without API_KEY: all requests are allowed")
            }
            AuthMode::Token { issuer: None, .. } => {
                error!("Token auth selected but COGNITO_ISSUER is not set: all requests will be rejected")
            }
            _ => {}
        }
        Self { mode, verifier }
    }

    /// Build the gateway, failing fast on an unsupported mode.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::UnsupportedAuthMode` if `AUTH_MODE` is unknown.
    pub fn from_settings(settings: &Settings, clock: Arc<dyn Clock>) -> Result<Self, AuthError> {
        let mode = AuthMode::from_settings(settings)?;
        let jwks = Arc::new(JwksCache::new(clock.clone()));
        Ok(Self::new(mode, TokenVerifier::new(jwks, clock)))
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    pub async fn authorize(&self, headers: &HeaderMap) -> AuthDecision {
        match self.check(headers).await {
            Ok(()) => AuthDecision::Allow,
            Err(err) => AuthDecision::Deny(err),
        }
    }

    async fn check(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        match &self.mode {
            AuthMode::ApiKey { key: None } => Ok(()),
            AuthMode::ApiKey { key: Some(expected) } => {
                let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
                if presented == Some(expected.as_str()) {
                    Ok(())
                } else {
                    Err(AuthError::InvalidApiKey)
                }
            }
            AuthMode::Token { issuer: None, .. } => Err(AuthError::ServerMisconfigured(
                "token issuer not configured".to_string(),
            )),
            AuthMode::Token {
                issuer: Some(issuer),
                audience,
            } => {
                let token = bearer_token(headers).ok_or(AuthError::MissingAuthorization)?;
                self.verifier
                    .verify(token, issuer, audience.as_deref())
                    .await?;
                Ok(())
            }
        }
    }
}

/// Extract `<token>` from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Route layer: deny unauthenticated requests before the handler runs.
pub async fn require_auth(
    State(gateway): State<Arc<AuthGateway>>,
    req: Request,
    next: Next,
) -> Response {
    match gateway.authorize(req.headers()).await {
        AuthDecision::Allow => next.run(req).await,
        AuthDecision::Deny(err) => {
            match &err {
                AuthError::InvalidToken(TokenError::UpstreamUnavailable) => {
                    error!(path = %req.uri().path(), "Rejecting request: issuer keys unavailable")
                }
                AuthError::ServerMisconfigured(_) | AuthError::UnsupportedAuthMode(_) => {
                    error!(path = %req.uri().path(), error = %err, "Rejecting request: auth misconfigured")
                }
                _ => debug!(path = %req.uri().path(), error = %err, "Rejecting unauthenticated request"),
            }
            let meta = request_meta(req.headers());
            ApiError::from(err).into_envelope(meta).into_response()
        }
    }
}
