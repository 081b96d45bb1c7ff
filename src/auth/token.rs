//! Bearer token verification against an issuer's JWKS.
//!
//! Checks run in a fixed order and each maps to its own `TokenError`:
//!
//! 1. compact three-segment structure and `kid` header (`MalformedToken`)
//! 2. `kid` present in the issuer's key set (`UnknownKey`)
//! 3. signature over `header.payload` (`BadSignature`)
//! 4. `iss` equals the expected issuer, trailing slash ignored (`IssuerMismatch`)
//! 5. expected audience is a member of `aud` (`AudienceMismatch`)
//! 6. `exp` not in the past (`TokenExpired`)
//!
//! Claims are only decoded once the signature has been verified.

use super::jwks::{normalize_issuer, JwksCache};
use super::TokenError;
use crate::clock::Clock;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{crypto, decode_header, Algorithm, DecodingKey};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Tokens larger than this are rejected before any parsing.
const MAX_TOKEN_BYTES: usize = 8 * 1024;

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    /// Strict membership: a scalar must match exactly, an array must contain
    /// the value as an element.
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::One(aud) => aud == expected,
            Audience::Many(auds) => auds.iter().any(|aud| aud == expected),
        }
    }
}

/// Claims consulted by the gateway. Everything else in the payload is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<Audience>,
    /// NumericDate; may carry a fractional part.
    #[serde(default)]
    pub exp: Option<f64>,
}

/// Verifies bearer tokens with keys from a shared [`JwksCache`].
pub struct TokenVerifier {
    jwks: Arc<JwksCache>,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    pub fn new(jwks: Arc<JwksCache>, clock: Arc<dyn Clock>) -> Self {
        Self { jwks, clock }
    }

    /// Verify `token` as issued by `issuer`, optionally for `audience`.
    ///
    /// # Errors
    ///
    /// Returns the `TokenError` of the first check that fails, or
    /// `UpstreamUnavailable` if the issuer's keys cannot be fetched.
    #[instrument(skip_all, fields(issuer = %issuer))]
    pub async fn verify(
        &self,
        token: &str,
        issuer: &str,
        audience: Option<&str>,
    ) -> Result<TokenClaims, TokenError> {
        // 1. Structure and header, without trusting anything yet.
        let (signing_input, payload_b64, signature_b64) = split_compact(token)?;
        let header = decode_header(token).map_err(|e| {
            debug!(error = %e, "Token header could not be decoded");
            TokenError::MalformedToken
        })?;
        if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            debug!(alg = ?header.alg, "Symmetric algorithm cannot be verified against a JWKS");
            return Err(TokenError::MalformedToken);
        }
        let kid = header.kid.ok_or_else(|| {
            debug!("Token header has no kid");
            TokenError::MalformedToken
        })?;

        // 2. Key lookup.
        let keys = self.jwks.get_keys(issuer).await?;
        let jwk = keys.find(&kid).ok_or_else(|| {
            warn!(kid = %kid, "Token kid not present in issuer JWKS");
            TokenError::UnknownKey
        })?;

        // 3. Signature.
        let decoding_key = DecodingKey::from_jwk(jwk).map_err(|e| {
            warn!(kid = %kid, error = %e, "JWK cannot be used as a verification key");
            TokenError::BadSignature
        })?;
        match crypto::verify(signature_b64, signing_input.as_bytes(), &decoding_key, header.alg) {
            Ok(true) => {}
            Ok(false) => {
                warn!(kid = %kid, "Token signature verification failed");
                return Err(TokenError::BadSignature);
            }
            Err(e) => {
                warn!(kid = %kid, error = %e, "Token signature could not be checked");
                return Err(TokenError::BadSignature);
            }
        }

        // 4. Claims are trustworthy from here on.
        let claims = decode_claims(payload_b64)?;
        let token_issuer = claims.iss.as_deref().map(normalize_issuer);
        if token_issuer != Some(normalize_issuer(issuer)) {
            warn!(token_iss = ?claims.iss, "Token issuer mismatch");
            return Err(TokenError::IssuerMismatch);
        }

        // 5. Audience.
        if let Some(expected) = audience {
            let matched = claims
                .aud
                .as_ref()
                .map(|aud| aud.contains(expected))
                .unwrap_or(false);
            if !matched {
                warn!(token_aud = ?claims.aud, expected, "Token audience mismatch");
                return Err(TokenError::AudienceMismatch);
            }
        }

        // 6. Expiry. A token without `exp` is treated as long expired.
        let now = self.clock.now_unix();
        let exp = claims.exp.unwrap_or(0.0);
        if now as f64 > exp {
            debug!(exp, now, "Token expired");
            return Err(TokenError::TokenExpired);
        }

        debug!(sub = ?claims.sub, "Token verified");
        Ok(claims)
    }
}

/// Split a compact JWS into (`header.payload`, payload, signature).
fn split_compact(token: &str) -> Result<(&str, &str, &str), TokenError> {
    if token.len() > MAX_TOKEN_BYTES {
        debug!(len = token.len(), "Token exceeds size limit");
        return Err(TokenError::MalformedToken);
    }

    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None)
            if !header.is_empty() && !payload.is_empty() && !signature.is_empty() =>
        {
            let signing_input = &token[..header.len() + 1 + payload.len()];
            Ok((signing_input, payload, signature))
        }
        _ => {
            debug!("Token is not in compact three-segment form");
            Err(TokenError::MalformedToken)
        }
    }
}

fn decode_claims(payload_b64: &str) -> Result<TokenClaims, TokenError> {
    let bytes = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|e| {
        debug!(error = %e, "Token payload is not base64url");
        TokenError::MalformedToken
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        debug!(error = %e, "Token payload is not a claims object");
        TokenError::MalformedToken
    })
}
