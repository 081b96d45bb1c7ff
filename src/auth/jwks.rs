//! JWKS cache for token issuers.
//!
//! Fetches `{issuer}/.well-known/jwks.json` and keeps one key set per issuer
//! for an hour. A failed fetch is never cached, so the next request retries
//! immediately.
//!
//! No lock is held while the fetch is in flight. Two concurrent refreshes for
//! the same issuer may both hit the network; the last one to finish wins.

use super::TokenError;
use crate::clock::Clock;
use jsonwebtoken::jwk::JwkSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

/// How long a fetched key set may be reused, in seconds.
pub const JWKS_CACHE_TTL_SECONDS: i64 = 3600;

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

struct CachedKeys {
    keys: Arc<JwkSet>,
    fetched_at: i64,
}

/// Issuer-keyed cache of signing-key sets.
pub struct JwksCache {
    http_client: reqwest::Client,
    entries: RwLock<HashMap<String, CachedKeys>>,
    ttl_seconds: i64,
    clock: Arc<dyn Clock>,
}

impl JwksCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(JWKS_FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to build JWKS HTTP client, using defaults");
                reqwest::Client::new()
            });

        Self {
            http_client,
            entries: RwLock::new(HashMap::new()),
            ttl_seconds: JWKS_CACHE_TTL_SECONDS,
            clock,
        }
    }

    /// Key set for `issuer`, fetched if missing or older than the TTL.
    ///
    /// # Errors
    ///
    /// Returns `TokenError::UpstreamUnavailable` when the issuer's JWKS cannot
    /// be fetched or parsed.
    #[instrument(skip(self))]
    pub async fn get_keys(&self, issuer: &str) -> Result<Arc<JwkSet>, TokenError> {
        let issuer = normalize_issuer(issuer);

        {
            let entries = self.entries.read().await;
            if let Some(cached) = entries.get(issuer) {
                let age = self.clock.now_unix() - cached.fetched_at;
                if age < self.ttl_seconds {
                    debug!(issuer, age, "JWKS cache hit");
                    return Ok(cached.keys.clone());
                }
                debug!(issuer, age, "JWKS cache entry stale");
            }
        }

        let keys = Arc::new(self.fetch(issuer).await?);

        let mut entries = self.entries.write().await;
        entries.insert(
            issuer.to_string(),
            CachedKeys {
                keys: keys.clone(),
                fetched_at: self.clock.now_unix(),
            },
        );

        Ok(keys)
    }

    async fn fetch(&self, issuer: &str) -> Result<JwkSet, TokenError> {
        let url = jwks_url(issuer);
        debug!(url = %url, "Fetching JWKS");

        let response = self.http_client.get(&url).send().await.map_err(|e| {
            error!(url = %url, error = %e, "Failed to fetch JWKS");
            TokenError::UpstreamUnavailable
        })?;

        if !response.status().is_success() {
            error!(url = %url, status = %response.status(), "JWKS endpoint returned error");
            return Err(TokenError::UpstreamUnavailable);
        }

        let keys: JwkSet = response.json().await.map_err(|e| {
            error!(url = %url, error = %e, "Failed to parse JWKS response");
            TokenError::UpstreamUnavailable
        })?;

        info!(issuer, key_count = keys.keys.len(), "JWKS cache refreshed");
        Ok(keys)
    }
}

/// Issuers compare equal with or without a trailing slash.
pub fn normalize_issuer(issuer: &str) -> &str {
    issuer.trim().trim_end_matches('/')
}

pub fn jwks_url(issuer: &str) -> String {
    format!("{}/.well-known/jwks.json", normalize_issuer(issuer))
}
