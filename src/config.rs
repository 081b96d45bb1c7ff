//! Service configuration.
//!
//! Settings are read once at startup from the process environment (after
//! `dotenvy` has loaded an optional `.env` file). Parsing goes through a lookup
//! closure so tests never touch the real environment.

use anyhow::{Context, Result};

const DEFAULT_ALLOWED_LANGS: &[&str] = &["ch", "en", "french", "german", "korean", "japan"];
const DEFAULT_LANG: &str = "korean";
const DEFAULT_MODEL: &str = "pp-ocrv5";
const DEFAULT_MAX_FILE_MB: u64 = 10;
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

/// Runtime settings for the gateway.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Raw auth mode string; validated by `AuthGateway::from_settings`.
    pub auth_mode: String,
    pub api_key: Option<String>,
    pub cognito_issuer: Option<String>,
    pub cognito_audience: Option<String>,
    /// Ordered language allow-list. Empty means every language is accepted.
    pub allowed_langs: Vec<String>,
    pub max_file_mb: u64,
    pub default_lang: String,
    pub model_default: String,
    /// Base URL of the OCR sidecar. `None` runs the stub engine.
    pub ocr_backend_url: Option<String>,
    pub bind_addr: String,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Empty values are treated as unset, like an exported-but-blank variable.
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let allowed_langs = match var("ALLOWED_LANGS") {
            Some(raw) => parse_list(&raw),
            None => DEFAULT_ALLOWED_LANGS.iter().map(|s| s.to_string()).collect(),
        };

        let max_file_mb = match var("MAX_FILE_MB") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("MAX_FILE_MB must be a whole number of megabytes, got {:?}", raw))?,
            None => DEFAULT_MAX_FILE_MB,
        };

        Ok(Self {
            auth_mode: var("AUTH_MODE").unwrap_or_else(|| "api-key".to_string()),
            api_key: var("API_KEY"),
            cognito_issuer: var("COGNITO_ISSUER"),
            cognito_audience: var("COGNITO_AUDIENCE"),
            allowed_langs,
            max_file_mb,
            default_lang: var("DEFAULT_LANG")
                .map(|l| l.to_lowercase())
                .unwrap_or_else(|| DEFAULT_LANG.to_string()),
            model_default: var("MODEL_DEFAULT").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            ocr_backend_url: var("OCR_BACKEND_URL").map(|u| u.trim_end_matches('/').to_string()),
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
        })
    }

    /// Maximum accepted size of a single uploaded file, in bytes.
    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb.saturating_mul(1024 * 1024)
    }
}

/// Split a comma separated list, normalising each entry to trimmed lowercase.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
