//! Request validation: language allow-list, upload size and OCR mode.
//!
//! Nothing here looks at file contents; dimension clamping lives in
//! `ocr::preprocess`.

use crate::config::Settings;
use crate::errors::ApiError;
use serde::Serialize;
use serde_json::json;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;

/// What the OCR collaborator is asked to do with an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrMode {
    Recognition,
    Parsing,
    Extraction,
}

impl OcrMode {
    pub const ALL: [OcrMode; 3] = [OcrMode::Recognition, OcrMode::Parsing, OcrMode::Extraction];

    pub const fn as_str(&self) -> &'static str {
        match self {
            OcrMode::Recognition => "recognition",
            OcrMode::Parsing => "parsing",
            OcrMode::Extraction => "extraction",
        }
    }

    /// Parse a form value; absent or blank means recognition.
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        let normalized = raw.map(|m| m.trim().to_lowercase()).unwrap_or_default();
        if normalized.is_empty() {
            return Ok(OcrMode::Recognition);
        }
        OcrMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == normalized)
            .ok_or_else(|| {
                ApiError::bad_request(
                    "Unsupported mode",
                    json!({
                        "mode": normalized,
                        "allowed": OcrMode::ALL.iter().map(OcrMode::as_str).collect::<Vec<_>>(),
                    }),
                )
            })
    }
}

#[derive(Debug, Clone)]
pub struct RequestValidator {
    allowed_langs: Vec<String>,
    default_lang: String,
    max_file_bytes: u64,
}

impl RequestValidator {
    pub fn new(allowed_langs: Vec<String>, default_lang: String, max_file_bytes: u64) -> Self {
        Self {
            allowed_langs,
            default_lang,
            max_file_bytes,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.allowed_langs.clone(),
            settings.default_lang.clone(),
            settings.max_file_bytes(),
        )
    }

    pub fn allowed_langs(&self) -> &[String] {
        &self.allowed_langs
    }

    pub fn default_lang(&self) -> &str {
        &self.default_lang
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_bytes
    }

    /// Trim and lowercase the requested language, falling back to the default
    /// when none is given.
    ///
    /// # Errors
    ///
    /// `BadRequest` listing the allowed set when an allow-list is configured
    /// and the language is not in it.
    pub fn normalize_lang(&self, requested: Option<&str>) -> Result<String, ApiError> {
        let lang = requested
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.default_lang.clone());

        if self.allowed_langs.is_empty() || self.allowed_langs.contains(&lang) {
            Ok(lang)
        } else {
            Err(ApiError::bad_request(
                "Unsupported language code",
                json!({ "lang": lang, "allowed": self.allowed_langs }),
            ))
        }
    }

    /// Reject a size hint above the limit. No hint is not an error.
    pub fn check_size(&self, declared: Option<u64>) -> Result<(), ApiError> {
        match declared {
            Some(size) if size > self.max_file_bytes => Err(ApiError::PayloadTooLarge {
                size: Some(size),
                limit: self.max_file_bytes,
            }),
            _ => Ok(()),
        }
    }
}

/// Parse the optional `confidence_threshold` form field.
pub fn parse_confidence(raw: Option<&str>) -> Result<f32, ApiError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(DEFAULT_CONFIDENCE_THRESHOLD);
    };
    match raw.parse::<f32>() {
        Ok(value) if (0.0..=1.0).contains(&value) => Ok(value),
        _ => Err(ApiError::validation(
            "confidence_threshold",
            "ensure this value is a number between 0.0 and 1.0",
        )),
    }
}
