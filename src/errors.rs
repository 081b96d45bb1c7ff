//! Error taxonomy for the HTTP surface.
//!
//! `ErrorCode::status` is the only place an HTTP status is chosen for a
//! failure. Handlers return `ApiError`, which renders through
//! `Envelope::fail`.

use crate::auth::{AuthError, TokenError};
use crate::envelope::{Envelope, Meta};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

/// Stable wire codes for `error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "InvalidAPIKey")]
    InvalidApiKey,
    MissingAuthorization,
    InvalidToken,
    ServerMisconfigured,
    UnsupportedAuthMode,
    BadRequest,
    PayloadTooLarge,
    ValidationError,
    NotFound,
    MethodNotAllowed,
    InternalServerError,
}

impl ErrorCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidApiKey => "InvalidAPIKey",
            ErrorCode::MissingAuthorization => "MissingAuthorization",
            ErrorCode::InvalidToken => "InvalidToken",
            ErrorCode::ServerMisconfigured => "ServerMisconfigured",
            ErrorCode::UnsupportedAuthMode => "UnsupportedAuthMode",
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::PayloadTooLarge => "PayloadTooLarge",
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::MethodNotAllowed => "MethodNotAllowed",
            ErrorCode::InternalServerError => "InternalServerError",
        }
    }

    pub const fn status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidApiKey | ErrorCode::MissingAuthorization | ErrorCode::InvalidToken => {
                StatusCode::UNAUTHORIZED
            }
            ErrorCode::ServerMisconfigured
            | ErrorCode::UnsupportedAuthMode
            | ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

/// One entry of a `ValidationError` field list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub loc: Vec<String>,
    pub msg: String,
}

impl FieldError {
    pub fn body(field: &str, msg: impl Into<String>) -> Self {
        Self {
            loc: vec!["body".to_string(), field.to_string()],
            msg: msg.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{message}")]
    BadRequest { message: String, details: Meta },

    /// `size` is unknown when the body limit trips before the file is read.
    #[error("upload exceeds the {limit} byte limit")]
    PayloadTooLarge { size: Option<u64>, limit: u64 },

    #[error("Request validation failed")]
    Validation(Vec<FieldError>),

    #[error("Not found")]
    NotFound,

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>, details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            _ => Meta::new(),
        };
        ApiError::BadRequest {
            message: message.into(),
            details,
        }
    }

    pub fn validation(field: &str, msg: impl Into<String>) -> Self {
        ApiError::Validation(vec![FieldError::body(field, msg)])
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::Auth(AuthError::InvalidApiKey) => ErrorCode::InvalidApiKey,
            ApiError::Auth(AuthError::MissingAuthorization) => ErrorCode::MissingAuthorization,
            ApiError::Auth(AuthError::InvalidToken(_)) => ErrorCode::InvalidToken,
            ApiError::Auth(AuthError::ServerMisconfigured(_)) => ErrorCode::ServerMisconfigured,
            ApiError::Auth(AuthError::UnsupportedAuthMode(_)) => ErrorCode::UnsupportedAuthMode,
            ApiError::BadRequest { .. } => ErrorCode::BadRequest,
            ApiError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            ApiError::Validation(_) => ErrorCode::ValidationError,
            ApiError::NotFound => ErrorCode::NotFound,
            ApiError::MethodNotAllowed => ErrorCode::MethodNotAllowed,
            ApiError::Internal(_) => ErrorCode::InternalServerError,
        }
    }

    /// Render as a failure envelope carrying `meta`.
    pub fn into_envelope(self, meta: Meta) -> Envelope {
        let code = self.code();
        let (message, details) = match self {
            ApiError::Auth(AuthError::InvalidToken(cause)) => {
                (AuthError::InvalidToken(cause).to_string(), reason_details(cause))
            }
            // Operator faults are logged, not explained to the client.
            ApiError::Auth(err @ AuthError::ServerMisconfigured(_))
            | ApiError::Auth(err @ AuthError::UnsupportedAuthMode(_)) => {
                error!(error = %err, "Authentication misconfigured");
                ("Server authentication is misconfigured".to_string(), Meta::new())
            }
            ApiError::Auth(err) => (err.to_string(), Meta::new()),
            ApiError::BadRequest { message, details } => (message, details),
            ApiError::PayloadTooLarge { size, limit } => {
                let mut details = Meta::new();
                if let Some(size) = size {
                    details.insert("size_bytes".to_string(), json!(size));
                }
                details.insert("limit_bytes".to_string(), json!(limit));
                ("Payload too large".to_string(), details)
            }
            ApiError::Validation(errors) => {
                let mut details = Meta::new();
                details.insert("errors".to_string(), json!(errors));
                ("Request validation failed".to_string(), details)
            }
            ApiError::NotFound => ("Not found".to_string(), Meta::new()),
            ApiError::MethodNotAllowed => ("Method not allowed".to_string(), Meta::new()),
            ApiError::Internal(err) => {
                error!(error = %err, "Unhandled internal error");
                ("Unexpected error".to_string(), Meta::new())
            }
        };
        Envelope::fail(code, message, details, meta)
    }
}

fn reason_details(cause: TokenError) -> Meta {
    let mut details = Meta::new();
    details.insert("reason".to_string(), json!(cause.reason()));
    details
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_envelope(Meta::new()).into_response()
    }
}
