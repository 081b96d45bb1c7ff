//! Uniform response envelope.
//!
//! Every handler answers with `{success, result, error, meta}`. `ok` and
//! `fail` are the only constructors, so exactly one of `result` / `error` is
//! populated and it always agrees with `success`.

use crate::errors::ErrorCode;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Meta = serde_json::Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub details: Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    success: bool,
    result: Option<Value>,
    error: Option<ErrorBody>,
    meta: Meta,
}

impl Envelope {
    /// Successful outcome. A `null` result is stored as `{}`.
    pub fn ok(result: Value, meta: Meta) -> Self {
        let result = match result {
            Value::Null => Value::Object(Meta::new()),
            other => other,
        };
        Self {
            success: true,
            result: Some(result),
            error: None,
            meta,
        }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>, details: Meta, meta: Meta) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
                details,
            }),
            meta,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorBody> {
        self.error.as_ref()
    }

    /// HTTP status, derived from the error code alone.
    pub fn status(&self) -> StatusCode {
        self.error
            .as_ref()
            .map(|e| e.code.status())
            .unwrap_or(StatusCode::OK)
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn consistent(value: &Value) -> bool {
        let success = value["success"].as_bool().unwrap();
        success == !value["result"].is_null() && success == value["error"].is_null()
    }

    #[test]
    fn test_ok_shape() {
        let env = Envelope::ok(json!({"text": "hello"}), Meta::new());
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["result"]["text"], json!("hello"));
        assert!(value["error"].is_null());
        assert_eq!(value["meta"], json!({}));
        assert!(consistent(&value));
        assert_eq!(env.status(), StatusCode::OK);
    }

    #[test]
    fn test_ok_null_result_becomes_object() {
        let env = Envelope::ok(Value::Null, Meta::new());
        assert_eq!(env.result(), Some(&json!({})));
    }

    #[test]
    fn test_fail_shape() {
        let mut details = Meta::new();
        details.insert("allowed".to_string(), json!(["en"]));
        let env = Envelope::fail(ErrorCode::BadRequest, "Unsupported language code", details, Meta::new());
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["success"], json!(false));
        assert!(value["result"].is_null());
        assert_eq!(value["error"]["code"], json!("BadRequest"));
        assert_eq!(value["error"]["details"]["allowed"], json!(["en"]));
        assert!(consistent(&value));
        assert_eq!(env.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_follows_code() {
        for code in [
            ErrorCode::InvalidApiKey,
            ErrorCode::PayloadTooLarge,
            ErrorCode::ValidationError,
            ErrorCode::InternalServerError,
        ] {
            let env = Envelope::fail(code, "x", Meta::new(), Meta::new());
            assert_eq!(env.status(), code.status());
        }
    }
}
