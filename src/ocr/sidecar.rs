//! HTTP OCR sidecar backend.
//!
//! The sidecar wraps the OCR model behind four endpoints:
//! `POST /recognize`, `POST /structure`, `POST /extract` (multipart `file`,
//! `lang`, `model`) and `GET /status`.

use super::{ExtractionResult, OcrBackend, OcrError, OcrInput, RecognitionResult, StructureResult};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use tracing::debug;

pub struct SidecarBackend {
    url: String,
    client: reqwest::Client,
}

impl SidecarBackend {
    pub fn new(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }

    async fn post_file<T: DeserializeOwned>(&self, path: &str, input: &OcrInput) -> Result<T, OcrError> {
        let part = Part::bytes(input.data.clone())
            .file_name(input.filename.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| OcrError::Rejected(e.to_string()))?;

        let form = Form::new()
            .part("file", part)
            .text("lang", input.lang.clone())
            .text("model", input.model.clone());

        debug!(
            "SidecarBackend: POST {}{} ({} bytes, lang={})",
            self.url,
            path,
            input.data.len(),
            input.lang
        );

        let response = self
            .client
            .post(format!("{}{}", self.url, path))
            .multipart(form)
            .send()
            .await?;

        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, OcrError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(OcrError::Status { status, body });
    }

    let raw = response.bytes().await?;
    serde_json::from_slice(&raw).map_err(|e| OcrError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl OcrBackend for SidecarBackend {
    fn name(&self) -> &str {
        "sidecar"
    }

    async fn recognize(&self, input: &OcrInput) -> Result<RecognitionResult, OcrError> {
        self.post_file("/recognize", input).await
    }

    async fn parse_structure(&self, input: &OcrInput) -> Result<StructureResult, OcrError> {
        self.post_file("/structure", input).await
    }

    async fn extract(&self, input: &OcrInput) -> Result<ExtractionResult, OcrError> {
        self.post_file("/extract", input).await
    }

    async fn status(&self) -> Result<serde_json::Value, OcrError> {
        let response = self.client.get(format!("{}/status", self.url)).send().await?;
        read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn input() -> OcrInput {
        OcrInput {
            filename: "scan.png".to_string(),
            data: vec![1, 2, 3],
            lang: "korean".to_string(),
            model: "pp-ocrv5".to_string(),
        }
    }

    #[tokio::test]
    async fn test_recognize_parses_boxes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/recognize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "text": "안녕하세요",
                "boxes": [{"points": [[0, 0], [4, 0], [4, 2], [0, 2]], "text": "안녕하세요", "score": 0.97}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = SidecarBackend::new(server.uri(), reqwest::Client::new());
        let result = backend.recognize(&input()).await.unwrap();
        assert_eq!(result.text, "안녕하세요");
        assert_eq!(result.boxes.len(), 1);
        assert_eq!(result.boxes[0].points[2], [4.0, 2.0]);
    }

    #[tokio::test]
    async fn test_structure_tolerates_missing_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/structure"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tables": [{"cells": []}]})))
            .mount(&server)
            .await;

        let backend = SidecarBackend::new(server.uri(), reqwest::Client::new());
        let result = backend.parse_structure(&input()).await.unwrap();
        assert_eq!(result.tables.len(), 1);
        assert!(result.markdown.is_none());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
            .mount(&server)
            .await;

        let backend = SidecarBackend::new(server.uri(), reqwest::Client::new());
        let err = backend.extract(&input()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("model loading"));
    }

    #[tokio::test]
    async fn test_client_error_and_bad_body_are_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/recognize"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/extract"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let backend = SidecarBackend::new(server.uri(), reqwest::Client::new());
        assert!(!backend.recognize(&input()).await.unwrap_err().is_retryable());
        assert!(matches!(
            backend.extract(&input()).await.unwrap_err(),
            OcrError::Decode(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_sidecar_is_retryable() {
        let backend = SidecarBackend::new("http://127.0.0.1:1".to_string(), reqwest::Client::new());
        assert!(backend.status().await.unwrap_err().is_retryable());
    }
}
