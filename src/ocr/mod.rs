//! Boundary to the external OCR engine.
//!
//! Defines the [`OcrBackend`] trait, the result types every backend returns,
//! and [`OcrEngine`], which decides once at startup whether a real backend is
//! available or the stub answers instead.

pub mod preprocess;
pub mod sidecar;

use crate::config::Settings;
use crate::resilience::{Invocation, ResilientInvoker};
use crate::validation::OcrMode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Text returned by the stub engine when no backend is configured.
pub const STUB_TEXT: &str = "stub";

/// One detected text region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    #[serde(default)]
    pub points: Vec<[f64; 2]>,
    pub text: String,
    #[serde(default)]
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub boxes: Vec<TextBox>,
}

impl RecognitionResult {
    /// Drop boxes scoring below `threshold`; returns the mean score of the
    /// boxes that remain (0.0 when none do).
    pub fn retain_confident(&mut self, threshold: f32) -> f32 {
        if self.boxes.is_empty() {
            return 0.0;
        }
        self.boxes.retain(|b| b.score >= threshold);
        self.text = self
            .boxes
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        if self.boxes.is_empty() {
            0.0
        } else {
            self.boxes.iter().map(|b| b.score).sum::<f32>() / self.boxes.len() as f32
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructureResult {
    #[serde(default)]
    pub tables: Vec<serde_json::Value>,
    #[serde(default)]
    pub markdown: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub entities: Vec<serde_json::Value>,
}

/// Output of one OCR call, shaped by mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OcrOutcome {
    Recognition(RecognitionResult),
    Structure(StructureResult),
    Extraction(ExtractionResult),
}

/// Upload handed to a backend, already preprocessed.
#[derive(Debug, Clone)]
pub struct OcrInput {
    pub filename: String,
    pub data: Vec<u8>,
    pub lang: String,
    pub model: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    #[error("OCR backend unreachable: {0}")]
    Transport(String),
    #[error("OCR backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid OCR backend response: {0}")]
    Decode(String),
    #[error("OCR backend rejected input: {0}")]
    Rejected(String),
}

impl OcrError {
    /// Transport faults, 5xx and 429 may succeed on a second try.
    pub fn is_retryable(&self) -> bool {
        match self {
            OcrError::Transport(_) => true,
            OcrError::Status { status, .. } => *status >= 500 || *status == 429,
            OcrError::Decode(_) | OcrError::Rejected(_) => false,
        }
    }
}

impl From<reqwest::Error> for OcrError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OcrError::Decode(err.to_string())
        } else {
            OcrError::Transport(err.to_string())
        }
    }
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait OcrBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn recognize(&self, input: &OcrInput) -> Result<RecognitionResult, OcrError>;
    async fn parse_structure(&self, input: &OcrInput) -> Result<StructureResult, OcrError>;
    async fn extract(&self, input: &OcrInput) -> Result<ExtractionResult, OcrError>;
    /// Backend self-report for health and debug endpoints.
    async fn status(&self) -> Result<serde_json::Value, OcrError>;
}

/// Availability snapshot of the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendProbe {
    pub backend: String,
    pub available: bool,
    pub gpu: bool,
    pub status: serde_json::Value,
}

/// The OCR engine, fixed at construction.
#[derive(Clone)]
pub enum OcrEngine {
    Available(Arc<dyn OcrBackend>),
    Unavailable,
}

impl OcrEngine {
    pub fn from_settings(settings: &Settings, client: reqwest::Client) -> Self {
        match &settings.ocr_backend_url {
            Some(url) => {
                info!("OCR backend configured at {}", url);
                OcrEngine::Available(Arc::new(sidecar::SidecarBackend::new(url.clone(), client)))
            }
            None => {
                info!("OCR_BACKEND_URL not set, serving stub OCR results");
                OcrEngine::Unavailable
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, OcrEngine::Available(_))
    }

    pub fn backend_name(&self) -> &str {
        match self {
            OcrEngine::Available(backend) => backend.name(),
            OcrEngine::Unavailable => "stub",
        }
    }

    /// Run `mode` on `input` through `invoker`. The stub engine answers
    /// without any attempt.
    pub async fn run(
        &self,
        invoker: &ResilientInvoker,
        mode: OcrMode,
        input: &OcrInput,
    ) -> Invocation<OcrOutcome> {
        let backend = match self {
            OcrEngine::Available(backend) => backend.as_ref(),
            OcrEngine::Unavailable => {
                return Invocation {
                    value: stub_outcome(mode),
                    attempts: 0,
                    degraded: false,
                }
            }
        };

        match mode {
            OcrMode::Recognition => invoker
                .invoke("recognize", || backend.recognize(input))
                .await
                .map(OcrOutcome::Recognition),
            OcrMode::Parsing => invoker
                .invoke("parse_structure", || backend.parse_structure(input))
                .await
                .map(OcrOutcome::Structure),
            OcrMode::Extraction => invoker
                .invoke("extract", || backend.extract(input))
                .await
                .map(OcrOutcome::Extraction),
        }
    }

    pub async fn probe(&self) -> BackendProbe {
        match self {
            OcrEngine::Unavailable => BackendProbe {
                backend: self.backend_name().to_string(),
                available: false,
                gpu: false,
                status: serde_json::Value::Null,
            },
            OcrEngine::Available(backend) => match backend.status().await {
                Ok(status) => BackendProbe {
                    backend: self.backend_name().to_string(),
                    available: true,
                    gpu: status.get("gpu").and_then(|g| g.as_bool()).unwrap_or(false),
                    status,
                },
                Err(e) => BackendProbe {
                    backend: self.backend_name().to_string(),
                    available: false,
                    gpu: false,
                    status: serde_json::json!({ "error": e.to_string() }),
                },
            },
        }
    }
}

fn stub_outcome(mode: OcrMode) -> OcrOutcome {
    match mode {
        OcrMode::Recognition => OcrOutcome::Recognition(RecognitionResult {
            text: STUB_TEXT.to_string(),
            boxes: Vec::new(),
        }),
        OcrMode::Parsing => OcrOutcome::Structure(StructureResult {
            tables: Vec::new(),
            markdown: Some(String::new()),
        }),
        OcrMode::Extraction => OcrOutcome::Extraction(ExtractionResult::default()),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{EchoBackend, FailingBackend};
    use super::*;
    use crate::resilience::RetryPolicy;
    use std::sync::atomic::Ordering;

    fn input() -> OcrInput {
        OcrInput {
            filename: "hosts".to_string(),
            data: b"127.0.0.1 localhost".to_vec(),
            lang: "en".to_string(),
            model: "pp-ocrv5".to_string(),
        }
    }

    #[tokio::test]
    async fn test_unavailable_engine_returns_stub() {
        let invoker = ResilientInvoker::new(RetryPolicy::immediate(2));
        let out = OcrEngine::Unavailable.run(&invoker, OcrMode::Recognition, &input()).await;
        assert_eq!(out.attempts, 0);
        assert!(!out.degraded);
        match out.value {
            OcrOutcome::Recognition(r) => assert_eq!(r.text, STUB_TEXT),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_backend_degrades_in_every_mode() {
        let backend = Arc::new(FailingBackend::default());
        let engine = OcrEngine::Available(backend.clone());
        let invoker = ResilientInvoker::new(RetryPolicy::immediate(2));

        for mode in OcrMode::ALL {
            let out = engine.run(&invoker, mode, &input()).await;
            assert!(out.degraded, "mode {:?}", mode);
            assert_eq!(out.attempts, 2);
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_probe() {
        let probe = OcrEngine::Available(Arc::new(EchoBackend)).probe().await;
        assert!(probe.available);
        assert!(probe.gpu);

        let probe = OcrEngine::Available(Arc::new(FailingBackend::default())).probe().await;
        assert!(!probe.available);
        assert!(probe.status["error"].is_string());

        let probe = OcrEngine::Unavailable.probe().await;
        assert_eq!(probe.backend, "stub");
        assert!(!probe.available);
    }

    #[test]
    fn test_retain_confident() {
        let mut result = RecognitionResult {
            text: "a b".to_string(),
            boxes: vec![
                TextBox { points: Vec::new(), text: "a".to_string(), score: 0.9 },
                TextBox { points: Vec::new(), text: "b".to_string(), score: 0.3 },
                TextBox { points: Vec::new(), text: "c".to_string(), score: 0.7 },
            ],
        };
        let avg = result.retain_confident(0.5);
        assert_eq!(result.text, "a c");
        assert_eq!(result.boxes.len(), 2);
        assert!((avg - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_retain_confident_without_boxes_keeps_text() {
        let mut result = RecognitionResult {
            text: "plain".to_string(),
            boxes: Vec::new(),
        };
        assert_eq!(result.retain_confident(0.5), 0.0);
        assert_eq!(result.text, "plain");
    }

    #[test]
    fn test_error_retryability() {
        assert!(OcrError::Transport("x".into()).is_retryable());
        assert!(OcrError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(OcrError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!OcrError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!OcrError::Decode("x".into()).is_retryable());
    }
}
