//! HTTP surface.
//!
//! Public: `GET /health`, `GET /languages`. Everything else sits behind
//! [`require_auth`]. Every response body is an [`Envelope`].

use crate::auth::{require_auth, AuthError, AuthGateway};
use crate::clock::Clock;
use crate::config::Settings;
use crate::envelope::{Envelope, Meta};
use crate::errors::{ApiError, ErrorCode};
use crate::ocr::{preprocess, OcrEngine, OcrInput, OcrOutcome};
use crate::resilience::ResilientInvoker;
use crate::validation::{parse_confidence, OcrMode, RequestValidator};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Request, State,
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Router,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Span};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const SERVICE_NAME: &str = "ocr-gateway";

/// Allowance for multipart framing and form fields on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;
const MAX_BATCH_FILES: usize = 16;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthGateway>,
    pub validator: Arc<RequestValidator>,
    pub engine: OcrEngine,
    pub invoker: ResilientInvoker,
    pub model_default: String,
}

impl AppState {
    /// # Errors
    ///
    /// Returns `AuthError::UnsupportedAuthMode` for an unknown `AUTH_MODE`.
    pub fn new(settings: &Settings, engine: OcrEngine, clock: Arc<dyn Clock>) -> Result<Self, AuthError> {
        Ok(Self {
            auth: Arc::new(AuthGateway::from_settings(settings, clock)?),
            validator: Arc::new(RequestValidator::from_settings(settings)),
            engine,
            invoker: ResilientInvoker::default(),
            model_default: settings.model_default.clone(),
        })
    }
}

pub fn app(state: AppState) -> Router {
    let upload_limit = (state.validator.max_file_bytes() as usize).saturating_add(MULTIPART_OVERHEAD_BYTES);

    let protected = Router::new()
        .route("/ocr", enveloped(post(ocr)))
        .route(
            "/ocr/batch",
            enveloped(post(ocr_batch))
                .layer(DefaultBodyLimit::max(upload_limit.saturating_mul(MAX_BATCH_FILES))),
        )
        .route("/structure", enveloped(post(structure)))
        .route("/extraction", enveloped(post(extraction)))
        .route("/debug/backend", enveloped(get(debug_backend)))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_auth));

    let routes = Router::new()
        .route("/health", enveloped(get(health)))
        .route("/languages", enveloped(get(languages)))
        .merge(protected)
        .fallback(not_found);

    service_layers(routes, upload_limit).with_state(state)
}

/// Method mismatches answer with an envelope instead of an empty 405.
fn enveloped(route: MethodRouter<AppState>) -> MethodRouter<AppState> {
    route.fallback(method_not_allowed)
}

/// Cross-cutting layers, outermost last.
fn service_layers(router: Router<AppState>, upload_limit: usize) -> Router<AppState> {
    router
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(TraceLayer::new_for_http().make_span_with(make_span))
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(stamp_recovered_panic))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// Base `meta` for an envelope: the request id set by the request-id layer.
pub fn request_meta(headers: &HeaderMap) -> Meta {
    let mut meta = Meta::new();
    if let Some(id) = headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        meta.insert("request_id".to_string(), json!(id));
    }
    meta
}

fn make_span(req: &Request) -> Span {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    info_span!("http", method = %req.method(), path = %req.uri().path(), request_id = %request_id)
}

/// Marks a response produced by [`handle_panic`].
#[derive(Debug, Clone, Copy)]
struct RecoveredPanic;

fn panic_envelope(meta: Meta) -> Envelope {
    Envelope::fail(ErrorCode::InternalServerError, "Unexpected error", Meta::new(), meta)
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    error!("Handler panicked: {}", detail);
    let mut response = panic_envelope(Meta::new()).into_response();
    response.extensions_mut().insert(RecoveredPanic);
    response
}

/// The panic hook never sees the request, so the request id is added here.
async fn stamp_recovered_panic(req: Request, next: Next) -> Response {
    let meta = request_meta(req.headers());
    let response = next.run(req).await;
    if response.extensions().get::<RecoveredPanic>().is_some() {
        return panic_envelope(meta).into_response();
    }
    response
}

// ============================================================================
// Handlers
// ============================================================================

/// Liveness plus backend availability. Always 200.
async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let probe = state.engine.probe().await;
    Envelope::ok(
        json!({
            "status": "ok",
            "service": SERVICE_NAME,
            "backend": probe.backend,
            "available": probe.available,
            "gpu": probe.gpu,
        }),
        request_meta(&headers),
    )
    .into_response()
}

async fn languages(State(state): State<AppState>, headers: HeaderMap) -> Response {
    Envelope::ok(
        json!({
            "supported_languages": state.validator.allowed_langs(),
            "default_language": state.validator.default_lang(),
        }),
        request_meta(&headers),
    )
    .into_response()
}

/// Read-only view of what the OCR backend reports about itself.
async fn debug_backend(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let probe = state.engine.probe().await;
    let policy = state.invoker.policy();
    let mut result = json!(probe);
    result["configured"] = json!(state.engine.is_available());
    result["auth_mode"] = json!(state.auth.mode().as_str());
    result["retry"] = json!({
        "max_attempts": policy.max_attempts,
        "min_delay_ms": policy.min_delay.as_millis() as u64,
        "max_delay_ms": policy.max_delay.as_millis() as u64,
    });
    Envelope::ok(result, request_meta(&headers)).into_response()
}

async fn ocr(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    single(state, headers, multipart, None).await
}

async fn structure(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    single(state, headers, multipart, Some(OcrMode::Parsing)).await
}

async fn extraction(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    single(state, headers, multipart, Some(OcrMode::Extraction)).await
}

async fn ocr_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let meta = request_meta(&headers);
    respond(run_batch(&state, multipart, meta.clone()).await, meta)
}

async fn not_found(headers: HeaderMap) -> Response {
    ApiError::NotFound.into_envelope(request_meta(&headers)).into_response()
}

async fn method_not_allowed(headers: HeaderMap) -> Response {
    ApiError::MethodNotAllowed.into_envelope(request_meta(&headers)).into_response()
}

async fn single(
    state: AppState,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
    fixed_mode: Option<OcrMode>,
) -> Response {
    let meta = request_meta(&headers);
    respond(run_single(&state, multipart, fixed_mode, meta.clone()).await, meta)
}

fn respond(result: Result<Envelope, ApiError>, meta: Meta) -> Response {
    match result {
        Ok(envelope) => envelope.into_response(),
        Err(err) => err.into_envelope(meta).into_response(),
    }
}

// ============================================================================
// Request processing
// ============================================================================

async fn run_single(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
    fixed_mode: Option<OcrMode>,
    mut meta: Meta,
) -> Result<Envelope, ApiError> {
    let form = read_form(multipart, &state.validator, &["file"]).await?;

    let upload = match form.files.first() {
        Some(FilePart::Read(upload)) if upload.data.is_empty() => {
            return Err(ApiError::validation("file", "uploaded file is empty"))
        }
        Some(FilePart::Read(upload)) => upload.clone(),
        Some(FilePart::Unreadable { reason, .. }) => return Err(ApiError::validation("file", reason.clone())),
        None => return Err(ApiError::validation("file", "field required")),
    };

    let options = OcrOptions::from_form(&form, state, fixed_mode)?;
    let (result, file_meta) = process_upload(state, &options, upload).await?;

    options.write_meta(&mut meta);
    meta.extend(file_meta);
    Ok(Envelope::ok(result, meta))
}

async fn run_batch(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
    mut meta: Meta,
) -> Result<Envelope, ApiError> {
    let form = read_form(multipart, &state.validator, &["files", "file"]).await?;
    if form.files.is_empty() {
        return Err(ApiError::validation("files", "field required"));
    }
    if form.files.len() > MAX_BATCH_FILES {
        return Err(ApiError::validation(
            "files",
            format!("at most {} files per batch", MAX_BATCH_FILES),
        ));
    }

    let options = OcrOptions::from_form(&form, state, None)?;
    let mut items = Vec::with_capacity(form.files.len());
    let mut degraded = 0;

    for part in form.files {
        match part {
            FilePart::Read(upload) if !upload.data.is_empty() => {
                let filename = upload.filename.clone();
                let (result, file_meta) = process_upload(state, &options, upload).await?;
                if file_meta.get("degraded") == Some(&Value::Bool(true)) {
                    degraded += 1;
                }
                items.push(json!({ "filename": filename, "result": result, "meta": file_meta }));
            }
            FilePart::Read(upload) => {
                warn!("Batch item {} is empty", upload.filename);
                items.push(json!({ "filename": upload.filename, "error": "BadImage" }));
            }
            FilePart::Unreadable { filename, reason } => {
                warn!("Batch item {} could not be read: {}", filename, reason);
                items.push(json!({ "filename": filename, "error": "BadImage" }));
            }
        }
    }

    info!("Batch complete: {} items, {} degraded", items.len(), degraded);
    options.write_meta(&mut meta);
    meta.insert("degraded_count".to_string(), json!(degraded));
    let count = items.len();
    Ok(Envelope::ok(json!({ "items": items, "count": count }), meta))
}

/// Validated per-request OCR options.
struct OcrOptions {
    lang: String,
    mode: OcrMode,
    model: String,
    confidence_threshold: f32,
}

impl OcrOptions {
    fn from_form(form: &UploadForm, state: &AppState, fixed_mode: Option<OcrMode>) -> Result<Self, ApiError> {
        let lang = state.validator.normalize_lang(form.field("lang"))?;
        let mode = match fixed_mode {
            Some(mode) => mode,
            None => OcrMode::parse(form.field("mode"))?,
        };
        let model = form
            .field("model")
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(state.model_default.as_str())
            .to_string();
        let confidence_threshold = parse_confidence(form.field("confidence_threshold"))?;
        Ok(Self {
            lang,
            mode,
            model,
            confidence_threshold,
        })
    }

    fn write_meta(&self, meta: &mut Meta) {
        meta.insert("lang".to_string(), json!(self.lang));
        meta.insert("mode".to_string(), json!(self.mode.as_str()));
        meta.insert("model".to_string(), json!(self.model));
    }
}

/// Preprocess one upload, run it through the engine and describe the run.
async fn process_upload(state: &AppState, options: &OcrOptions, upload: Upload) -> Result<(Value, Meta), ApiError> {
    let started = Instant::now();
    let size_bytes = upload.data.len();
    let sha256 = {
        let mut hasher = Sha256::new();
        hasher.update(&upload.data);
        format!("{:x}", hasher.finalize())
    };

    let prepared = preprocess::prepare(upload.data).await;
    let input = OcrInput {
        filename: upload.filename,
        data: prepared.data,
        lang: options.lang.clone(),
        model: options.model.clone(),
    };

    let invocation = state.engine.run(&state.invoker, options.mode, &input).await;

    let mut meta = Meta::new();
    meta.insert("filename".to_string(), json!(input.filename));
    meta.insert("size_bytes".to_string(), json!(size_bytes));
    meta.insert("sha256".to_string(), json!(sha256));
    meta.insert("attempts".to_string(), json!(invocation.attempts));
    meta.insert("degraded".to_string(), json!(invocation.degraded));
    if let Some((width, height)) = prepared.dimensions {
        meta.insert(
            "image".to_string(),
            json!({ "width": width, "height": height, "resized": prepared.resized }),
        );
    }

    let result = match invocation.value {
        OcrOutcome::Recognition(mut recognition) => {
            let avg = recognition.retain_confident(options.confidence_threshold);
            meta.insert("avg_confidence".to_string(), json!(avg));
            serde_json::to_value(recognition)
        }
        outcome => serde_json::to_value(outcome),
    }
    .map_err(|e| ApiError::Internal(e.into()))?;

    meta.insert("elapsed_ms".to_string(), json!(started.elapsed().as_millis() as u64));
    Ok((result, meta))
}

// ============================================================================
// Multipart
// ============================================================================

#[derive(Debug, Clone)]
struct Upload {
    filename: String,
    data: Bytes,
}

#[derive(Debug)]
enum FilePart {
    Read(Upload),
    Unreadable { filename: String, reason: String },
}

#[derive(Debug, Default)]
struct UploadForm {
    files: Vec<FilePart>,
    fields: HashMap<String, String>,
}

impl UploadForm {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Read every multipart field. Parts named in `file_fields` are uploads; the
/// rest are text fields.
async fn read_form(
    multipart: Result<Multipart, MultipartRejection>,
    validator: &RequestValidator,
    file_fields: &[&str],
) -> Result<UploadForm, ApiError> {
    let mut multipart = multipart.map_err(|e| ApiError::validation("file", e.body_text()))?;
    let mut form = UploadForm::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(multipart_error(e, validator)),
        };
        let name = field.name().unwrap_or_default().to_string();

        if file_fields.contains(&name.as_str()) {
            let filename = field.file_name().unwrap_or("upload").to_string();
            match field.bytes().await {
                Ok(bytes) => {
                    validator.check_size(Some(bytes.len() as u64))?;
                    form.files.push(FilePart::Read(Upload {
                        filename,
                        data: bytes,
                    }));
                }
                Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                    return Err(multipart_error(e, validator))
                }
                Err(e) => {
                    // The stream is unusable after a read error; keep what we have.
                    form.files.push(FilePart::Unreadable {
                        filename,
                        reason: e.body_text(),
                    });
                    break;
                }
            }
        } else {
            let value = field.text().await.map_err(|e| multipart_error(e, validator))?;
            form.fields.insert(name, value);
        }
    }

    Ok(form)
}

fn multipart_error(err: MultipartError, validator: &RequestValidator) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge {
            size: None,
            limit: validator.max_file_bytes(),
        }
    } else {
        ApiError::validation("body", err.body_text())
    }
}
