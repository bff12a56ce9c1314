use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task;
use tracing::{error, info};

use claimcheck_analysis::{analyze_batch, AnalysisOptions, TokenUsage};
use claimcheck_core::{
    extract_docx_text, unpack_invoices, DecisionSummary, InvoiceDecision, PromptTemplate,
};
use claimcheck_llm::{LlmClient, LlmProvider, LlmRequest};

/// Whole-request cap; the archive entries are size-checked again during unpacking.
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    template: PromptTemplate,
    provider: LlmProvider,
    /// Env override; requests without an explicit model fall back to the
    /// per-provider default instead.
    model: Option<String>,
    options: AnalysisOptions,
    max_invoices: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let provider = provider_from_env()?;
    let model = std::env::var("CLAIMCHECK_MODEL").ok();
    let startup_model = model
        .clone()
        .unwrap_or_else(|| default_llm_model(provider).to_string());
    // Constructing a client here surfaces missing or malformed API keys at
    // startup instead of on the first upload.
    LlmClient::new(provider, startup_model)?;
    let state = Arc::new(AppState {
        template: load_template()?,
        provider,
        model,
        options: AnalysisOptions {
            throttle_ms: env_u64("CLAIMCHECK_THROTTLE_MS", 0)?,
            ..AnalysisOptions::default()
        },
        max_invoices: env_opt_usize("CLAIMCHECK_MAX_INVOICES")?,
    });
    let app = Router::new()
        .route("/", get(serve_info))
        .route("/health", get(handle_health))
        .route("/upload-form", get(serve_upload_form))
        .route("/analyze-invoices", post(handle_analyze))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state);
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AnalyzeParams {
    provider: Option<String>,
    model: Option<String>,
    max_invoices: Option<usize>,
}

#[derive(Debug, Serialize)]
struct AnalyzeResponse {
    policy_file: String,
    invoice_archive: String,
    invoices_processed: usize,
    analysis: Vec<InvoiceDecision>,
    summary: DecisionSummary,
    usage: TokenUsage,
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "claimcheck" }))
}

async fn serve_info() -> Json<Value> {
    Json(json!({
        "message": "Invoice Reimbursement Analysis API",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "POST /analyze-invoices": "Upload policy_file (.docx) and invoice_zip (.zip) for analysis",
            "GET /upload-form": "HTML form for manual uploads",
            "GET /health": "Health check"
        }
    }))
}

async fn serve_upload_form() -> Html<&'static str> {
    Html(include_str!("../../../ui/upload_form.html"))
}

async fn handle_analyze(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnalyzeParams>,
    mut multipart: Multipart,
) -> Result<Json<AnalyzeResponse>, AppError> {
    let (policy, archive) = extract_uploads(&mut multipart).await?;
    if !has_extension(policy.filename.as_deref(), ".docx") {
        return Err(AppError::bad_request("Policy file must be a .docx file"));
    }
    if !has_extension(archive.filename.as_deref(), ".zip") {
        return Err(AppError::bad_request("Invoice file must be a .zip file"));
    }
    let provider = match params.provider.as_deref() {
        Some(name) => LlmProvider::from_str(name)
            .ok_or_else(|| AppError::bad_request(format!("unknown provider {name}")))?,
        None => state.provider,
    };
    let model = params
        .model
        .clone()
        .or_else(|| state.model.clone())
        .unwrap_or_else(|| default_llm_model(provider).to_string());
    let max_invoices = params.max_invoices.or(state.max_invoices);
    info!(
        "policy_file" = %policy.filename.as_deref().unwrap_or_default(),
        "invoice_zip" = %archive.filename.as_deref().unwrap_or_default()
    );
    let state = state.clone();
    let response = task::spawn_blocking(move || {
        run_analysis(&state, policy, archive, provider, model, max_invoices)
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(response))
}

fn run_analysis(
    state: &AppState,
    policy: UploadedFile,
    archive: UploadedFile,
    provider: LlmProvider,
    model: String,
    max_invoices: Option<usize>,
) -> Result<AnalyzeResponse, AppError> {
    let policy_text = extract_docx_text(&policy.data)
        .map_err(|err| AppError::bad_request(format!("Error extracting text from DOCX: {err}")))?;
    if policy_text.trim().is_empty() {
        return Err(AppError::bad_request("Policy document appears to be empty"));
    }
    let invoices = unpack_invoices(&archive.data, max_invoices)
        .map_err(|err| AppError::bad_request(format!("Error processing zip file: {err}")))?;
    if invoices.is_empty() {
        return Err(AppError::bad_request("No PDF files found in the zip archive"));
    }
    let client = LlmClient::new(provider, model).map_err(AppError::internal)?;
    let report = analyze_batch(
        &state.template,
        &policy_text,
        &invoices,
        &state.options,
        &|system, user| {
            client.chat_blocking(&LlmRequest {
                system: system.map(|s| s.to_string()),
                user: user.to_string(),
            })
        },
    );
    Ok(AnalyzeResponse {
        policy_file: policy.filename.unwrap_or_default(),
        invoice_archive: archive.filename.unwrap_or_default(),
        invoices_processed: report.decisions.len(),
        analysis: report.decisions,
        summary: report.summary,
        usage: report.usage,
    })
}

struct UploadedFile {
    data: Vec<u8>,
    filename: Option<String>,
}

async fn extract_uploads(
    multipart: &mut Multipart,
) -> Result<(UploadedFile, UploadedFile), AppError> {
    let mut policy = None;
    let mut archive = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(AppError::bad_request)?
    {
        let is_policy = match field.name() {
            Some("policy_file") => true,
            Some("invoice_zip") => false,
            _ => continue,
        };
        let filename = field.file_name().map(|s| s.to_string());
        let data = field.bytes().await.map_err(AppError::bad_request)?;
        let upload = UploadedFile {
            data: data.to_vec(),
            filename,
        };
        if is_policy {
            policy = Some(upload);
        } else {
            archive = Some(upload);
        }
    }
    match (policy, archive) {
        (Some(policy), Some(archive)) => Ok((policy, archive)),
        (None, _) => Err(AppError::bad_request("missing policy_file field")),
        (_, None) => Err(AppError::bad_request("missing invoice_zip field")),
    }
}

fn has_extension(filename: Option<&str>, extension: &str) -> bool {
    filename.map_or(false, |name| name.to_lowercase().ends_with(extension))
}

fn provider_from_env() -> Result<LlmProvider, anyhow::Error> {
    match std::env::var("CLAIMCHECK_PROVIDER") {
        Ok(name) => LlmProvider::from_str(&name)
            .ok_or_else(|| anyhow::anyhow!("unknown provider {name}")),
        Err(_) => Ok(LlmProvider::Gemini),
    }
}

fn default_llm_model(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "gpt-4.1-mini",
        LlmProvider::Anthropic => "claude-3-5-sonnet",
        LlmProvider::Gemini => "gemini-1.5-flash",
        LlmProvider::Deepseek => "deepseek-chat",
        LlmProvider::Local => "local",
    }
}

fn load_template() -> Result<PromptTemplate, anyhow::Error> {
    match std::env::var("CLAIMCHECK_PROMPT_FILE") {
        Ok(path) => Ok(PromptTemplate::from_file(Path::new(&path))?),
        Err(_) => Ok(PromptTemplate::default()),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, anyhow::Error> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be an integer, got {value}")),
        Err(_) => Ok(default),
    }
}

fn env_opt_usize(key: &str) -> Result<Option<usize>, anyhow::Error> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{key} must be an integer, got {value}")),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}
