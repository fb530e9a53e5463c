//! HTTP shell over the pipeline.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self as axum_mw, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use carvy_contracts::{PipelineOutcome, VehicleImageRequest};
use carvy_engine::{Orchestrator, PipelineError};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const API_KEY_HEADER: &str = "x-api-key";
const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Orchestrator,
    api_key: Arc<str>,
}

pub fn build_router(orchestrator: Orchestrator, api_key: String) -> Router {
    let state = AppState {
        orchestrator,
        api_key: Arc::from(api_key),
    };

    let protected = Router::new()
        .route("/upload-and-process", post(upload_and_process))
        .route("/generate-and-process", post(generate_and_process))
        .route_layer(axum_mw::from_fn_with_state(state.clone(), require_api_key))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

pub async fn serve(router: Router, bind_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!("carvy listening on {bind_addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let supplied = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());
    if supplied != Some(&*state.api_key) {
        warn!(path = %request.uri().path(), "rejected request with invalid api key");
        return error_response(
            StatusCode::FORBIDDEN,
            "forbidden",
            None,
            "Access denied: invalid API key",
        );
    }
    next.run(request).await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /generate-and-process?make=..&model=..&year=..
async fn generate_and_process(
    State(state): State<AppState>,
    query: Result<Query<VehicleImageRequest>, QueryRejection>,
) -> Response {
    let request = match query {
        Ok(Query(request)) => request,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_input",
                None,
                &rejection.body_text(),
            );
        }
    };
    run_pipeline(state.orchestrator, move |orchestrator| {
        orchestrator.generate_and_process(&request)
    })
    .await
}

/// POST /upload-and-process (multipart: `file`, `file_name`)
async fn upload_and_process(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut file: Option<Vec<u8>> = None;
    let mut file_name: Option<String> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => return invalid_upload(&format!("could not read multipart body: {err}")),
        };
        match field.name() {
            Some("file") => match field.bytes().await {
                Ok(bytes) => file = Some(bytes.to_vec()),
                Err(err) => return invalid_upload(&format!("could not read image file: {err}")),
            },
            Some("file_name") => match field.text().await {
                Ok(text) => file_name = Some(text),
                Err(err) => return invalid_upload(&format!("could not read file_name: {err}")),
            },
            _ => {}
        }
    }
    let Some(file_name) = file_name else {
        return invalid_upload("missing form field 'file_name'");
    };
    let Some(file) = file else {
        return invalid_upload("missing form field 'file'");
    };

    run_pipeline(state.orchestrator, move |orchestrator| {
        orchestrator.upload_and_process(&file_name, Cursor::new(file))
    })
    .await
}

async fn run_pipeline<F>(orchestrator: Orchestrator, job: F) -> Response
where
    F: FnOnce(&Orchestrator) -> Result<PipelineOutcome, PipelineError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || job(&orchestrator)).await {
        Ok(Ok(outcome)) => (outcome_status(&outcome), Json(outcome)).into_response(),
        Ok(Err(err)) => error_response(
            error_status(&err),
            err.code(),
            Some(err.stage().as_str()),
            &err.to_string(),
        ),
        Err(err) => {
            error!(error = %err, "pipeline worker failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                None,
                "pipeline worker failed",
            )
        }
    }
}

fn outcome_status(outcome: &PipelineOutcome) -> StatusCode {
    match outcome {
        PipelineOutcome::Cached { .. } => StatusCode::OK,
        PipelineOutcome::Conflict { .. } => StatusCode::CONFLICT,
        PipelineOutcome::Created { .. } => StatusCode::CREATED,
    }
}

fn error_status(err: &PipelineError) -> StatusCode {
    match err.code() {
        "invalid_input" => StatusCode::BAD_REQUEST,
        "undecodable_image" => StatusCode::UNPROCESSABLE_ENTITY,
        "generation_failed" => StatusCode::BAD_GATEWAY,
        "generation_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        "storage_failed" => StatusCode::INSUFFICIENT_STORAGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn invalid_upload(message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, "invalid_input", Some("reading"), message)
}

fn error_response(status: StatusCode, code: &str, stage: Option<&str>, message: &str) -> Response {
    let mut body = json!({
        "status": "error",
        "code": code,
        "message": message,
    });
    if let Some(stage) = stage {
        body["stage"] = json!(stage);
    }
    (status, Json(body)).into_response()
}
