use std::collections::BTreeSet;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::fs;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    bundle::build_bundle,
    error::ConvertError,
    models::{BundleRequest, JobState, OutputFormat, SubmitRequest},
    AppState,
};

// JSON framing and escaping on top of the raw note size.
const BODY_LIMIT_OVERHEAD: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes.saturating_mul(2) + BODY_LIMIT_OVERHEAD;

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/jobs", post(submit_job))
        .route("/v1/jobs/{job_id}", get(get_job).delete(cancel_job))
        .route("/v1/jobs/{job_id}/download/{format}", get(download_output))
        .route("/v1/bundles", post(download_bundle))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let (queued, processing) = state.manager.counts().await;
    Json(json!({
        "ok": true,
        "timestamp": Utc::now(),
        "queued": queued,
        "processing": processing
    }))
}

pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ConvertError> {
    let Json(payload) = payload?;
    let formats: BTreeSet<OutputFormat> = payload.formats.into_iter().collect();
    let accepted = state
        .manager
        .submit(&payload.file_name, payload.content.as_bytes(), formats)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ConvertError> {
    let status = state.manager.status(&job_id).await?;
    Ok(Json(status))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ConvertError> {
    state.manager.cancel(&job_id).await?;
    Ok(Json(json!({ "jobId": job_id, "canceled": true })))
}

pub async fn download_output(
    State(state): State<AppState>,
    Path((job_id, format)): Path<(String, String)>,
) -> Result<Response<Body>, ConvertError> {
    let format = OutputFormat::parse(&format)
        .ok_or_else(|| ConvertError::Validation(format!("Unknown output format `{format}`.")))?;

    let job = state.manager.record(&job_id).await?;
    if job.state != JobState::Completed {
        return Err(ConvertError::NotFound(
            "Job has not completed; no output is available.".to_string(),
        ));
    }
    let path = job.outputs.get(&format).ok_or_else(|| {
        ConvertError::NotFound(format!("Job has no {} output.", format.extension()))
    })?;

    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConvertError::NotFound(
                "Output file no longer exists.".to_string(),
            ));
        }
        Err(err) => {
            return Err(ConvertError::Internal(format!("Failed to read output: {err}")));
        }
    };

    let file_name = format!("{}.{}", job.output_stem(), format.extension());
    attachment(bytes, format.content_type(), &file_name)
}

pub async fn download_bundle(
    State(state): State<AppState>,
    payload: Result<Json<BundleRequest>, JsonRejection>,
) -> Result<Response<Body>, ConvertError> {
    let Json(payload) = payload?;
    let bytes = build_bundle(&state.manager, &payload.job_ids).await?;
    let file_name = format!("notes-{}.tar.gz", Utc::now().format("%Y-%m-%d"));
    attachment(bytes, "application/gzip", &file_name)
}

fn attachment(bytes: Vec<u8>, content_type: &str, file_name: &str) -> Result<Response<Body>, ConvertError> {
    let safe_name = file_name.replace('"', "");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{safe_name}\""),
        )
        .body(Body::from(bytes))
        .map_err(|e| ConvertError::Internal(format!("Failed to build download response: {e}")))
}
