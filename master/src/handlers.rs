use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common::{ConfigOverrides, JobRecord, JobType, JobUploads};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Margen para los campos de texto del multipart además de los archivos.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    // hasta tres archivos (file1, file2, kwBundle) por submission
    let per_file = usize::try_from(state.service.settings().max_upload_bytes()).unwrap_or(usize::MAX);
    let body_limit = per_file.saturating_mul(3).saturating_add(FORM_OVERHEAD_BYTES);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/config/defaults", get(config_defaults))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/results", get(get_results))
        .route("/api/v1/jobs/:id/artifacts", get(list_artifacts))
        .route("/api/v1/jobs/:id/artifacts/*name", get(get_artifact))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Corre una operación síncrona del servicio fuera del runtime async.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> common::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(format!("tarea bloqueante abortada: {}", e)))?
        .map_err(ApiError::from)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn config_defaults() -> Json<ConfigOverrides> {
    Json(ConfigOverrides::defaults())
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE", e.body_text());
    }
    ApiError::bad_request("INVALID_REQUEST", e.body_text())
}

#[derive(Default)]
struct Submission {
    job_type: Option<String>,
    config: Option<String>,
    uploads: JobUploads,
}

async fn read_submission(mut multipart: Multipart) -> Result<Submission, ApiError> {
    let mut submission = Submission::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "jobType" | "config" => {
                let text = field
                    .text()
                    .await
                    .map_err(multipart_error)?;
                if name == "jobType" {
                    submission.job_type = Some(text);
                } else {
                    submission.config = Some(text);
                }
            }
            "file1" | "file2" | "kwBundle" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(multipart_error)?
                    .to_vec();
                match name.as_str() {
                    "file1" => submission.uploads.file1 = Some(bytes),
                    "file2" => submission.uploads.file2 = Some(bytes),
                    _ => submission.uploads.kw_bundle = Some(bytes),
                }
            }
            other => {
                return Err(ApiError::bad_request(
                    "INVALID_REQUEST",
                    format!("Unexpected form field {}.", other),
                ))
            }
        }
    }

    Ok(submission)
}

// Valida la submission, guarda las entradas y deja el job en la cola
async fn create_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let submission = read_submission(multipart).await?;

    let job_type: JobType = submission
        .job_type
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("INVALID_JOB_TYPE", "jobType is required."))?
        .parse()?;
    let overrides = ConfigOverrides::from_json(submission.config.as_deref().unwrap_or_default())?;

    let service = state.service.clone();
    let uploads = submission.uploads;
    let record =
        blocking(move || service.create_job(job_type, &overrides, &uploads)).await?;

    info!("job {} creado ({})", record.job_id, record.job_type);
    Ok((StatusCode::CREATED, Json(json!({ "jobId": record.job_id }))))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.get_job(&id)).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.cancel_job(&id)).await?))
}

async fn get_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let service = state.service.clone();
    Ok(Json(blocking(move || service.get_results(&id)).await?))
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let service = state.service.clone();
    let job_id = id.clone();
    let artifacts = blocking(move || service.list_artifacts(&id)).await?;
    Ok(Json(json!({ "jobId": job_id, "artifacts": artifacts })))
}

// Descarga un artefacto de output/ (nunca fuera de él)
async fn get_artifact(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.service.clone();
    let (content_type, bytes) = blocking(move || {
        let path = service.artifact_path(&id, &name)?;
        let bytes = std::fs::read(&path)?;
        Ok((service.content_type(&path), bytes))
    })
    .await?;

    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
