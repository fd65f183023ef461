//! Thin HTTP layer over the dispatcher.
//!
//! Routes:
//! - `POST /api/jobs/submit` multipart upload of a task script
//! - `GET /api/jobs/status/{job_id}`
//! - `GET /api/jobs/results/{job_id}`
//! - `GET /api/jobs/download/{job_id}/{filename}`
//! - `GET /health`

pub mod error;

pub use error::{ApiError, ApiResult};

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::browser::SharedEngine;
use crate::error::DispatchError;
use crate::scheduler::{Dispatcher, Job, JobStatus};
use crate::worker::{RESULT_FILENAME, RESULT_TMP_FILENAME};

/// Upper bound for one submission (script plus additional files).
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

const DEFAULT_SCRIPT_EXTENSION: &str = "py";

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Dispatcher,
    pub engine: Arc<dyn SharedEngine>,
    pub job_root: PathBuf,
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    status: JobStatus,
    message: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    job_id: Uuid,
    status: JobStatus,
}

#[derive(Serialize)]
struct ProcessingResponse {
    job_id: Uuid,
    status: JobStatus,
    message: &'static str,
}

#[derive(Serialize)]
struct ResultResponse {
    job_id: Uuid,
    status: JobStatus,
    result: Option<Value>,
    files: Option<BTreeMap<String, String>>,
    jobname: String,
    submitted_at: DateTime<Utc>,
    duration_seconds: Option<f64>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    browser_connected: bool,
    queued_tasks: usize,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/jobs/submit", post(submit_job_handler))
        .route("/api/jobs/status/{job_id}", get(job_status_handler))
        .route("/api/jobs/results/{job_id}", get(job_results_handler))
        .route(
            "/api/jobs/download/{job_id}/{filename}",
            get(download_file_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index_handler() -> Json<Value> {
    Json(json!({ "message": "Welcome to the browser job runner API" }))
}

async fn health_handler(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        browser_connected: state.engine.is_connected().await,
        queued_tasks: state.dispatcher.queued(),
    })
}

struct UploadedFile {
    file_name: Option<String>,
    data: Bytes,
}

#[derive(Default)]
struct Submission {
    job_name: Option<String>,
    script: Option<UploadedFile>,
    additional: Vec<UploadedFile>,
}

async fn read_submission(multipart: &mut Multipart) -> ApiResult<Submission> {
    let mut submission = Submission::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        match name.as_str() {
            "jobname" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                submission.job_name = Some(text.trim().to_string());
            }
            "script_file" | "additional_files" | "additional_files[]" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                let file = UploadedFile { file_name, data };
                if name == "script_file" {
                    submission.script = Some(file);
                } else {
                    submission.additional.push(file);
                }
            }
            other => tracing::debug!(field = other, "Ignoring unknown multipart field"),
        }
    }
    Ok(submission)
}

/// POST /api/jobs/submit
///
/// Claims the job name, writes the script and any additional files into a
/// fresh job directory, then hands the job to the dispatcher.
async fn submit_job_handler(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let submission = read_submission(&mut multipart).await?;
    let (job_name, script) = match (submission.job_name, submission.script) {
        (Some(job_name), Some(script)) if !job_name.is_empty() && script.file_name.is_some() => {
            (job_name, script)
        }
        _ => {
            return Err(ApiError::BadRequest(
                "Jobname and script file are required".to_string(),
            ))
        }
    };

    let script_name = script_file_name(&script);
    check_additional_names(&script_name, &submission.additional)?;

    state.dispatcher.admit(&job_name).await?;

    let job_id = Uuid::new_v4();
    let job_path = state.job_root.join(job_id.to_string());
    tracing::info!(job_id = %job_id, job_name = %job_name, path = %job_path.display(), "Received job submission");

    let script_path = match save_files(
        job_id,
        &job_path,
        &script_name,
        &script,
        &submission.additional,
    )
    .await
    {
        Ok(script_path) => script_path,
        Err(e) => {
            tracing::error!(job_id = %job_id, job_name = %job_name, error = %e, "Failed to save job files");
            state.dispatcher.release(&job_name).await;
            remove_job_dir(&job_path).await;
            return Err(ApiError::Internal(format!("Failed to save job files: {e}")));
        }
    };

    if let Err(e) = state
        .dispatcher
        .submit(job_id, &job_name, script_path, job_path.clone())
        .await
    {
        remove_job_dir(&job_path).await;
        return Err(e.into());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Pending,
            message: "Job submitted successfully.",
        }),
    ))
}

/// Stored name of the task script: `script.<ext>`, keeping the uploaded extension.
fn script_file_name(script: &UploadedFile) -> String {
    let extension = script
        .file_name
        .as_deref()
        .and_then(|name| FsPath::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .unwrap_or(DEFAULT_SCRIPT_EXTENSION);
    format!("script.{extension}")
}

fn base_name(file: &UploadedFile) -> Option<&OsStr> {
    file.file_name
        .as_deref()
        .and_then(|name| FsPath::new(name).file_name())
}

/// Additional files may not replace the script or the result file.
fn check_additional_names(script_name: &str, additional: &[UploadedFile]) -> ApiResult<()> {
    let reserved = [script_name, RESULT_FILENAME, RESULT_TMP_FILENAME];
    for file in additional {
        if let Some(name) = base_name(file).and_then(OsStr::to_str) {
            if reserved.contains(&name) {
                return Err(ApiError::BadRequest(format!(
                    "Additional file name '{name}' is reserved"
                )));
            }
        }
    }
    Ok(())
}

/// Write the uploads into `job_path`. Returns the stored script path.
async fn save_files(
    job_id: Uuid,
    job_path: &FsPath,
    script_name: &str,
    script: &UploadedFile,
    additional: &[UploadedFile],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(job_path).await?;

    let script_path = job_path.join(script_name);
    tokio::fs::write(&script_path, &script.data).await?;
    tracing::debug!(job_id = %job_id, path = %script_path.display(), "Saved script file");

    for file in additional {
        let Some(base_name) = base_name(file) else {
            tracing::warn!(job_id = %job_id, "Additional file without a usable name, skipping");
            continue;
        };
        let path = job_path.join(base_name);
        tokio::fs::write(&path, &file.data).await?;
        tracing::debug!(job_id = %job_id, path = %path.display(), "Saved additional file");
    }
    Ok(script_path)
}

async fn remove_job_dir(job_path: &FsPath) {
    if let Err(e) = tokio::fs::remove_dir_all(job_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %job_path.display(), error = %e, "Failed to remove job directory");
        }
    }
}

async fn find_job(state: &ApiState, job_id: &str) -> ApiResult<Job> {
    let Ok(job_id) = Uuid::parse_str(job_id) else {
        return Err(ApiError::NotFound("Job not found".to_string()));
    };
    state
        .dispatcher
        .info(job_id)
        .await
        .ok_or_else(|| DispatchError::JobNotFound(job_id).into())
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let job = find_job(&state, &job_id).await?;
    Ok(Json(StatusResponse {
        job_id: job.job_id,
        status: job.status,
    }))
}

async fn job_results_handler(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> ApiResult<Response> {
    let job = find_job(&state, &job_id).await?;
    if !job.status.is_terminal() {
        return Ok(Json(ProcessingResponse {
            job_id: job.job_id,
            status: job.status,
            message: "Job is still processing.",
        })
        .into_response());
    }

    let files = match list_files(&job.job_path).await {
        Ok(names) => Some(
            names
                .into_iter()
                .map(|name| {
                    let url = format!("/api/jobs/download/{}/{name}", job.job_id);
                    (name, url)
                })
                .collect(),
        ),
        Err(e) => {
            tracing::error!(job_id = %job.job_id, error = %e, "Failed to list job files");
            None
        }
    };

    Ok(Json(ResultResponse {
        job_id: job.job_id,
        status: job.status,
        result: job.result,
        files,
        jobname: job.job_name,
        submitted_at: job.submitted_at,
        duration_seconds: job.duration,
    })
    .into_response())
}

async fn list_files(dir: &FsPath) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

async fn download_file_handler(
    State(state): State<ApiState>,
    Path((job_id, filename)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let job = find_job(&state, &job_id).await?;

    if !FsPath::new(&filename)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        tracing::warn!(job_id = %job.job_id, filename = %filename, "Attempted directory traversal");
        return Err(ApiError::Forbidden);
    }

    let file_path = job.job_path.join(&filename);
    let (Ok(root), Ok(resolved)) = (
        tokio::fs::canonicalize(&job.job_path).await,
        tokio::fs::canonicalize(&file_path).await,
    ) else {
        return Err(ApiError::NotFound("File not found".to_string()));
    };
    if !resolved.starts_with(&root) {
        tracing::warn!(job_id = %job.job_id, filename = %filename, "Download resolves outside the job directory");
        return Err(ApiError::Forbidden);
    }

    let is_file = tokio::fs::metadata(&resolved)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(ApiError::NotFound("File not found".to_string()));
    }

    let data = tokio::fs::read(&resolved)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to read {filename}: {e}")))?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        data,
    ))
}
