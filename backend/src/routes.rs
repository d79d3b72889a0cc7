use actix_files::Files;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures::StreamExt;
use log::{error, info, warn};
use serde::Deserialize;
use shared::{
    ErrorResponse, HealthResponse, ImageUrlRequest, MessageResponse, ModelInfo,
    SegmentationResponse, ServiceInfo, TaskListResponse, TaskStatus,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::segmentation::orchestrator::Segmenter;
use crate::storage::artifact_service::{file_extension, ArtifactService};
use crate::tasks::queue::{Job, JobKind, JobQueue};
use crate::tasks::task_service::{TaskService, TaskServiceError};

const DEFAULT_THRESHOLD: f64 = 0.5;
const DEFAULT_LIST_LIMIT: usize = 10;

/// Shared handles for the request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub segmenter: Segmenter,
    pub tasks: TaskService,
    pub artifacts: ArtifactService,
    pub queue: JobQueue,
}

#[derive(Deserialize)]
struct UploadParams {
    threshold: Option<f64>,
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
    status: Option<String>,
}

struct UploadedFile {
    filename: String,
    bytes: Vec<u8>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, results_dir: PathBuf) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/segment/upload").route(web::post().to(segment_upload)))
        .service(web::resource("/segment/url").route(web::post().to(segment_url)))
        .service(web::resource("/tasks").route(web::get().to(list_tasks)))
        .service(
            web::resource("/tasks/{task_id}")
                .route(web::get().to(get_task))
                .route(web::delete().to(delete_task)),
        )
        .service(Files::new("/results", results_dir));
}

fn error_response(mut builder: actix_web::HttpResponseBuilder, error: impl Into<String>) -> HttpResponse {
    builder.json(ErrorResponse {
        error: error.into(),
    })
}

fn bad_request(error: impl Into<String>) -> HttpResponse {
    error_response(HttpResponse::BadRequest(), error)
}

fn task_error(err: TaskServiceError) -> HttpResponse {
    match err {
        TaskServiceError::NotFound(_) => error_response(HttpResponse::NotFound(), "Task not found"),
        other => {
            error!("Task registry failure: {}", other);
            error_response(HttpResponse::InternalServerError(), other.to_string())
        }
    }
}

fn valid_threshold(threshold: f64) -> bool {
    (0.0..=1.0).contains(&threshold)
}

async fn index(state: web::Data<AppState>) -> HttpResponse {
    let model_loaded = state.segmenter.model_loaded();
    let model_info = model_loaded.then(|| ModelInfo {
        patch_size: state.config.patch_size,
        backbone: state.config.backbone.clone(),
        n_classes: state.config.n_classes,
        vegetation_classes: state.config.vegetation_classes.clone(),
    });
    HttpResponse::Ok().json(ServiceInfo {
        message: "Vegetation Segmentation API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model_loaded,
        model_info,
    })
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    if !state.segmenter.model_loaded() {
        return error_response(HttpResponse::ServiceUnavailable(), "Model not loaded");
    }
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        model_loaded: true,
    })
}

/// Reads the `file` field, rejecting disallowed extensions and oversized bodies as it goes.
async fn read_file_field(
    payload: &mut Multipart,
    config: &AppConfig,
) -> Result<UploadedFile, HttpResponse> {
    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| bad_request(format!("Invalid multipart payload: {}", e)))?;
        if field.name() != Some("file") {
            while let Some(chunk) = field.next().await {
                chunk.map_err(|e| bad_request(format!("Invalid multipart payload: {}", e)))?;
            }
            continue;
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .unwrap_or_default()
            .to_string();
        let allowed = file_extension(&filename).is_some_and(|ext| config.is_allowed_extension(&ext));
        if !allowed {
            let extensions: Vec<String> = config
                .allowed_extensions
                .iter()
                .map(|ext| format!(".{}", ext))
                .collect();
            return Err(bad_request(format!(
                "Unsupported file type. Allowed: {}",
                extensions.join(", ")
            )));
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk.map_err(|e| bad_request(format!("Upload interrupted: {}", e)))?;
            if bytes.len() + chunk.len() > config.max_upload_bytes {
                return Err(bad_request(format!(
                    "File too large. Maximum size is {}MB",
                    config.max_upload_bytes / (1024 * 1024)
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        return Ok(UploadedFile { filename, bytes });
    }
    Err(bad_request("No file provided"))
}

fn enqueue(state: &AppState, job: Job) -> Result<(), HttpResponse> {
    let task_id = job.task_id;
    state.queue.try_enqueue(job).map_err(|e| {
        error!("Failed to schedule task {}: {}", task_id, e);
        if let Err(fail_err) = state.tasks.fail(task_id, &format!("Queue error: {}", e)) {
            warn!("Could not mark task {} as failed: {}", task_id, fail_err);
        }
        error_response(HttpResponse::ServiceUnavailable(), e.to_string())
    })
}

async fn segment_upload(
    state: web::Data<AppState>,
    query: web::Query<UploadParams>,
    mut payload: Multipart,
) -> HttpResponse {
    let upload = match read_file_field(&mut payload, &state.config).await {
        Ok(upload) => upload,
        Err(response) => return response,
    };
    let threshold = query.threshold.unwrap_or(DEFAULT_THRESHOLD);
    if !valid_threshold(threshold) {
        return bad_request("Threshold must be between 0.0 and 1.0");
    }

    let task = match state.tasks.create_upload_task(threshold) {
        Ok(task) => task,
        Err(e) => return task_error(e),
    };

    let artifacts = state.artifacts.clone();
    let task_id = task.id;
    let saved = web::block(move || artifacts.save_upload(task_id, &upload.filename, &upload.bytes))
        .await
        .map_err(|e| e.to_string())
        .and_then(|result| result.map_err(|e| e.to_string()));
    let path = match saved {
        Ok(path) => path,
        Err(e) => {
            error!("Upload for task {} failed: {}", task_id, e);
            if let Err(fail_err) = state.tasks.fail(task_id, &format!("Upload error: {}", e)) {
                warn!("Could not mark task {} as failed: {}", task_id, fail_err);
            }
            return error_response(
                HttpResponse::InternalServerError(),
                format!("Upload failed: {}", e),
            );
        }
    };

    if let Err(response) = enqueue(
        &state,
        Job {
            task_id,
            kind: JobKind::Upload { path },
        },
    ) {
        return response;
    }

    info!("Upload task {} scheduled", task_id);
    HttpResponse::Ok().json(SegmentationResponse {
        task_id,
        status: TaskStatus::Processing,
        message: "Image uploaded successfully. Processing started.".to_string(),
        created_at: Utc::now(),
    })
}

async fn segment_url(state: web::Data<AppState>, request: web::Json<ImageUrlRequest>) -> HttpResponse {
    let request = request.into_inner();
    match url::Url::parse(&request.url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => {
            return bad_request(format!("Unsupported URL scheme: {}", parsed.scheme()));
        }
        Err(e) => return bad_request(format!("Invalid URL: {}", e)),
    }
    if !valid_threshold(request.threshold) {
        return bad_request("Threshold must be between 0.0 and 1.0");
    }

    let task = match state.tasks.create_url_task(request.threshold) {
        Ok(task) => task,
        Err(e) => return task_error(e),
    };
    if let Err(response) = enqueue(
        &state,
        Job {
            task_id: task.id,
            kind: JobKind::Url { url: request.url },
        },
    ) {
        return response;
    }

    info!("URL task {} scheduled", task.id);
    HttpResponse::Ok().json(SegmentationResponse {
        task_id: task.id,
        status: TaskStatus::Queued,
        message: "URL processing started".to_string(),
        created_at: Utc::now(),
    })
}

async fn get_task(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let Ok(task_id) = Uuid::parse_str(&path.into_inner()) else {
        return error_response(HttpResponse::NotFound(), "Task not found");
    };
    match state.tasks.get(task_id) {
        Ok(task) => HttpResponse::Ok().json(task.to_view()),
        Err(e) => task_error(e),
    }
}

async fn list_tasks(state: web::Data<AppState>, query: web::Query<ListParams>) -> HttpResponse {
    let status = match query.status.as_deref().map(TaskStatus::from_str).transpose() {
        Ok(status) => status,
        Err(_) => return bad_request("Invalid status filter"),
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state.tasks.list(limit, status) {
        Ok(tasks) => HttpResponse::Ok().json(TaskListResponse {
            tasks: tasks.iter().map(|task| task.to_view()).collect(),
        }),
        Err(e) => task_error(e),
    }
}

async fn delete_task(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let Ok(task_id) = Uuid::parse_str(&path.into_inner()) else {
        return error_response(HttpResponse::NotFound(), "Task not found");
    };
    if let Err(e) = state.tasks.get(task_id) {
        return task_error(e);
    }

    let artifacts = state.artifacts.clone();
    let removed = web::block(move || artifacts.delete_task_files(task_id))
        .await
        .map_err(|e| e.to_string())
        .and_then(|result| result.map_err(|e| e.to_string()));
    if let Err(e) = removed {
        error!("Error deleting files of task {}: {}", task_id, e);
        return error_response(
            HttpResponse::InternalServerError(),
            format!("Error deleting task: {}", e),
        );
    }

    match state.tasks.delete(task_id) {
        Ok(_) => HttpResponse::Ok().json(MessageResponse {
            message: "Task deleted successfully".to_string(),
        }),
        Err(e) => task_error(e),
    }
}
