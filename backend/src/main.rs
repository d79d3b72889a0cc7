mod config;
mod error;
mod routes;
mod segmentation;
mod storage;
mod tasks;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use config::AppConfig;
use routes::{configure_routes, AppState};
use segmentation::model::{load_model, InferenceService};
use segmentation::normalization::Normalization;
use segmentation::orchestrator::Segmenter;
use std::env;
use std::io::{Error, ErrorKind};
use std::sync::Arc;
use storage::artifact_service::ArtifactService;
use tasks::job::JobRunner;
use tasks::queue::{spawn_workers, JobQueue};
use tasks::store::InMemoryTaskStore;
use tasks::task_service::TaskService;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    dotenv::dotenv().ok();

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        Error::new(ErrorKind::InvalidInput, e.to_string())
    })?;
    let config = Arc::new(config);

    let artifacts = ArtifactService::new(config.upload_dir.clone(), config.results_dir.clone());
    artifacts
        .ensure_dirs()
        .map_err(|e| Error::other(e.to_string()))?;

    log::info!("Starting Vegetation Segmentation API...");
    let model = load_model(&config.model_path, config.patch_size, config.n_classes).map_err(|e| {
        log::error!("CRITICAL: Failed to load model {}: {}", config.model_path.display(), e);
        Error::other(format!("Model loading failed: {}", e))
    })?;
    log::info!("Patch size: {}x{}", config.patch_size, config.patch_size);
    log::info!("Classes: {}", config.n_classes);

    let normalization = Normalization::for_backbone(&config.backbone);
    let segmenter = Segmenter::new(Arc::new(InferenceService::new(model, normalization)));
    let tasks = TaskService::new(Arc::new(InMemoryTaskStore::new()));

    let runner = JobRunner::new(
        segmenter.clone(),
        tasks.clone(),
        artifacts.clone(),
        config.clone(),
    )
    .map_err(|e| Error::other(e.to_string()))?;
    let (queue, receiver) = JobQueue::new(config.queue_capacity);
    spawn_workers(config.workers, receiver, Arc::new(runner));

    let state = AppState {
        config: config.clone(),
        segmenter,
        tasks,
        artifacts,
        queue,
    };

    let bind_address = config.bind_address();
    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(Logger::default())
            .app_data(web::Data::new(state.clone()))
            .configure(|cfg| configure_routes(cfg, config.results_dir.clone()))
    })
    .bind(bind_address)?
    .run()
    .await
}
