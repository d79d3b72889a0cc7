use actix_web::web;
use image::DynamicImage;
use log::{error, info, warn};
use shared::SegmentationResult;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ProcessingError, Result};
use crate::segmentation::loader::load_image_path;
use crate::segmentation::orchestrator::{
    unique_classes, vegetation_mask, vegetation_percentage, Segmenter,
};
use crate::segmentation::render::{binary_mask_image, class_visualization, overlay_image};
use crate::storage::artifact_service::{ArtifactKind, ArtifactService};
use crate::tasks::queue::{Job, JobKind};
use crate::tasks::task_service::{TaskService, TaskServiceError};

/// Drives one queued job through the pipeline and records the outcome on its task.
pub struct JobRunner {
    segmenter: Segmenter,
    tasks: TaskService,
    artifacts: ArtifactService,
    config: Arc<AppConfig>,
    client: reqwest::Client,
}

struct Artifacts {
    vegetation_percentage: f64,
    result_mask_url: String,
    segmentation_url: String,
    overlay_url: String,
    unique_classes: Vec<u8>,
}

impl JobRunner {
    pub fn new(
        segmenter: Segmenter,
        tasks: TaskService,
        artifacts: ArtifactService,
        config: Arc<AppConfig>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout())
            .build()
            .map_err(|e| ProcessingError::internal(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            segmenter,
            tasks,
            artifacts,
            config,
            client,
        })
    }

    /// Never fails: every error ends up on the task record.
    pub async fn run(&self, job: Job) {
        match job.kind {
            JobKind::Upload { path } => self.run_upload(job.task_id, path).await,
            JobKind::Url { url } => self.run_url(job.task_id, &url).await,
        }
    }

    async fn run_upload(&self, task_id: Uuid, path: PathBuf) {
        if let Err(e) = self.process_file(task_id, path).await {
            error!("Error processing image {}: {}", task_id, e);
            self.record_failure(task_id, &format!("Processing error: {}", e));
        }
    }

    async fn run_url(&self, task_id: Uuid, url: &str) {
        match self.download(task_id, url).await {
            Ok(path) => self.run_upload(task_id, path).await,
            Err(e) => {
                error!("Error processing URL {} for task {}: {}", url, task_id, e);
                self.record_failure(task_id, &format!("Error processing URL: {}", e));
            }
        }
    }

    fn record_failure(&self, task_id: Uuid, message: &str) {
        match self.tasks.fail(task_id, message) {
            Ok(_) => {}
            // Deleted mid-flight: files written after the delete are orphans.
            Err(TaskServiceError::NotFound(_)) => self.discard_files(task_id),
            Err(e) => warn!("Could not record failure for task {}: {}", task_id, e),
        }
    }

    fn discard_files(&self, task_id: Uuid) {
        info!("Task {} was deleted while running; removing its files", task_id);
        if let Err(e) = self.artifacts.delete_task_files(task_id) {
            warn!("Could not remove files of deleted task {}: {}", task_id, e);
        }
    }

    async fn download(&self, task_id: Uuid, url: &str) -> Result<PathBuf> {
        self.ensure_model()?;
        self.tasks.mark_downloading(task_id)?;

        let limit = self.config.max_upload_bytes;
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large(limit));
        }
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if bytes.len() + chunk.len() > limit {
                return Err(too_large(limit));
            }
            bytes.extend_from_slice(&chunk);
        }
        info!("Downloaded {} bytes for task {}", bytes.len(), task_id);

        let artifacts = self.artifacts.clone();
        let path = web::block(move || artifacts.save_upload(task_id, "input", &bytes)).await??;
        Ok(path)
    }

    async fn process_file(&self, task_id: Uuid, path: PathBuf) -> Result<()> {
        let start = Instant::now();
        self.ensure_model()?;

        self.tasks.update_progress(task_id, 30, "Loading image...")?;
        let image = web::block(move || load_image_path(&path)).await??;
        let (height, width) = (image.height(), image.width());

        self.tasks.update_progress(task_id, 50, "Running segmentation...")?;
        let segmenter = self.segmenter.clone();
        let (tile_size, batch_size) = (self.config.patch_size, self.config.batch_size);
        let pixels = image.pixels;
        let (pixels, mask) = web::block(move || {
            segmenter
                .segment(&pixels, tile_size, batch_size)
                .map(|mask| (pixels, mask))
        })
        .await??;

        self.tasks.update_progress(task_id, 80, "Generating results...")?;
        let artifacts = self.artifacts.clone();
        let config = self.config.clone();
        let rendered = web::block(move || -> Result<Artifacts> {
            let vegetation = vegetation_mask(&mask, &config.vegetation_classes);
            let binary = DynamicImage::ImageLuma8(binary_mask_image(&vegetation));
            let classes = DynamicImage::ImageLuma8(class_visualization(&mask, config.n_classes));
            let overlay = DynamicImage::ImageRgb8(overlay_image(
                &pixels,
                &vegetation,
                config.highlight_color,
                config.overlay_alpha,
            ));
            Ok(Artifacts {
                vegetation_percentage: vegetation_percentage(&vegetation),
                result_mask_url: artifacts.save_png(task_id, ArtifactKind::Result, &binary)?,
                segmentation_url: artifacts.save_png(
                    task_id,
                    ArtifactKind::Segmentation,
                    &classes,
                )?,
                overlay_url: artifacts.save_png(task_id, ArtifactKind::Overlay, &overlay)?,
                unique_classes: unique_classes(&mask),
            })
        })
        .await??;

        let processing_time = (start.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        let result = SegmentationResult {
            vegetation_percentage: rendered.vegetation_percentage,
            processing_time,
            method: format!("AI Model ({} classes)", self.config.n_classes),
            result_mask_url: rendered.result_mask_url,
            overlay_url: rendered.overlay_url,
            segmentation_url: rendered.segmentation_url,
            image_dimensions: [height, width],
            unique_classes: rendered.unique_classes,
        };
        self.tasks.complete(task_id, result)?;

        info!("Successfully processed image {}", task_id);
        info!("Vegetation coverage: {:.2}%", rendered.vegetation_percentage);
        Ok(())
    }

    fn ensure_model(&self) -> Result<()> {
        if self.segmenter.model_loaded() {
            Ok(())
        } else {
            Err(ProcessingError::ModelUnavailable("no model backend loaded".to_string()))
        }
    }
}

fn too_large(limit: usize) -> ProcessingError {
    ProcessingError::download(format!("image is larger than {} bytes", limit))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::segmentation::model::tests::StubModel;
    use crate::segmentation::model::InferenceService;
    use crate::segmentation::normalization::Normalization;
    use crate::tasks::model::TaskRecord;
    use crate::tasks::store::{InMemoryTaskStore, StoreError, TaskStore};
    use actix_web::{App, HttpResponse, HttpServer};
    use image::{ImageFormat, RgbImage};
    use shared::TaskStatus;
    use std::io::Cursor;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub dir: TempDir,
        pub runner: JobRunner,
        pub segmenter: Segmenter,
        pub tasks: TaskService,
        pub artifacts: ArtifactService,
        pub config: Arc<AppConfig>,
    }

    pub(crate) fn harness_with(inference: InferenceService, patch_size: usize) -> Harness {
        build_harness(inference, Arc::new(InMemoryTaskStore::new()), |config| {
            config.patch_size = patch_size
        })
    }

    fn build_harness(
        inference: InferenceService,
        store: Arc<dyn TaskStore>,
        configure: impl FnOnce(&mut AppConfig),
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig {
            upload_dir: dir.path().join("uploads"),
            results_dir: dir.path().join("results"),
            download_timeout_secs: 5,
            ..AppConfig::default()
        };
        configure(&mut config);
        let config = Arc::new(config);
        let artifacts =
            ArtifactService::new(config.upload_dir.clone(), config.results_dir.clone());
        artifacts.ensure_dirs().unwrap();
        let tasks = TaskService::new(store);
        let segmenter = Segmenter::new(Arc::new(inference));
        let runner = JobRunner::new(
            segmenter.clone(),
            tasks.clone(),
            artifacts.clone(),
            config.clone(),
        )
        .unwrap();
        Harness {
            dir,
            runner,
            segmenter,
            tasks,
            artifacts,
            config,
        }
    }

    pub(crate) fn harness(model: StubModel) -> Harness {
        let patch_size = model.input;
        harness_with(
            InferenceService::new(Box::new(model), Normalization::Identity),
            patch_size,
        )
    }

    /// Drops a record as soon as an update leaves it matching `when`, like a client
    /// deleting the task while its job is still running.
    struct DeletingStore {
        inner: InMemoryTaskStore,
        when: fn(&TaskRecord) -> bool,
    }

    impl TaskStore for DeletingStore {
        fn get(&self, id: Uuid) -> std::result::Result<Option<TaskRecord>, StoreError> {
            self.inner.get(id)
        }

        fn put(&self, record: TaskRecord) -> std::result::Result<(), StoreError> {
            self.inner.put(record)
        }

        fn delete(&self, id: Uuid) -> std::result::Result<Option<TaskRecord>, StoreError> {
            self.inner.delete(id)
        }

        fn list(&self) -> std::result::Result<Vec<TaskRecord>, StoreError> {
            self.inner.list()
        }

        fn update(
            &self,
            id: Uuid,
            apply: &mut dyn FnMut(&mut TaskRecord),
        ) -> std::result::Result<Option<TaskRecord>, StoreError> {
            let updated = self.inner.update(id, apply)?;
            if updated.as_ref().is_some_and(self.when) {
                self.inner.delete(id)?;
            }
            Ok(updated)
        }
    }

    fn deleting_harness(model: StubModel, when: fn(&TaskRecord) -> bool) -> Harness {
        let patch_size = model.input;
        let store = DeletingStore {
            inner: InMemoryTaskStore::new(),
            when,
        };
        build_harness(
            InferenceService::new(Box::new(model), Normalization::Identity),
            Arc::new(store),
            |config| config.patch_size = patch_size,
        )
    }

    fn files_of(dir: &std::path::Path, task_id: Uuid) -> Vec<String> {
        let prefix = format!("{}_", task_id);
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.unwrap().file_name().into_string().ok())
            .filter(|name| name.starts_with(&prefix))
            .collect()
    }

    pub(crate) fn png_bytes(width: u32, height: u32, red: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, image::Rgb([red, 0, 0]));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    async fn serve_png(body: Vec<u8>) -> (SocketAddr, actix_web::dev::ServerHandle) {
        let server = HttpServer::new(move || {
            let body = body.clone();
            App::new()
                .route(
                    "/field.png",
                    web::get().to(move || {
                        let body = body.clone();
                        async move { HttpResponse::Ok().content_type("image/png").body(body) }
                    }),
                )
                .default_service(web::to(|| async { HttpResponse::NotFound().finish() }))
        })
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        actix_web::rt::spawn(server);
        (addr, handle)
    }

    #[actix_web::test]
    async fn blank_upload_completes_with_zero_coverage() {
        let h = harness(StubModel::constant(0, 7, 512));
        let task = h.tasks.create_upload_task(0.5).unwrap();
        let path = h
            .artifacts
            .save_upload(task.id, "blank.png", &png_bytes(1024, 1024, 0))
            .unwrap();

        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Upload { path },
            })
            .await;

        let done = h.tasks.get(task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "{}", done.message);
        assert_eq!(done.progress, 100);
        let result = done.result.unwrap();
        assert_eq!(result.vegetation_percentage, 0.0);
        assert_eq!(result.image_dimensions, [1024, 1024]);
        assert_eq!(result.unique_classes, vec![0]);
        assert_eq!(result.method, "AI Model (7 classes)");
        assert_eq!(result.overlay_url, format!("/results/{}_overlay.png", task.id));
        for kind in ["result", "segmentation", "overlay"] {
            assert!(h.config.results_dir.join(format!("{}_{}.png", task.id, kind)).exists());
        }
    }

    #[actix_web::test]
    async fn vegetation_everywhere_is_full_coverage() {
        let h = harness(StubModel::from_red(7, 64));
        let task = h.tasks.create_upload_task(0.5).unwrap();
        let path = h
            .artifacts
            .save_upload(task.id, "green.png", &png_bytes(90, 70, 2))
            .unwrap();
        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Upload { path },
            })
            .await;

        let result = h.tasks.get(task.id).unwrap().result.unwrap();
        assert_eq!(result.vegetation_percentage, 100.0);
        assert_eq!(result.image_dimensions, [70, 90]);
        assert_eq!(result.unique_classes, vec![2]);
    }

    #[actix_web::test]
    async fn undecodable_upload_is_an_error() {
        let h = harness(StubModel::constant(0, 7, 64));
        let task = h.tasks.create_upload_task(0.5).unwrap();
        let path = h
            .artifacts
            .save_upload(task.id, "broken.png", b"not an image")
            .unwrap();
        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Upload { path },
            })
            .await;

        let failed = h.tasks.get(task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert!(failed.message.starts_with("Processing error: Unsupported image format"));
        assert_eq!(failed.progress, 30);
        assert!(failed.result.is_none());
    }

    #[actix_web::test]
    async fn missing_model_fails_the_job() {
        let h = harness_with(InferenceService::unavailable(Normalization::Identity), 64);
        let task = h.tasks.create_upload_task(0.5).unwrap();
        let path = h
            .artifacts
            .save_upload(task.id, "a.png", &png_bytes(8, 8, 0))
            .unwrap();
        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Upload { path },
            })
            .await;

        let failed = h.tasks.get(task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(
            failed.message,
            "Processing error: Model not loaded: no model backend loaded"
        );
    }

    #[actix_web::test]
    async fn url_returning_404_ends_in_error() {
        let h = harness(StubModel::constant(0, 7, 64));
        let (addr, server) = serve_png(png_bytes(8, 8, 0)).await;
        let task = h.tasks.create_url_task(0.5).unwrap();

        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Url {
                    url: format!("http://{}/missing.png", addr),
                },
            })
            .await;
        server.stop(true).await;

        let failed = h.tasks.get(task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert!(failed.message.starts_with("Error processing URL: Download failed"));
        assert!(failed.message.contains("404"));
        assert_eq!(failed.progress, 10);
        assert!(failed.result.is_none());
    }

    #[actix_web::test]
    async fn url_job_downloads_then_segments() {
        let h = harness(StubModel::constant(4, 7, 64));
        let (addr, server) = serve_png(png_bytes(100, 80, 0)).await;
        let task = h.tasks.create_url_task(0.5).unwrap();

        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Url {
                    url: format!("http://{}/field.png", addr),
                },
            })
            .await;
        server.stop(true).await;

        let done = h.tasks.get(task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed, "{}", done.message);
        let result = done.result.unwrap();
        assert_eq!(result.image_dimensions, [80, 100]);
        assert_eq!(result.vegetation_percentage, 100.0);
        assert!(h.dir.path().join("uploads").join(format!("{}_input", task.id)).exists());
    }

    #[actix_web::test]
    async fn finished_task_is_not_reprocessed() {
        let h = harness(StubModel::constant(0, 7, 64));
        let task = h.tasks.create_upload_task(0.5).unwrap();
        let path = h
            .artifacts
            .save_upload(task.id, "a.png", &png_bytes(64, 64, 0))
            .unwrap();
        let job = Job {
            task_id: task.id,
            kind: JobKind::Upload { path },
        };
        h.runner.run(job.clone()).await;
        h.runner.run(job).await;

        let stored = h.tasks.get(task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert!(stored.result.is_some());
    }

    #[actix_web::test]
    async fn task_deleted_during_download_leaves_no_files() {
        let h = deleting_harness(StubModel::constant(0, 7, 64), |task| {
            task.status == TaskStatus::Downloading
        });
        let (addr, server) = serve_png(png_bytes(40, 40, 0)).await;
        let task = h.tasks.create_url_task(0.5).unwrap();

        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Url {
                    url: format!("http://{}/field.png", addr),
                },
            })
            .await;
        server.stop(true).await;

        assert!(matches!(
            h.tasks.get(task.id),
            Err(TaskServiceError::NotFound(_))
        ));
        assert!(files_of(&h.config.upload_dir, task.id).is_empty());
        assert!(files_of(&h.config.results_dir, task.id).is_empty());
    }

    #[actix_web::test]
    async fn task_deleted_while_rendering_leaves_no_artifacts() {
        let h = deleting_harness(StubModel::constant(2, 7, 64), |task| task.progress == 80);
        let task = h.tasks.create_upload_task(0.5).unwrap();
        let path = h
            .artifacts
            .save_upload(task.id, "a.png", &png_bytes(64, 64, 0))
            .unwrap();

        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Upload { path },
            })
            .await;

        assert!(matches!(
            h.tasks.get(task.id),
            Err(TaskServiceError::NotFound(_))
        ));
        assert!(files_of(&h.config.upload_dir, task.id).is_empty());
        assert!(files_of(&h.config.results_dir, task.id).is_empty());
    }

    #[actix_web::test]
    async fn oversized_download_is_rejected() {
        let h = build_harness(
            InferenceService::new(
                Box::new(StubModel::constant(0, 7, 64)),
                Normalization::Identity,
            ),
            Arc::new(InMemoryTaskStore::new()),
            |config| {
                config.patch_size = 64;
                config.max_upload_bytes = 64;
            },
        );
        let body = png_bytes(100, 80, 0);
        assert!(body.len() > 64);
        let (addr, server) = serve_png(body).await;
        let task = h.tasks.create_url_task(0.5).unwrap();

        h.runner
            .run(Job {
                task_id: task.id,
                kind: JobKind::Url {
                    url: format!("http://{}/field.png", addr),
                },
            })
            .await;
        server.stop(true).await;

        let failed = h.tasks.get(task.id).unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(
            failed.message,
            "Error processing URL: Download failed: image is larger than 64 bytes"
        );
        assert_eq!(failed.progress, 10);
        assert!(files_of(&h.config.upload_dir, task.id).is_empty());
    }
}
