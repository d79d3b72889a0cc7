use log::{debug, error, info, warn};
use shared::{SegmentationResult, TaskStatus};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::tasks::model::{can_transition, TaskRecord};
use crate::tasks::store::{StoreError, TaskStore};

#[derive(Error, Debug)]
pub enum TaskServiceError {
    #[error("Task not found: {0}")]
    NotFound(Uuid),
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Registry of tasks and the only writer of their lifecycle.
#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
}

impl TaskService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn create_upload_task(&self, threshold: f64) -> Result<TaskRecord, TaskServiceError> {
        self.create(TaskStatus::Uploading, "Uploading file...", threshold)
    }

    pub fn create_url_task(&self, threshold: f64) -> Result<TaskRecord, TaskServiceError> {
        self.create(TaskStatus::Queued, "Task queued for processing...", threshold)
    }

    fn create(
        &self,
        status: TaskStatus,
        message: &str,
        threshold: f64,
    ) -> Result<TaskRecord, TaskServiceError> {
        let task = TaskRecord::new(status, message, threshold);
        self.store.put(task.clone()).map_err(|e| {
            error!("Failed to store new task {}: {}", task.id, e);
            e
        })?;
        info!("Task {} created ({})", task.id, status);
        Ok(task)
    }

    pub fn get(&self, id: Uuid) -> Result<TaskRecord, TaskServiceError> {
        self.store.get(id)?.ok_or(TaskServiceError::NotFound(id))
    }

    /// Tasks sorted newest first, optionally filtered by status, at most `limit` of them.
    pub fn list(
        &self,
        limit: usize,
        status: Option<TaskStatus>,
    ) -> Result<Vec<TaskRecord>, TaskServiceError> {
        let mut tasks: Vec<TaskRecord> = self
            .store
            .list()?
            .into_iter()
            .filter(|task| status.is_none_or(|s| task.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        debug!("Listing {} task(s)", tasks.len());
        Ok(tasks)
    }

    pub fn delete(&self, id: Uuid) -> Result<TaskRecord, TaskServiceError> {
        let task = self.store.delete(id)?.ok_or(TaskServiceError::NotFound(id))?;
        info!("Task {} deleted", id);
        Ok(task)
    }

    pub fn mark_downloading(&self, id: Uuid) -> Result<TaskRecord, TaskServiceError> {
        self.transition(id, TaskStatus::Downloading, Some(10), "Downloading image...", None)
    }

    /// Moves the task into (or further along) `processing`.
    pub fn update_progress(
        &self,
        id: Uuid,
        progress: u8,
        message: &str,
    ) -> Result<TaskRecord, TaskServiceError> {
        self.transition(id, TaskStatus::Processing, Some(progress), message, None)
    }

    pub fn complete(
        &self,
        id: Uuid,
        result: SegmentationResult,
    ) -> Result<TaskRecord, TaskServiceError> {
        self.transition(
            id,
            TaskStatus::Completed,
            Some(100),
            "Segmentation completed",
            Some(result),
        )
    }

    /// Moves a live task to `error`, keeping its last progress value.
    pub fn fail(&self, id: Uuid, message: &str) -> Result<TaskRecord, TaskServiceError> {
        self.transition(id, TaskStatus::Error, None, message, None)
    }

    fn transition(
        &self,
        id: Uuid,
        to: TaskStatus,
        progress: Option<u8>,
        message: &str,
        result: Option<SegmentationResult>,
    ) -> Result<TaskRecord, TaskServiceError> {
        let mut rejected_from = None;
        let mut result = result;
        let updated = self.store.update(id, &mut |task| {
            if !can_transition(task.status, to) {
                rejected_from = Some(task.status);
                return;
            }
            task.status = to;
            if let Some(progress) = progress {
                task.progress = task.progress.max(progress.min(100));
            }
            task.message = message.to_string();
            if let Some(result) = result.take() {
                task.result = Some(result);
            }
        })?;

        let task = updated.ok_or_else(|| {
            warn!("Task {} not found for status update to {}", id, to);
            TaskServiceError::NotFound(id)
        })?;
        if let Some(from) = rejected_from {
            warn!("Rejected transition of task {} from {} to {}", id, from, to);
            return Err(TaskServiceError::InvalidTransition { id, from, to });
        }
        info!("Task {} -> {} ({}%): {}", id, to, task.progress, message);
        Ok(task)
    }
}
