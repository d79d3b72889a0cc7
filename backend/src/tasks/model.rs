use chrono::{DateTime, Utc};
use shared::{SegmentationResult, TaskStatus, TaskView};
use uuid::Uuid;

/// Server-side state of one segmentation request.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: Uuid,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub threshold: f64,
    pub result: Option<SegmentationResult>,
}

impl TaskRecord {
    pub fn new(status: TaskStatus, message: impl Into<String>, threshold: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            status,
            progress: 0,
            message: message.into(),
            created_at: Utc::now(),
            threshold,
            result: None,
        }
    }

    pub fn to_view(&self) -> TaskView {
        TaskView {
            task_id: self.id,
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            created_at: self.created_at,
            result: self.result.clone(),
        }
    }
}

/// Whether the lifecycle allows moving from `from` to `to`.
///
/// Staying in `processing` is allowed so progress can advance; terminal states never move.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (_, Error) => true,
        (Uploading, Processing) => true,
        (Queued, Downloading) => true,
        (Downloading, Processing) => true,
        (Processing, Processing | Completed) => true,
        _ => false,
    }
}
