use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Lifecycle state of a segmentation task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Uploading,
    Queued,
    Downloading,
    Processing,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SegmentationResult {
    pub vegetation_percentage: f64,
    pub processing_time: f64,
    pub method: String,
    pub result_mask_url: String,
    pub overlay_url: String,
    pub segmentation_url: String,
    /// `[height, width]` of the original, unpadded image.
    pub image_dimensions: [usize; 2],
    pub unique_classes: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskView {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SegmentationResult>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskView>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SegmentationResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

fn default_threshold() -> f64 {
    0.5
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImageUrlRequest {
    pub url: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelInfo {
    pub patch_size: usize,
    pub backbone: String,
    pub n_classes: usize,
    pub vegetation_classes: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServiceInfo {
    pub message: String,
    pub version: String,
    pub model_loaded: bool,
    pub model_info: Option<ModelInfo>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub model_loaded: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn status_parses_from_query_value() {
        assert_eq!(TaskStatus::from_str("completed").unwrap(), TaskStatus::Completed);
        assert_eq!(TaskStatus::from_str("downloading").unwrap(), TaskStatus::Downloading);
        assert!(TaskStatus::from_str("finished").is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        assert_eq!(TaskStatus::Error.to_string(), "error");
    }

    #[test]
    fn url_request_defaults_threshold() {
        let req: ImageUrlRequest =
            serde_json::from_str(r#"{"url":"https://example.com/a.png"}"#).unwrap();
        assert_eq!(req.threshold, 0.5);
    }

    #[test]
    fn only_completed_and_error_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }
}
