//! Failures of a segmentation job, as reported on its task record.

use thiserror::Error;

use crate::segmentation::loader::LoaderError;
use crate::segmentation::model::InferenceError;
use crate::segmentation::reconstruct::ReconstructError;
use crate::segmentation::tiler::TileError;
use crate::storage::artifact_service::ArtifactServiceError;
use crate::tasks::task_service::TaskServiceError;

pub type Result<T> = std::result::Result<T, ProcessingError>;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Model not loaded: {0}")]
    ModelUnavailable(String),

    #[error("Unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    #[error("Download failed: {0}")]
    DownloadFailure(String),

    #[error("{0}")]
    InternalProcessingError(String),
}

impl ProcessingError {
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::InternalProcessingError(msg.into())
    }

    pub fn download<S: Into<String>>(msg: S) -> Self {
        Self::DownloadFailure(msg.into())
    }
}

impl From<InferenceError> for ProcessingError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::ModelUnavailable(msg) => Self::ModelUnavailable(msg),
            other => Self::InternalProcessingError(other.to_string()),
        }
    }
}

impl From<LoaderError> for ProcessingError {
    fn from(err: LoaderError) -> Self {
        match err {
            LoaderError::Io(e) => Self::InternalProcessingError(e.to_string()),
            other => Self::UnsupportedImageFormat(other.to_string()),
        }
    }
}

impl From<TileError> for ProcessingError {
    fn from(err: TileError) -> Self {
        Self::InternalProcessingError(format!("Tiling failed: {}", err))
    }
}

impl From<ReconstructError> for ProcessingError {
    fn from(err: ReconstructError) -> Self {
        Self::InternalProcessingError(format!("Reconstruction failed: {}", err))
    }
}

impl From<ArtifactServiceError> for ProcessingError {
    fn from(err: ArtifactServiceError) -> Self {
        Self::InternalProcessingError(err.to_string())
    }
}

impl From<TaskServiceError> for ProcessingError {
    fn from(err: TaskServiceError) -> Self {
        Self::InternalProcessingError(format!("Task update failed: {}", err))
    }
}

impl From<reqwest::Error> for ProcessingError {
    fn from(err: reqwest::Error) -> Self {
        Self::DownloadFailure(err.to_string())
    }
}

impl From<actix_web::error::BlockingError> for ProcessingError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        Self::InternalProcessingError(format!("Worker thread failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_unavailable_keeps_its_category() {
        let err: ProcessingError = InferenceError::ModelUnavailable("gone".into()).into();
        assert!(matches!(err, ProcessingError::ModelUnavailable(_)));
        let err: ProcessingError = InferenceError::InvalidBatchSize.into();
        assert!(matches!(err, ProcessingError::InternalProcessingError(_)));
    }

    #[test]
    fn decode_failures_are_format_errors() {
        let err: ProcessingError = LoaderError::Unrecognized.into();
        assert!(matches!(err, ProcessingError::UnsupportedImageFormat(_)));
    }
}
