use image::{DynamicImage, ImageFormat};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactServiceError {
    #[error("Storage error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("Invalid file name")]
    InvalidFileName,
}

/// Rendered outputs of a finished segmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Result,
    Segmentation,
    Overlay,
}

impl ArtifactKind {
    fn suffix(&self) -> &'static str {
        match self {
            ArtifactKind::Result => "result",
            ArtifactKind::Segmentation => "segmentation",
            ArtifactKind::Overlay => "overlay",
        }
    }
}

/// Local-disk storage for uploaded inputs and rendered artifacts.
///
/// Every file is named `{task_id}_...`, so a task's files can be found and removed by prefix.
#[derive(Debug, Clone)]
pub struct ArtifactService {
    upload_dir: PathBuf,
    results_dir: PathBuf,
    url_prefix: String,
}

impl ArtifactService {
    pub fn new(upload_dir: PathBuf, results_dir: PathBuf) -> Self {
        Self {
            upload_dir,
            results_dir,
            url_prefix: "/results".to_string(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), ArtifactServiceError> {
        for dir in [&self.upload_dir, &self.results_dir] {
            fs::create_dir_all(dir).map_err(|source| ArtifactServiceError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Stores raw input bytes as `{upload_dir}/{task_id}_{filename}`.
    pub fn save_upload(
        &self,
        task_id: Uuid,
        filename: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, ArtifactServiceError> {
        let name = sanitize_filename(filename).ok_or(ArtifactServiceError::InvalidFileName)?;
        let path = self.upload_dir.join(format!("{}_{}", task_id, name));
        fs::write(&path, bytes).map_err(|source| ArtifactServiceError::Io {
            path: path.clone(),
            source,
        })?;
        log::info!("Saved {} bytes for task {} to {}", bytes.len(), task_id, path.display());
        Ok(path)
    }

    /// Writes a PNG artifact and returns its URL path.
    pub fn save_png(
        &self,
        task_id: Uuid,
        kind: ArtifactKind,
        image: &DynamicImage,
    ) -> Result<String, ArtifactServiceError> {
        let file_name = format!("{}_{}.png", task_id, kind.suffix());
        let path = self.results_dir.join(&file_name);
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|source| ArtifactServiceError::Encode {
                path: path.clone(),
                source,
            })?;
        log::debug!("Wrote artifact {}", path.display());
        Ok(format!("{}/{}", self.url_prefix, file_name))
    }

    /// Removes every upload and result file belonging to the task. Returns how many were removed.
    pub fn delete_task_files(&self, task_id: Uuid) -> Result<usize, ArtifactServiceError> {
        let prefix = format!("{}_", task_id);
        let mut removed = 0;
        for dir in [&self.upload_dir, &self.results_dir] {
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    log::warn!("Directory {} does not exist", dir.display());
                    continue;
                }
                Err(source) => {
                    return Err(ArtifactServiceError::Io {
                        path: dir.clone(),
                        source,
                    });
                }
            };
            for entry in entries.flatten() {
                let owned = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with(&prefix));
                if !owned {
                    continue;
                }
                let path = entry.path();
                fs::remove_file(&path)
                    .map_err(|source| ArtifactServiceError::Io { path: path.clone(), source })?;
                removed += 1;
            }
        }
        log::info!("Removed {} file(s) for task {}", removed, task_id);
        Ok(removed)
    }
}

/// Keeps only the final path component, dropping separators and parent references.
fn sanitize_filename(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Lower-cased extension of a client-supplied file name.
pub fn file_extension(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
