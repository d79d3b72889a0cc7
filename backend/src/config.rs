use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid environment override {key}={value}")]
    InvalidOverride { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
    pub upload_dir: PathBuf,
    pub results_dir: PathBuf,
    pub patch_size: usize,
    pub backbone: String,
    pub n_classes: usize,
    pub vegetation_classes: Vec<u8>,
    pub batch_size: usize,
    pub max_upload_bytes: usize,
    pub allowed_extensions: Vec<String>,
    pub download_timeout_secs: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub overlay_alpha: f32,
    pub highlight_color: [u8; 3],
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            model_path: PathBuf::from("models/model7.pt"),
            upload_dir: PathBuf::from("uploads"),
            results_dir: PathBuf::from("results"),
            patch_size: 512,
            backbone: "resnet34".to_string(),
            n_classes: 7,
            vegetation_classes: vec![1, 2, 3, 4, 5, 6],
            batch_size: 8,
            max_upload_bytes: 50 * 1024 * 1024,
            allowed_extensions: ["jpg", "jpeg", "png", "tif", "tiff"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            download_timeout_secs: 30,
            workers: 2,
            queue_capacity: 64,
            overlay_alpha: 0.7,
            highlight_color: [0, 255, 0],
        }
    }
}

impl AppConfig {
    /// Loads the YAML config, then applies environment overrides.
    ///
    /// The file is looked up at `VEGSEG_CONFIG`, then `config/segmentation.yaml` next to the
    /// workspace root. A missing file is not an error: defaults are used instead.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            log::warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = env::var("VEGSEG_CONFIG") {
            return PathBuf::from(path);
        }
        match env::var("CARGO_MANIFEST_DIR") {
            Ok(manifest_dir) => PathBuf::from(manifest_dir).join("../config/segmentation.yaml"),
            Err(_) => PathBuf::from("config/segmentation.yaml"),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = env::var("HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            self.port = port.parse().map_err(|_| ConfigError::InvalidOverride {
                key: "PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Ok(model_path) = env::var("MODEL_PATH") {
            self.model_path = PathBuf::from(model_path);
        }
        if let Ok(upload_dir) = env::var("UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(upload_dir);
        }
        if let Ok(results_dir) = env::var("RESULTS_DIR") {
            self.results_dir = PathBuf::from(results_dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.patch_size == 0 {
            return Err(ConfigError::Invalid("patch_size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "workers and queue_capacity must be positive".into(),
            ));
        }
        if self.n_classes < 2 || self.n_classes > usize::from(u8::MAX) + 1 {
            return Err(ConfigError::Invalid(format!(
                "n_classes must be within 2..=256, got {}",
                self.n_classes
            )));
        }
        if let Some(class) = self
            .vegetation_classes
            .iter()
            .find(|&&c| c == 0 || usize::from(c) >= self.n_classes)
        {
            return Err(ConfigError::Invalid(format!(
                "vegetation class {} is outside 1..{}",
                class, self.n_classes
            )));
        }
        if !(0.0..=1.0).contains(&self.overlay_alpha) {
            return Err(ConfigError::Invalid(format!(
                "overlay_alpha must be within [0, 1], got {}",
                self.overlay_alpha
            )));
        }
        Ok(())
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_allowed_extension(&self, extension: &str) -> bool {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.patch_size, 512);
        assert_eq!(config.vegetation_classes, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml("patch_size: 256\nbatch_size: 4\n").unwrap();
        assert_eq!(config.patch_size, 256);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.n_classes, 7);
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn rejects_background_as_vegetation() {
        let config = AppConfig::from_yaml("vegetation_classes: [0, 1]\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_class_beyond_class_count() {
        let config = AppConfig::from_yaml("n_classes: 3\nvegetation_classes: [1, 3]\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_patch_size() {
        let config = AppConfig::from_yaml("patch_size: 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let config = AppConfig::default();
        assert!(config.is_allowed_extension("TIF"));
        assert!(config.is_allowed_extension(".png"));
        assert!(!config.is_allowed_extension("gif"));
    }
}
