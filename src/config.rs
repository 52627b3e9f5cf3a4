use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid setting {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Largest square input side accepted for the feature model.
pub const MAX_MODEL_INPUT_SIZE: u32 = 4096;

/// Which representation the pipeline computes for each image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureMode {
    Embedding,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub similarity_threshold: f32,
    pub recursive: bool,
    pub supported_formats: Vec<String>,
    pub feature_mode: FeatureMode,
    /// Degrade to perceptual hashes when the model is unavailable or a
    /// file has no embedding. When false, a missing model fails the scan.
    pub fallback_to_hash: bool,
    pub cache_enabled: bool,
    pub model_path: Option<PathBuf>,
    pub model_input_size: u32,
    pub prefer_gpu: bool,
    pub thumbnail_size: u32,
    pub thumbnail_cache_bytes: u64,
    pub parallel_workers: usize,
    pub thumbnail_concurrency: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 70.0,
            recursive: true,
            supported_formats: vec![
                "jpg".to_string(),
                "jpeg".to_string(),
                "png".to_string(),
                "bmp".to_string(),
                "gif".to_string(),
                "tiff".to_string(),
                "tif".to_string(),
                "webp".to_string(),
            ],
            feature_mode: FeatureMode::Embedding,
            fallback_to_hash: true,
            cache_enabled: true,
            model_path: None,
            model_input_size: 518,
            prefer_gpu: true,
            thumbnail_size: 256,
            thumbnail_cache_bytes: 256 * 1024 * 1024,
            parallel_workers: num_cpus::get(),
            thumbnail_concurrency: num_cpus::get() * 2,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid {
                field: "similarity_threshold",
                message: format!("{} is outside 0..=100", self.similarity_threshold),
            });
        }
        if self.supported_formats.is_empty() {
            return Err(ConfigError::Invalid {
                field: "supported_formats",
                message: "at least one extension is required".to_string(),
            });
        }
        for (field, value) in [
            ("model_input_size", self.model_input_size as u64),
            ("thumbnail_size", self.thumbnail_size as u64),
            ("thumbnail_cache_bytes", self.thumbnail_cache_bytes),
            ("parallel_workers", self.parallel_workers as u64),
            ("thumbnail_concurrency", self.thumbnail_concurrency as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.model_input_size > MAX_MODEL_INPUT_SIZE {
            return Err(ConfigError::Invalid {
                field: "model_input_size",
                message: format!(
                    "{} exceeds the maximum of {}",
                    self.model_input_size, MAX_MODEL_INPUT_SIZE
                ),
            });
        }
        Ok(())
    }
}
