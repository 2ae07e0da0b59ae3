//! Model configuration files.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::transforms::{validate_transforms, Transform};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read model config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse model config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid model config: {0}")]
    Invalid(String),
}

/// Describes a patch classification model: its classes, the size and
/// physical spacing of its input patches and the preprocessing it expects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub spec_version: String,
    pub architecture: String,
    pub num_classes: usize,
    pub class_names: Vec<String>,

    /// Patch width and height in pixels at `spacing_um_px`.
    pub patch_size_pixels: u32,

    /// Micrometers per pixel of the training patches.
    pub spacing_um_px: f64,

    pub transform: Vec<Transform>,
}

impl ModelConfig {
    /// Parse and validate a config from a JSON string.
    pub fn from_json(json: &str) -> Result<ModelConfig, ConfigError> {
        let config: ModelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a config from a JSON file.
    pub fn from_path(path: &Path) -> Result<ModelConfig, ConfigError> {
        let json = fs::read_to_string(path)?;
        ModelConfig::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::Invalid("num_classes must be positive".into()));
        }
        if self.num_classes != self.class_names.len() {
            return Err(ConfigError::Invalid(format!(
                "num_classes is {} but {} class names were given",
                self.num_classes,
                self.class_names.len()
            )));
        }
        let mut seen = HashSet::new();
        for name in &self.class_names {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate class name \"{}\"",
                    name
                )));
            }
        }
        if self.patch_size_pixels == 0 {
            return Err(ConfigError::Invalid(
                "patch_size_pixels must be positive".into(),
            ));
        }
        if !(self.spacing_um_px > 0.) {
            return Err(ConfigError::Invalid("spacing_um_px must be positive".into()));
        }
        if self.transform.is_empty() {
            return Err(ConfigError::Invalid("transform list is empty".into()));
        }
        validate_transforms(&self.transform).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
