//! Registry of locally installed models.
//!
//! The zoo is a directory with one subdirectory per model:
//!
//! ```text
//! <zoo>/
//!   breast-tumor-resnet34.tcga-brca/
//!     config.json
//!     model.rten
//! ```
//!
//! The zoo location is `$WSINFER_ZOO_DIR` if set, otherwise `wsinfer-zoo` in
//! the user's cache directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::model_config::{ConfigError, ModelConfig};

/// Environment variable that overrides the zoo location.
pub const ZOO_DIR_ENV: &str = "WSINFER_ZOO_DIR";

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const MODEL_FILE_NAME: &str = "model.rten";

#[derive(Debug, thiserror::Error)]
pub enum ZooError {
    #[error("could not determine the model zoo directory; set WSINFER_ZOO_DIR")]
    NoZooDir,

    #[error("invalid model name \"{0}\"")]
    InvalidName(String),

    #[error("model not found: {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Return the directory that holds registered models.
pub fn zoo_dir() -> Result<PathBuf, ZooError> {
    if let Some(dir) = env::var_os(ZOO_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::cache_dir()
        .map(|dir| dir.join("wsinfer-zoo"))
        .ok_or(ZooError::NoZooDir)
}

/// A model's weights and configuration.
#[derive(Clone, Debug)]
pub struct ModelSource {
    /// Name in the zoo, if the model is registered.
    pub name: Option<String>,
    pub config_path: PathBuf,
    pub model_path: PathBuf,
    pub config: ModelConfig,
}

impl ModelSource {
    /// Create a source for a model that is not in the zoo.
    pub fn from_paths(config_path: &Path, model_path: &Path) -> Result<ModelSource, ZooError> {
        for path in [config_path, model_path] {
            if !path.is_file() {
                return Err(ZooError::NotFound(path.to_path_buf()));
            }
        }
        let config = ModelConfig::from_path(config_path)?;
        Ok(ModelSource {
            name: None,
            config_path: config_path.to_path_buf(),
            model_path: model_path.to_path_buf(),
            config,
        })
    }
}

fn check_name(name: &str) -> Result<(), ZooError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(ZooError::InvalidName(name.to_string()))
    }
}

/// Look up a registered model in the zoo directory `zoo`.
pub fn registered_model_in(zoo: &Path, name: &str) -> Result<ModelSource, ZooError> {
    check_name(name)?;
    let model_dir = zoo.join(name);
    if !model_dir.is_dir() {
        return Err(ZooError::NotFound(model_dir));
    }
    debug!("loading model {} from {}", name, model_dir.display());

    let mut source = ModelSource::from_paths(
        &model_dir.join(CONFIG_FILE_NAME),
        &model_dir.join(MODEL_FILE_NAME),
    )?;
    source.name = Some(name.to_string());
    Ok(source)
}

/// Look up a registered model in the default zoo.
pub fn get_registered_model(name: &str) -> Result<ModelSource, ZooError> {
    registered_model_in(&zoo_dir()?, name)
}

/// List the models in the zoo directory `zoo`, sorted by name.
///
/// A missing zoo directory has no models.
pub fn list_registered_models_in(zoo: &Path) -> Result<Vec<String>, ZooError> {
    if !zoo.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(zoo)? {
        let path = entry?.path();
        let complete = path.join(CONFIG_FILE_NAME).is_file() && path.join(MODEL_FILE_NAME).is_file();
        if !complete {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// List the models in the default zoo.
pub fn list_registered_models() -> Result<Vec<String>, ZooError> {
    list_registered_models_in(&zoo_dir()?)
}
