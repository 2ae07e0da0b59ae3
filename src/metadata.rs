//! Provenance of an inference run.
//!
//! Each run writes `run_metadata_<timestamp>.json` to the results directory
//! with the model that was used and details of the runtime environment.

use std::env;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::debug;

use crate::model_config::ModelConfig;
use crate::zoo::ModelSource;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize run metadata: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelInfo {
    pub config: ModelConfig,
    pub model_path: PathBuf,
    pub config_path: PathBuf,
    pub registered_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GitInfo {
    pub git_remote: Option<String>,
    pub git_branch: String,
    pub git_commit: String,
    pub uncommitted_changes: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct RuntimeInfo {
    pub wsinfer_version: String,
    pub executable: Option<PathBuf>,
    pub os: String,
    pub arch: String,
    pub num_threads: usize,
    pub git: Option<GitInfo>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunMetadata {
    pub model: ModelInfo,
    pub runtime: RuntimeInfo,
    pub timestamp: String,
}

/// Run `git` in `dir` and return its trimmed stdout, or `None` if it could
/// not be run or failed.
fn git(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Describe the git checkout containing `dir`.
///
/// Returns `None` if git is not installed or `dir` is not in a repository.
pub fn git_info(dir: &Path) -> Option<GitInfo> {
    let git_commit = git(dir, &["rev-parse", "HEAD"])?;
    let git_branch = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    let git_remote = git(dir, &["config", "--get", "remote.origin.url"]).filter(|r| !r.is_empty());
    let status = git(dir, &["status", "--porcelain"])?;
    Some(GitInfo {
        git_remote,
        git_branch,
        git_commit,
        uncommitted_changes: !status.is_empty(),
    })
}

/// Collect metadata for a run that used `source`, timestamped `now`.
pub fn run_metadata(source: &ModelSource, now: DateTime<Local>) -> RunMetadata {
    let git = env::current_dir().ok().and_then(|dir| git_info(&dir));
    if git.is_none() {
        debug!("git information is not available");
    }

    RunMetadata {
        model: ModelInfo {
            config: source.config.clone(),
            model_path: source.model_path.clone(),
            config_path: source.config_path.clone(),
            registered_name: source.name.clone(),
        },
        runtime: RuntimeInfo {
            wsinfer_version: env!("CARGO_PKG_VERSION").to_string(),
            executable: env::current_exe().ok(),
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            num_threads: rayon::current_num_threads(),
            git,
        },
        timestamp: now.to_rfc3339(),
    }
}

/// Write `metadata` to a new `run_metadata_<timestamp>.json` in
/// `results_dir` and return its path.
///
/// If a file for the same second already exists, a numeric suffix is added
/// rather than replacing it.
pub fn write_run_metadata(
    results_dir: &Path,
    metadata: &RunMetadata,
    now: DateTime<Local>,
) -> Result<PathBuf, MetadataError> {
    let stamp = now.format("%Y%m%dT%H%M%S").to_string();
    let mut path = results_dir.join(format!("run_metadata_{}.json", stamp));
    let mut suffix = 1;
    while path.exists() {
        path = results_dir.join(format!("run_metadata_{}_{}.json", stamp, suffix));
        suffix += 1;
    }

    let mut writer = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut writer, metadata)?;
    writer.flush()?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Local, TimeZone};
    use serde_json::Value;

    use super::{git_info, run_metadata, write_run_metadata};
    use crate::model_config::ModelConfig;
    use crate::transforms::Transform;
    use crate::zoo::ModelSource;

    fn source() -> ModelSource {
        ModelSource {
            name: Some("tumor-model".into()),
            config_path: PathBuf::from("zoo/tumor-model/config.json"),
            model_path: PathBuf::from("zoo/tumor-model/model.rten"),
            config: ModelConfig {
                spec_version: "1.0".into(),
                architecture: "resnet34".into(),
                num_classes: 2,
                class_names: vec!["notumor".into(), "tumor".into()],
                patch_size_pixels: 350,
                spacing_um_px: 0.25,
                transform: vec![Transform::ToTensor],
            },
        }
    }

    #[test]
    fn test_write_run_metadata() {
        let tmp = tempfile::tempdir().unwrap();
        let first = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let second = Local.with_ymd_and_hms(2024, 3, 1, 12, 30, 6).unwrap();

        let path = write_run_metadata(tmp.path(), &run_metadata(&source(), first), first).unwrap();
        assert_eq!(path, tmp.path().join("run_metadata_20240301T123005.json"));

        let json: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let mut keys: Vec<_> = json.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, ["model", "runtime", "timestamp"]);
        assert_eq!(json["model"]["registered_name"], "tumor-model");
        assert_eq!(json["model"]["config"]["class_names"][1], "tumor");
        assert_eq!(json["runtime"]["wsinfer_version"], env!("CARGO_PKG_VERSION"));
        assert!(json["runtime"].get("git").is_some());
        assert!(json["timestamp"].as_str().unwrap().starts_with("2024-03-01T12:30:05"));

        // A run in a later second gets its own file, and a run in the same
        // second does not replace the earlier one.
        write_run_metadata(tmp.path(), &run_metadata(&source(), second), second).unwrap();
        let dup = write_run_metadata(tmp.path(), &run_metadata(&source(), first), first).unwrap();
        assert_eq!(dup, tmp.path().join("run_metadata_20240301T123005_1.json"));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 3);
    }

    #[test]
    fn test_git_info_outside_repository() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(git_info(&tmp.path().join("missing")), None);
    }
}
