use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MODEL_ID: &str = "ultralytics/yolov8n";
pub const MODEL_FILE_NAME: &str = "yolov8n.onnx";
pub const LOCKFILE_NAME: &str = "snapcrop-model-lock.json";
pub const MODEL_DIR_ENV: &str = "SNAPCROP_MODEL_DIR";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockFileEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLock {
    pub schema_version: u32,
    pub generated_at: String,
    pub model_id: String,
    pub source: String,
    pub file: LockFileEntry,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not determine a default model directory")]
    NoDefaultModelDir,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub root: PathBuf,
    pub model_file: PathBuf,
    pub lockfile: PathBuf,
    pub cache_downloads_dir: PathBuf,
}

impl ModelPaths {
    pub fn for_root(root: PathBuf) -> Self {
        Self {
            model_file: root.join(MODEL_FILE_NAME),
            lockfile: root.join(LOCKFILE_NAME),
            cache_downloads_dir: root.join("cache").join("downloads"),
            root,
        }
    }

    pub fn model_present(&self) -> bool {
        self.model_file.is_file()
    }
}

pub fn default_model_dir() -> Result<PathBuf, RegistryError> {
    let home = dirs::home_dir().ok_or(RegistryError::NoDefaultModelDir)?;
    Ok(home.join(".snapcrop").join("models"))
}

/// Picks the directory holding the weights: an explicit directory, then
/// `SNAPCROP_MODEL_DIR`, then the working directory if the weights sit
/// there, then `~/.snapcrop/models`.
pub fn resolve_model_root(model_dir: Option<&Path>) -> Result<PathBuf, RegistryError> {
    if let Some(dir) = model_dir {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = std::env::var_os(MODEL_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(cwd) = std::env::current_dir() {
        if cwd.join(MODEL_FILE_NAME).is_file() {
            return Ok(cwd);
        }
    }
    default_model_dir()
}

pub fn resolve_model_paths(model_dir: Option<&Path>) -> Result<ModelPaths, RegistryError> {
    Ok(ModelPaths::for_root(resolve_model_root(model_dir)?))
}

pub fn ensure_layout(paths: &ModelPaths) -> Result<(), RegistryError> {
    fs::create_dir_all(&paths.root)?;
    fs::create_dir_all(&paths.cache_downloads_dir)?;
    Ok(())
}

pub fn write_lockfile(paths: &ModelPaths, lock: &ModelLock) -> Result<(), RegistryError> {
    ensure_layout(paths)?;
    let data = serde_json::to_vec_pretty(lock)?;
    fs::write(&paths.lockfile, data)?;
    Ok(())
}

pub fn read_lockfile(paths: &ModelPaths) -> Result<ModelLock, RegistryError> {
    let data = fs::read(&paths.lockfile)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        let paths = resolve_model_paths(Some(dir.path())).unwrap();
        assert_eq!(paths.root, dir.path());
        assert_eq!(paths.model_file, dir.path().join("yolov8n.onnx"));
        assert!(!paths.model_present());
    }

    #[test]
    fn lockfile_is_written_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::for_root(dir.path().join("models"));
        let lock = ModelLock {
            schema_version: SCHEMA_VERSION,
            generated_at: "1700000000".to_string(),
            model_id: MODEL_ID.to_string(),
            source: "/tmp/yolov8n.onnx".to_string(),
            file: LockFileEntry {
                path: MODEL_FILE_NAME.to_string(),
                size: 12,
                sha256: "ab".repeat(32),
            },
        };
        write_lockfile(&paths, &lock).unwrap();

        assert!(paths.cache_downloads_dir.is_dir());
        let read_back = read_lockfile(&paths).unwrap();
        assert_eq!(read_back.model_id, MODEL_ID);
        assert_eq!(read_back.file, lock.file);
    }

    #[test]
    fn missing_lockfile_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ModelPaths::for_root(dir.path().to_path_buf());
        assert!(matches!(read_lockfile(&paths), Err(RegistryError::Io(_))));
    }
}
