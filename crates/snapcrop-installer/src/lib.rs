use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use log::info;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snapcrop_model_registry::{
    ensure_layout, read_lockfile, resolve_model_paths, write_lockfile, LockFileEntry, ModelLock, ModelPaths, MODEL_FILE_NAME, MODEL_ID,
    SCHEMA_VERSION,
};
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub model_dir: Option<PathBuf>,
    /// Local path or http(s) URL of a `yolov8n.onnx` export.
    pub source: String,
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReport {
    pub model_dir: PathBuf,
    pub model_file: PathBuf,
    pub installed: bool,
    pub size: u64,
    pub sha256: String,
    pub lockfile_written: bool,
}

pub fn install_model(request: &InstallRequest) -> Result<InstallReport> {
    let paths = resolve_model_paths(request.model_dir.as_deref())?;
    ensure_layout(&paths)?;

    let installed = if paths.model_present() && !request.force {
        info!("{} already present in {}", MODEL_FILE_NAME, paths.root.display());
        false
    } else if is_remote(&request.source) {
        download_file(&request.source, &paths)?;
        true
    } else {
        copy_local(Path::new(&request.source), &paths)?;
        true
    };

    let size = fs::metadata(&paths.model_file)?.len();
    let sha256 = sha256_file(&paths.model_file)?;
    let generated_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string());
    write_lockfile(
        &paths,
        &ModelLock {
            schema_version: SCHEMA_VERSION,
            generated_at,
            model_id: MODEL_ID.to_string(),
            source: request.source.clone(),
            file: LockFileEntry {
                path: MODEL_FILE_NAME.to_string(),
                size,
                sha256: sha256.clone(),
            },
        },
    )?;

    Ok(InstallReport {
        model_dir: paths.root,
        model_file: paths.model_file,
        installed,
        size,
        sha256,
        lockfile_written: true,
    })
}

pub fn verify_model(model_dir: Option<PathBuf>) -> Result<ModelLock> {
    let paths = resolve_model_paths(model_dir.as_deref())?;
    let lock = read_lockfile(&paths).with_context(|| format!("reading lockfile in {}", paths.root.display()))?;
    let file_path = paths.root.join(&lock.file.path);
    if !file_path.exists() {
        return Err(anyhow!("missing model file for {}: {}", lock.model_id, file_path.display()));
    }
    let size = fs::metadata(&file_path)?.len();
    if size != lock.file.size {
        return Err(anyhow!(
            "size mismatch for {} {}: expected {}, got {}",
            lock.model_id,
            lock.file.path,
            lock.file.size,
            size
        ));
    }
    if sha256_file(&file_path)? != lock.file.sha256 {
        return Err(anyhow!("checksum mismatch for {} {}", lock.model_id, lock.file.path));
    }
    Ok(lock)
}

fn is_remote(source: &str) -> bool {
    let lower = source.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn copy_local(source: &Path, paths: &ModelPaths) -> Result<()> {
    let mut input = File::open(source).with_context(|| format!("opening {}", source.display()))?;
    let mut staged = NamedTempFile::new_in(&paths.cache_downloads_dir).context("staging model copy")?;
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = input.read(&mut buf)?;
        if read == 0 {
            break;
        }
        staged.write_all(&buf[..read])?;
    }
    staged.flush()?;
    staged
        .persist(&paths.model_file)
        .map_err(|e| anyhow!("moving model into place: {}", e))?;
    info!("copied {} to {}", source.display(), paths.model_file.display());
    Ok(())
}

fn http_client() -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("snapcrop-installer/0.1"));
    Ok(Client::builder().default_headers(headers).build()?)
}

fn download_file(url: &str, paths: &ModelPaths) -> Result<()> {
    let client = http_client()?;
    let partial_path = paths.cache_downloads_dir.join(format!("{}.part", MODEL_FILE_NAME));
    let resume_from = fs::metadata(&partial_path).map(|m| m.len()).unwrap_or(0);
    let mut response = if resume_from > 0 {
        client
            .get(url)
            .header(RANGE, format!("bytes={}-", resume_from))
            .send()?
    } else {
        client.get(url).send()?
    };
    let resuming = resume_from > 0 && response.status().as_u16() == 206;
    if resume_from > 0 && !resuming {
        let _ = fs::remove_file(&partial_path);
        if response.status().as_u16() != 200 {
            response = client.get(url).send()?;
        }
    }
    if !response.status().is_success() {
        return Err(anyhow!("failed downloading {}: {}", url, response.status()));
    }

    let mut file = if resuming {
        fs::OpenOptions::new().append(true).open(&partial_path)?
    } else {
        File::create(&partial_path)?
    };
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = response.read(&mut buf)?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])?;
    }
    file.flush()?;
    fs::rename(&partial_path, &paths.model_file)?;
    info!("downloaded {} to {}", url, paths.model_file.display());
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
