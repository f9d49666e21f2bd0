use std::cell::RefCell;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use image::{ImageReader, RgbImage};
use log::{debug, warn};
use ort::{inputs, session::Session, value::Tensor};
use snapcrop_core::{
    BoundingBox, CoreError, DetectionInput, Detector, ExecutionProvider, GpuBackendPreference, RuntimeConfig,
};
use snapcrop_model_registry::resolve_model_paths;

mod postprocess;
mod preprocess;

pub use postprocess::{decode_predictions, non_max_suppression};
pub use preprocess::{letterbox_tensor, Letterbox};

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const PLACEHOLDER_ENV: &str = "SNAPCROP_ALLOW_PLACEHOLDER";

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model_dir: Option<PathBuf>,
    pub execution_provider: ExecutionProvider,
    pub gpu_backend: GpuBackendPreference,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            model_dir: None,
            execution_provider: ExecutionProvider::Auto,
            gpu_backend: GpuBackendPreference::Auto,
            confidence_threshold: defaults.confidence_threshold,
            iou_threshold: defaults.iou_threshold,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

impl DetectorConfig {
    pub fn from_runtime_config(cfg: &RuntimeConfig) -> Result<Self, CoreError> {
        Ok(Self {
            model_dir: cfg.model_dir.clone().map(PathBuf::from),
            execution_provider: ExecutionProvider::parse(&cfg.execution_provider)?,
            gpu_backend: GpuBackendPreference::parse(&cfg.gpu_backend)?,
            confidence_threshold: cfg.confidence_threshold,
            iou_threshold: cfg.iou_threshold,
            input_size: DEFAULT_INPUT_SIZE,
        })
    }
}

/// YOLOv8 detector backed by ONNX Runtime.
#[derive(Debug, Clone, Default)]
pub struct OrtDetector {
    config: DetectorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ProviderChoice {
    Cpu,
    DirectML,
    Cuda,
    CoreML,
}

thread_local! {
    static SESSION_CACHE: RefCell<HashMap<String, Session>> = RefCell::new(HashMap::new());
}

impl OrtDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }
}

impl Detector for OrtDetector {
    fn detect(&self, input: &DetectionInput) -> Result<Vec<BoundingBox>, CoreError> {
        let model_file = match resolve_model_file(self.config.model_dir.as_deref()) {
            Ok(path) => path,
            Err(err) => {
                if placeholder_fallback_allowed() {
                    warn!("{}; {} is set, reporting no detections", err, PLACEHOLDER_ENV);
                    return Ok(Vec::new());
                }
                return Err(err);
            }
        };
        let image = load_input_image(input)?;
        let candidates = candidate_providers(self.config.execution_provider, self.config.gpu_backend);
        if candidates.is_empty() {
            return Err(CoreError::Detector("no execution providers available".to_string()));
        }
        run_detection(&image, &model_file, &candidates, &self.config).map_err(|e| CoreError::Detector(e.to_string()))
    }
}

/// Decodes the upload by content, not extension, and checks it against the
/// dimensions the caller already decoded.
fn load_input_image(input: &DetectionInput) -> Result<RgbImage, CoreError> {
    let read_err = |e: &dyn std::fmt::Display| CoreError::Detector(format!("reading {}: {}", input.image_path.display(), e));
    let image = ImageReader::open(&input.image_path)
        .map_err(|e| read_err(&e))?
        .with_guessed_format()
        .map_err(|e| read_err(&e))?
        .decode()
        .map_err(|e| read_err(&e))?
        .to_rgb8();
    if image.dimensions() != (input.width, input.height) {
        return Err(CoreError::Detector(format!(
            "{} is {}x{}, expected {}x{}",
            input.image_path.display(),
            image.width(),
            image.height(),
            input.width,
            input.height
        )));
    }
    Ok(image)
}

fn placeholder_fallback_allowed() -> bool {
    match env::var(PLACEHOLDER_ENV) {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        Err(_) => false,
    }
}

fn resolve_model_file(model_dir: Option<&Path>) -> Result<PathBuf, CoreError> {
    let paths = resolve_model_paths(model_dir).map_err(|e| CoreError::Detector(e.to_string()))?;
    if !paths.model_present() {
        return Err(CoreError::Detector(format!(
            "model weights not found at {}; install them with `snapcrop models install --from <path|url>`",
            paths.model_file.display()
        )));
    }
    Ok(paths.model_file)
}

fn run_detection(
    image: &RgbImage,
    model_file: &Path,
    candidates: &[ProviderChoice],
    config: &DetectorConfig,
) -> Result<Vec<BoundingBox>> {
    SESSION_CACHE.with(|cache| {
        let mut cache_ref = cache.borrow_mut();
        let provider = select_session(&mut cache_ref, model_file, candidates)?;
        let session = cache_ref
            .get_mut(&session_cache_key(model_file, provider))
            .ok_or_else(|| anyhow!("session cache failed to initialize"))?;
        debug!("running {} on {}", model_file.display(), provider_label(provider));
        run_onnx_detection(image, session, config)
    })
}

/// First provider whose session builds. Inference itself is not retried on
/// another provider.
fn select_session(
    cache: &mut HashMap<String, Session>,
    model_file: &Path,
    candidates: &[ProviderChoice],
) -> Result<ProviderChoice> {
    let mut errors = Vec::new();
    for provider in candidates {
        let key = session_cache_key(model_file, *provider);
        if cache.contains_key(&key) {
            return Ok(*provider);
        }
        match build_session_for_provider(model_file, *provider) {
            Ok(session) => {
                cache.insert(key, session);
                return Ok(*provider);
            }
            Err(err) => {
                warn!("{} session failed to build: {}", provider_label(*provider), err);
                errors.push(format!("{}: {}", provider_label(*provider), err));
            }
        }
    }
    Err(anyhow!("no execution provider could load the model: {}", errors.join(" | ")))
}

fn run_onnx_detection(image: &RgbImage, session: &mut Session, config: &DetectorConfig) -> Result<Vec<BoundingBox>> {
    let (width, height) = image.dimensions();
    let (data, letterbox) = letterbox_tensor(image, config.input_size);
    let size = config.input_size as usize;
    let input_tensor = Tensor::<f32>::from_array(([1usize, 3, size, size], data))?;
    let outputs = session.run(inputs![input_tensor])?;
    if outputs.len() == 0 {
        return Err(anyhow!("model returned no outputs"));
    }
    let view = outputs[0].try_extract_array::<f32>()?;
    let raw = decode_predictions(&view, &letterbox, width, height, config.confidence_threshold)?;
    let kept = non_max_suppression(raw, config.iou_threshold);
    debug!("{} detections after nms", kept.len());
    Ok(kept)
}

fn session_cache_key(model_file: &Path, provider: ProviderChoice) -> String {
    format!(
        "{}|{}|{}",
        model_file.display(),
        provider_label(provider),
        env::var("ORT_DYLIB_PATH").unwrap_or_default()
    )
}

fn candidate_providers(execution_provider: ExecutionProvider, gpu_backend: GpuBackendPreference) -> Vec<ProviderChoice> {
    let mut out = Vec::new();
    match execution_provider {
        ExecutionProvider::Cpu => out.push(ProviderChoice::Cpu),
        ExecutionProvider::Gpu | ExecutionProvider::Auto => {
            out.extend(gpu_candidates(gpu_backend));
            out.push(ProviderChoice::Cpu);
        }
    }
    dedup_providers(out)
}

fn gpu_candidates(pref: GpuBackendPreference) -> Vec<ProviderChoice> {
    match pref {
        GpuBackendPreference::DirectML => vec![ProviderChoice::DirectML],
        GpuBackendPreference::Cuda => vec![ProviderChoice::Cuda],
        GpuBackendPreference::CoreML => vec![ProviderChoice::CoreML],
        GpuBackendPreference::Auto => platform_gpu_defaults(),
    }
}

fn platform_gpu_defaults() -> Vec<ProviderChoice> {
    let mut providers = Vec::new();
    if cuda_likely_available() {
        providers.push(ProviderChoice::Cuda);
    }
    if cfg!(target_os = "windows") {
        providers.push(ProviderChoice::DirectML);
    }
    if cfg!(target_os = "macos") {
        providers.push(ProviderChoice::CoreML);
    }
    providers
}

fn cuda_likely_available() -> bool {
    cuda_driver_candidates().iter().any(|candidate| candidate.exists())
}

fn cuda_driver_candidates() -> Vec<PathBuf> {
    if cfg!(target_os = "windows") {
        let mut out: Vec<PathBuf> = env::var_os("WINDIR")
            .map(|dir| PathBuf::from(dir).join("System32").join("nvcuda.dll"))
            .into_iter()
            .collect();
        if let Some(path) = env::var_os("PATH") {
            out.extend(env::split_paths(&path).map(|dir| dir.join("nvcuda.dll")));
        }
        out
    } else if cfg!(target_os = "linux") {
        [
            "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
            "/usr/lib64/libcuda.so.1",
            "/usr/lib/wsl/lib/libcuda.so.1",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    } else {
        Vec::new()
    }
}

fn dedup_providers(list: Vec<ProviderChoice>) -> Vec<ProviderChoice> {
    list.into_iter().fold(Vec::new(), |mut out, provider| {
        if !out.contains(&provider) {
            out.push(provider);
        }
        out
    })
}

fn provider_label(provider: ProviderChoice) -> &'static str {
    match provider {
        ProviderChoice::Cpu => "cpu",
        ProviderChoice::DirectML => "directml",
        ProviderChoice::Cuda => "cuda",
        ProviderChoice::CoreML => "coreml",
    }
}

fn build_session_for_provider(model_file: &Path, provider: ProviderChoice) -> Result<Session> {
    let builder = Session::builder()?;
    let builder = match provider {
        ProviderChoice::Cpu => builder,
        #[cfg(feature = "directml")]
        ProviderChoice::DirectML => builder.with_execution_providers([ort::ep::DirectML::default().build()])?,
        #[cfg(feature = "cuda")]
        ProviderChoice::Cuda => builder.with_execution_providers([ort::ep::CUDA::default().build()])?,
        #[cfg(feature = "coreml")]
        ProviderChoice::CoreML => builder.with_execution_providers([ort::ep::CoreML::default().build()])?,
        #[allow(unreachable_patterns)]
        other => return Err(anyhow!("{} support is not compiled in", provider_label(other))),
    };
    Ok(builder.commit_from_file(model_file)?)
}
