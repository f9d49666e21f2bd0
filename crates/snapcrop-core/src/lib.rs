use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod planner;
mod preset;

pub use planner::{largest_box, plan_crop, resolve_center, BoundingBox, CenterChoice, CenterSource, CropRectangle, Point};
pub use preset::{AspectPreset, AspectRatio, WidthBounds, DEFAULT_TARGET_WIDTH, MIN_TARGET_WIDTH, TARGET_WIDTH_STEP};

pub const NO_DETECTION_WARNING: &str = "no object detected; cropping around the image center";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionProvider {
    Auto,
    Gpu,
    Cpu,
}

impl ExecutionProvider {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "gpu" => Ok(Self::Gpu),
            "cpu" => Ok(Self::Cpu),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown execution provider '{}'; expected one of: auto, gpu, cpu",
                other
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuBackendPreference {
    Auto,
    DirectML,
    Cuda,
    CoreML,
}

impl GpuBackendPreference {
    pub fn parse(value: &str) -> Result<Self, CoreError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "directml" => Ok(Self::DirectML),
            "cuda" => Ok(Self::Cuda),
            "coreml" | "metal" => Ok(Self::CoreML),
            other => Err(CoreError::InvalidRequest(format!(
                "unknown gpu backend '{}'; expected one of: auto, directml, cuda, coreml",
                other
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::DirectML => "directml",
            Self::Cuda => "cuda",
            Self::CoreML => "coreml",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformTarget {
    Cli,
    Tauri,
}

/// Dimensions of one decoded upload plus the crop the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropRequest {
    pub image_width: u32,
    pub image_height: u32,
    pub target_width: u32,
    pub aspect_ratio: AspectRatio,
}

impl CropRequest {
    pub fn target_height(&self) -> u32 {
        self.aspect_ratio.target_height(self.target_width)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image_width == 0 || self.image_height == 0 {
            return Err(CoreError::InvalidRequest("image has no pixels".to_string()));
        }
        if self.target_width == 0 || self.target_width > self.image_width {
            return Err(CoreError::InvalidRequest(format!(
                "target width {} must be within 1..={}",
                self.target_width, self.image_width
            )));
        }
        if !self.aspect_ratio.is_valid() {
            return Err(CoreError::InvalidRequest(format!(
                "aspect ratio {} must have positive components",
                self.aspect_ratio
            )));
        }
        Ok(())
    }
}

/// What the detector gets to look at: the upload as written to the request
/// workspace, plus the dimensions the caller decoded. Detectors reject a file
/// whose decoded size disagrees with them.
#[derive(Debug, Clone)]
pub struct DetectionInput {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

pub trait Detector: Send + Sync {
    /// Boxes in detector order. An empty list is a valid answer.
    fn detect(&self, input: &DetectionInput) -> Result<Vec<BoundingBox>, CoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropPlan {
    pub target_width: u32,
    pub target_height: u32,
    pub center: Point,
    pub center_source: CenterSource,
    pub detections: Vec<BoundingBox>,
    pub crop: CropRectangle,
}

impl CropPlan {
    pub fn used_fallback(&self) -> bool {
        self.center_source == CenterSource::ImageCenter
    }

    pub fn warning(&self) -> Option<&'static str> {
        self.used_fallback().then_some(NO_DETECTION_WARNING)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub width_bounds: WidthBounds,
}

impl ImageInfo {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            width_bounds: WidthBounds::for_image(width),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEventType {
    DecodeSuccess,
    DecodeError,
    DetectStart,
    DetectSuccess,
    DetectFallback,
    DetectError,
    CropSuccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub platform: PlatformTarget,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

pub fn emit_event(
    telemetry: Option<&dyn TelemetrySink>,
    platform: PlatformTarget,
    event_type: TelemetryEventType,
    duration_ms: Option<u64>,
    detail: Option<String>,
) {
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type,
            platform,
            duration_ms,
            detail,
        });
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to decode image: {0}")]
    Decode(String),
    #[error("object detector failed: {0}")]
    Detector(String),
    #[error("invalid crop request: {0}")]
    InvalidRequest(String),
    #[error("failed to encode cropped image: {0}")]
    Encode(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    DecodeError,
    DetectorError,
    InvalidRequest,
    EncodeError,
    IoError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Decode(_) => ErrorCode::DecodeError,
            Self::Detector(_) => ErrorCode::DetectorError,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::Encode(_) => ErrorCode::EncodeError,
            Self::Io(_) => ErrorCode::IoError,
        }
    }

    pub fn as_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub model_dir: Option<String>,
    pub execution_provider: String,
    pub gpu_backend: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            execution_provider: "auto".to_string(),
            gpu_backend: "auto".to_string(),
            confidence_threshold: 0.25,
            iou_threshold: 0.7,
        }
    }
}

fn usable_threshold(value: f32) -> bool {
    value.is_finite() && value > 0.0 && value <= 1.0
}

pub fn resolve_runtime_config(overrides: RuntimeConfig) -> RuntimeConfig {
    let mut cfg = RuntimeConfig::default();
    if !overrides.execution_provider.trim().is_empty() {
        cfg.execution_provider = overrides.execution_provider;
    }
    if !overrides.gpu_backend.trim().is_empty() {
        cfg.gpu_backend = overrides.gpu_backend;
    }
    if usable_threshold(overrides.confidence_threshold) {
        cfg.confidence_threshold = overrides.confidence_threshold;
    }
    if usable_threshold(overrides.iou_threshold) {
        cfg.iou_threshold = overrides.iou_threshold;
    }
    cfg.model_dir = overrides.model_dir.filter(|dir| !dir.trim().is_empty());
    cfg
}

pub mod v1 {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CropImageRequest {
        pub image_bytes: Vec<u8>,
        pub file_name: String,
        pub preset: String,
        pub target_width: Option<u32>,
        pub model_dir: Option<String>,
        pub execution_provider: Option<String>,
        pub gpu_backend: Option<String>,
        pub confidence_threshold: Option<f32>,
        pub iou_threshold: Option<f32>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CropImageResponse {
        pub file_name: String,
        pub mime_type: String,
        pub image_bytes: Vec<u8>,
        pub source_width: u32,
        pub source_height: u32,
        pub preset: String,
        pub plan: CropPlan,
        pub warning: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PresetInfo {
        pub slug: String,
        pub label: String,
        pub ratio: String,
    }

    impl From<AspectPreset> for PresetInfo {
        fn from(preset: AspectPreset) -> Self {
            Self {
                slug: preset.slug().to_string(),
                label: preset.label().to_string(),
                ratio: preset.ratio().to_string(),
            }
        }
    }

    pub fn presets() -> Vec<PresetInfo> {
        AspectPreset::all().into_iter().map(PresetInfo::from).collect()
    }
}

/// Runs the detector once, picks the crop center and plans the rectangle.
/// Zero detections is the image-center fallback; a detector error is returned
/// as is.
pub fn plan_with_detector(
    detector: &dyn Detector,
    request: &CropRequest,
    input: &DetectionInput,
    platform: PlatformTarget,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<CropPlan, CoreError> {
    request.validate()?;
    let target_height = request.target_height();
    let start = Instant::now();
    emit_event(telemetry, platform, TelemetryEventType::DetectStart, None, None);

    let detections = match detector.detect(input) {
        Ok(boxes) => boxes,
        Err(err) => {
            warn!("detector failed on {}: {}", input.image_path.display(), err);
            emit_event(
                telemetry,
                platform,
                TelemetryEventType::DetectError,
                Some(start.elapsed().as_millis() as u64),
                Some(err.to_string()),
            );
            return Err(err);
        }
    };
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let choice = resolve_center(request.image_width, request.image_height, &detections);
    match choice.source {
        CenterSource::Detection { index } => {
            debug!(
                "{} detections, centering on #{} at ({}, {})",
                detections.len(),
                index,
                choice.center.x,
                choice.center.y
            );
            emit_event(
                telemetry,
                platform,
                TelemetryEventType::DetectSuccess,
                Some(elapsed_ms),
                Some(format!("detections={},chosen={}", detections.len(), index)),
            );
        }
        CenterSource::ImageCenter => {
            info!("{}", NO_DETECTION_WARNING);
            emit_event(
                telemetry,
                platform,
                TelemetryEventType::DetectFallback,
                Some(elapsed_ms),
                None,
            );
        }
    }

    let crop = plan_crop(
        request.image_width,
        request.image_height,
        choice.center.x,
        choice.center.y,
        request.target_width,
        target_height,
    );
    Ok(CropPlan {
        target_width: request.target_width,
        target_height,
        center: choice.center,
        center_source: choice.source,
        detections,
        crop,
    })
}
