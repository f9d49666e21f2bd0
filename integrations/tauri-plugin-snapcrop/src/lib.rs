use log::debug;
use serde::{Deserialize, Serialize};
use snapcrop_core::{
    resolve_runtime_config, v1, AspectPreset, CoreError, ErrorInfo, ExecutionProvider, GpuBackendPreference, ImageInfo,
    PlatformTarget, RuntimeConfig,
};
use snapcrop_image::{crop_upload, inspect_upload, CropOutput, CropParams, Upload};
use snapcrop_runtime_ort::{DetectorConfig, OrtDetector};
use snapcrop_telemetry::sink_from_env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauriCropRequest {
    pub image_bytes: Vec<u8>,
    pub file_name: String,
    pub preset: AspectPreset,
    pub target_width: Option<u32>,
    pub execution_provider: Option<ExecutionProvider>,
    pub gpu_backend: Option<GpuBackendPreference>,
    pub confidence_threshold: Option<f32>,
    pub iou_threshold: Option<f32>,
    pub model_dir: Option<String>,
}

pub fn crop_image(request: TauriCropRequest) -> Result<CropOutput, CoreError> {
    let defaults = RuntimeConfig::default();
    let runtime_cfg = resolve_runtime_config(RuntimeConfig {
        model_dir: request.model_dir,
        execution_provider: request
            .execution_provider
            .map(|v| v.label().to_string())
            .unwrap_or(defaults.execution_provider),
        gpu_backend: request
            .gpu_backend
            .map(|v| v.label().to_string())
            .unwrap_or(defaults.gpu_backend),
        confidence_threshold: request.confidence_threshold.unwrap_or(defaults.confidence_threshold),
        iou_threshold: request.iou_threshold.unwrap_or(defaults.iou_threshold),
    });
    let detector = OrtDetector::new(DetectorConfig::from_runtime_config(&runtime_cfg)?);
    let telemetry = sink_from_env();
    let telemetry_ref = telemetry.as_ref().map(|sink| sink.as_ref());
    debug!("tauri crop of {} with preset {}", request.file_name, request.preset.slug());
    crop_upload(
        &detector,
        &Upload {
            file_name: request.file_name,
            bytes: request.image_bytes,
        },
        &CropParams {
            preset: request.preset,
            target_width: request.target_width,
        },
        PlatformTarget::Tauri,
        telemetry_ref,
    )
}

/// Loosely typed request as sent by a web front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauriCommandRequest {
    pub image_bytes: Vec<u8>,
    pub file_name: String,
    pub preset: Option<String>,
    pub target_width: Option<u32>,
    pub execution_provider: Option<String>,
    pub gpu_backend: Option<String>,
    pub model_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauriCommandResponse {
    pub file_name: String,
    pub mime_type: String,
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub used_fallback: bool,
    pub warning: Option<String>,
}

pub fn crop_image_command(request: TauriCommandRequest) -> Result<TauriCommandResponse, ErrorInfo> {
    let response = crop_image_v1(v1::CropImageRequest {
        image_bytes: request.image_bytes,
        file_name: request.file_name,
        preset: request
            .preset
            .unwrap_or_else(|| AspectPreset::default().slug().to_string()),
        target_width: request.target_width,
        model_dir: request.model_dir,
        execution_provider: request.execution_provider,
        gpu_backend: request.gpu_backend,
        confidence_threshold: None,
        iou_threshold: None,
    })?;
    Ok(TauriCommandResponse {
        file_name: response.file_name,
        mime_type: response.mime_type,
        image_bytes: response.image_bytes,
        width: response.plan.crop.width(),
        height: response.plan.crop.height(),
        used_fallback: response.plan.used_fallback(),
        warning: response.warning,
    })
}

pub fn crop_image_v1(request: v1::CropImageRequest) -> Result<v1::CropImageResponse, ErrorInfo> {
    crop_image_v1_inner(request).map_err(|err| err.as_error_info())
}

fn crop_image_v1_inner(request: v1::CropImageRequest) -> Result<v1::CropImageResponse, CoreError> {
    let output = crop_image(TauriCropRequest {
        image_bytes: request.image_bytes,
        file_name: request.file_name,
        preset: AspectPreset::parse(&request.preset)?,
        target_width: request.target_width,
        execution_provider: request.execution_provider.as_deref().map(ExecutionProvider::parse).transpose()?,
        gpu_backend: request.gpu_backend.as_deref().map(GpuBackendPreference::parse).transpose()?,
        confidence_threshold: request.confidence_threshold,
        iou_threshold: request.iou_threshold,
        model_dir: request.model_dir,
    })?;
    Ok(v1::CropImageResponse {
        mime_type: output.mime_type().to_string(),
        warning: output.warning().map(str::to_string),
        preset: output.preset.slug().to_string(),
        file_name: output.file_name,
        image_bytes: output.bytes,
        source_width: output.source_width,
        source_height: output.source_height,
        plan: output.plan,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TauriInspectRequest {
    pub image_bytes: Vec<u8>,
}

/// Dimensions and width slider range for a freshly uploaded image.
pub fn inspect_image_command(request: TauriInspectRequest) -> Result<ImageInfo, ErrorInfo> {
    inspect_upload(&request.image_bytes).map_err(|err| err.as_error_info())
}

pub fn list_presets_command() -> Vec<v1::PresetInfo> {
    v1::presets()
}

#[cfg(feature = "tauri-plugin")]
#[tauri::command]
fn tauri_list_presets_command() -> Vec<v1::PresetInfo> {
    list_presets_command()
}

#[cfg(feature = "tauri-plugin")]
#[tauri::command]
fn tauri_inspect_image_command(request: TauriInspectRequest) -> Result<ImageInfo, ErrorInfo> {
    inspect_image_command(request)
}

#[cfg(feature = "tauri-plugin")]
#[tauri::command]
fn tauri_crop_image_command(request: TauriCommandRequest) -> Result<TauriCommandResponse, ErrorInfo> {
    crop_image_command(request)
}

#[cfg(feature = "tauri-plugin")]
pub fn init<R: tauri::Runtime>() -> tauri::plugin::TauriPlugin<R> {
    tauri::plugin::Builder::new("snapcrop")
        .invoke_handler(tauri::generate_handler![
            tauri_list_presets_command,
            tauri_inspect_image_command,
            tauri_crop_image_command
        ])
        .build()
}
