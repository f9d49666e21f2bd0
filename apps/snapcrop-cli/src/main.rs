use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{debug, LevelFilter};
use snapcrop_core::{resolve_runtime_config, v1, AspectPreset, CoreError, PlatformTarget, RuntimeConfig};
use snapcrop_image::{crop_upload, inspect_upload, CropParams, Upload};
use snapcrop_installer::{install_model, verify_model, InstallRequest};
use snapcrop_model_registry::resolve_model_paths;
use snapcrop_runtime_ort::{DetectorConfig, OrtDetector};
use snapcrop_telemetry::sink_from_env;

#[derive(Parser, Debug)]
#[command(name = "snapcrop", version, about = "Crop photos to social media sizes around the main subject")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    Crop(CropArgs),
    Inspect(InspectArgs),
    Presets,
    Models(ModelsCommand),
}

#[derive(Args, Debug)]
struct ModelsCommand {
    #[command(subcommand)]
    command: ModelsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ModelsSubcommand {
    Install(InstallArgs),
    Verify(CommonModelArgs),
}

#[derive(Args, Debug)]
struct CommonModelArgs {
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InstallArgs {
    /// Local path or http(s) URL of a yolov8n ONNX export.
    #[arg(long = "from")]
    source: String,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    force: bool,
}

#[derive(Args, Debug)]
struct CropArgs {
    #[arg(long, short = 'i')]
    input: PathBuf,
    /// Preset slug or label, see `snapcrop presets`.
    #[arg(long, short = 'p', default_value = "instagram-square")]
    preset: String,
    /// Crop width in pixels; clamped to the image width.
    #[arg(long, short = 'w')]
    width: Option<u32>,
    /// Defaults to `cropped_<name>` next to the input.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'd')]
    model_dir: Option<PathBuf>,
    #[arg(long, short = 'e', default_value = "auto")]
    execution_provider: String,
    #[arg(long, short = 'g', default_value = "auto")]
    gpu_backend: String,
    #[arg(long)]
    confidence: Option<f32>,
    #[arg(long)]
    iou: Option<f32>,
    #[arg(long, default_value_t = false, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(long, short = 'i')]
    input: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        TopLevelCommand::Crop(args) => match run_crop(&args) {
            Ok(report) => print_json(&report),
            Err(err) => {
                print_json(&serde_json::json!({ "error": err.as_error_info() }));
                ExitCode::FAILURE
            }
        },
        TopLevelCommand::Inspect(args) => match std::fs::read(&args.input)
            .map_err(CoreError::from)
            .and_then(|bytes| inspect_upload(&bytes))
        {
            Ok(info) => print_json(&info),
            Err(err) => {
                print_json(&serde_json::json!({ "error": err.as_error_info() }));
                ExitCode::FAILURE
            }
        },
        TopLevelCommand::Presets => print_json(&v1::presets()),
        TopLevelCommand::Models(models) => match run_models(models.command) {
            Ok(value) => print_json(&value),
            Err(err) => {
                eprintln!("Error: {:#}", err);
                ExitCode::FAILURE
            }
        },
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .format_timestamp(None)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: failed to serialize output: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_models(command: ModelsSubcommand) -> Result<serde_json::Value> {
    match command {
        ModelsSubcommand::Install(args) => {
            let report = install_model(&InstallRequest {
                model_dir: args.model_dir,
                source: args.source,
                force: args.force,
            })?;
            Ok(serde_json::to_value(report)?)
        }
        ModelsSubcommand::Verify(args) => {
            let lock = verify_model(args.model_dir.clone())?;
            let paths = resolve_model_paths(args.model_dir.as_deref())?;
            Ok(serde_json::json!({
                "modelDir": paths.root,
                "lock": lock,
            }))
        }
    }
}

fn run_crop(args: &CropArgs) -> Result<serde_json::Value, CoreError> {
    let total_start = Instant::now();
    set_ort_dylib_path_if_available();

    let preset = AspectPreset::parse(&args.preset)?;
    let runtime_cfg = resolve_runtime_config(RuntimeConfig {
        model_dir: args.model_dir.as_ref().map(|path| path.display().to_string()),
        execution_provider: args.execution_provider.clone(),
        gpu_backend: args.gpu_backend.clone(),
        confidence_threshold: args.confidence.unwrap_or(f32::NAN),
        iou_threshold: args.iou.unwrap_or(f32::NAN),
    });
    let detector = OrtDetector::new(DetectorConfig::from_runtime_config(&runtime_cfg)?);
    let telemetry = sink_from_env();
    let telemetry_ref = telemetry.as_ref().map(|sink| sink.as_ref());

    let read_start = Instant::now();
    let bytes = std::fs::read(&args.input)
        .map_err(|err| CoreError::Io(format!("failed to read {}: {}", args.input.display(), err)))?;
    let file_name = args
        .input
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| CoreError::InvalidRequest(format!("'{}' is not a file", args.input.display())))?;
    let read_done = Instant::now();

    let output = crop_upload(
        &detector,
        &Upload { file_name, bytes },
        &CropParams {
            preset,
            target_width: args.width,
        },
        PlatformTarget::Cli,
        telemetry_ref,
    )?;
    let crop_done = Instant::now();

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(&args.input, &output.file_name));
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output_path, &output.bytes)
        .map_err(|err| CoreError::Io(format!("failed to write {}: {}", output_path.display(), err)))?;
    let write_done = Instant::now();
    debug!("wrote {} ({} bytes)", output_path.display(), output.bytes.len());

    let timings = args.profile.then(|| {
        serde_json::json!({
            "readInput": read_done.duration_since(read_start).as_millis(),
            "crop": crop_done.duration_since(read_done).as_millis(),
            "writeOutput": write_done.duration_since(crop_done).as_millis(),
            "total": write_done.duration_since(total_start).as_millis(),
        })
    });

    Ok(serde_json::json!({
        "input": args.input,
        "output": output_path,
        "mimeType": output.mime_type(),
        "preset": output.preset.slug(),
        "sourceWidth": output.source_width,
        "sourceHeight": output.source_height,
        "plan": output.plan,
        "warning": output.warning(),
        "timingsMs": timings,
    }))
}

fn default_output_path(input: &Path, output_name: &str) -> PathBuf {
    input
        .parent()
        .map(|dir| dir.join(output_name))
        .unwrap_or_else(|| PathBuf::from(output_name))
}

fn set_ort_dylib_path_if_available() {
    if std::env::var("ORT_DYLIB_PATH").is_ok() {
        return;
    }
    let lib_name = if cfg!(target_os = "windows") {
        "onnxruntime.dll"
    } else if cfg!(target_os = "macos") {
        "libonnxruntime.dylib"
    } else {
        "libonnxruntime.so"
    };
    match discover_ort_library(lib_name) {
        Ok(path) => {
            debug!("using onnxruntime at {}", path.display());
            std::env::set_var("ORT_DYLIB_PATH", path);
        }
        Err(err) => debug!("{}", err),
    }
}

fn discover_ort_library(lib_name: &str) -> Result<PathBuf> {
    if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        let candidate = dir.join(lib_name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            if cfg!(target_os = "windows") && dir.to_string_lossy().to_ascii_lowercase().contains("windows\\system32") {
                continue;
            }
            let candidate = dir.join(lib_name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(anyhow!("{} not found next to the executable or on PATH", lib_name))
}
