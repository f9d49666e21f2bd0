use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, ImageReader, RgbImage};
use log::debug;
use serde::{Deserialize, Serialize};
use snapcrop_core::{
    emit_event, plan_with_detector, AspectPreset, CoreError, CropPlan, CropRectangle, CropRequest, DetectionInput, Detector, ImageInfo,
    PlatformTarget, TelemetryEventType, TelemetrySink, WidthBounds,
};
use tempfile::TempDir;

pub const JPEG_QUALITY: u8 = 100;
const OUTPUT_PREFIX: &str = "cropped_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    /// Output keeps the upload's format, picked by extension.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let base = upload_base_name(name);
        let ext = Path::new(&base)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

pub fn is_supported_upload(name: &str) -> bool {
    OutputFormat::from_file_name(name).is_some()
}

fn upload_base_name(name: &str) -> String {
    name.rsplit(|c| c == '/' || c == '\\')
        .next()
        .map(str::trim)
        .filter(|base| !base.is_empty() && *base != "." && *base != "..")
        .unwrap_or("upload")
        .to_string()
}

pub fn cropped_file_name(original: &str) -> String {
    format!("{}{}", OUTPUT_PREFIX, upload_base_name(original))
}

pub fn decode_upload(bytes: &[u8]) -> Result<RgbImage, CoreError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| CoreError::Decode(e.to_string()))
}

pub fn inspect_upload(bytes: &[u8]) -> Result<ImageInfo, CoreError> {
    let (width, height) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CoreError::Decode(e.to_string()))?
        .into_dimensions()
        .map_err(|e| CoreError::Decode(e.to_string()))?;
    Ok(ImageInfo::new(width, height))
}

pub fn crop_image(image: &RgbImage, rect: &CropRectangle) -> RgbImage {
    image::imageops::crop_imm(image, rect.left, rect.upper, rect.width(), rect.height()).to_image()
}

/// JPEG output is quality 100 with every component sampled 1x1 (no chroma
/// subsampling).
pub fn encode_output(image: &RgbImage, format: OutputFormat) -> Result<Vec<u8>, CoreError> {
    let mut encoded = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            let mut encoder = JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
            encoder
                .encode_image(image)
                .map_err(|e| CoreError::Encode(e.to_string()))?;
        }
        OutputFormat::Png => {
            image
                .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
                .map_err(|e| CoreError::Encode(e.to_string()))?;
        }
    }
    Ok(encoded)
}

/// Scratch directory for one crop cycle. The upload is written here so the
/// detector can read it by path; everything is removed when this is dropped.
#[derive(Debug)]
pub struct UploadWorkspace {
    dir: TempDir,
    input_path: PathBuf,
}

impl UploadWorkspace {
    pub fn create(file_name: &str, bytes: &[u8]) -> Result<Self, CoreError> {
        let dir = tempfile::Builder::new().prefix("snapcrop-").tempdir()?;
        let input_path = dir.path().join(upload_base_name(file_name));
        fs::write(&input_path, bytes)?;
        Ok(Self { dir, input_path })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropParams {
    pub preset: AspectPreset,
    /// Clamped into the image's [`WidthBounds`]; `None` means the default width.
    pub target_width: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CropOutput {
    pub file_name: String,
    pub format: OutputFormat,
    pub bytes: Vec<u8>,
    pub source_width: u32,
    pub source_height: u32,
    pub preset: AspectPreset,
    pub plan: CropPlan,
}

impl CropOutput {
    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn warning(&self) -> Option<&'static str> {
        self.plan.warning()
    }
}

pub fn crop_upload(
    detector: &dyn Detector,
    upload: &Upload,
    params: &CropParams,
    platform: PlatformTarget,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<CropOutput, CoreError> {
    let format = OutputFormat::from_file_name(&upload.file_name).ok_or_else(|| {
        CoreError::InvalidRequest(format!(
            "unsupported upload '{}'; expected a .jpg, .jpeg or .png file",
            upload.file_name
        ))
    })?;
    let workspace = UploadWorkspace::create(&upload.file_name, &upload.bytes)?;

    let decode_start = Instant::now();
    let image = match decode_upload(&upload.bytes) {
        Ok(image) => image,
        Err(err) => {
            emit_event(
                telemetry,
                platform,
                TelemetryEventType::DecodeError,
                Some(decode_start.elapsed().as_millis() as u64),
                Some(err.to_string()),
            );
            return Err(err);
        }
    };
    let (width, height) = image.dimensions();
    emit_event(
        telemetry,
        platform,
        TelemetryEventType::DecodeSuccess,
        Some(decode_start.elapsed().as_millis() as u64),
        Some(format!("{}x{}", width, height)),
    );

    let request = CropRequest {
        image_width: width,
        image_height: height,
        target_width: WidthBounds::for_image(width).clamp(params.target_width),
        aspect_ratio: params.preset.ratio(),
    };
    debug!(
        "cropping {} ({}x{}) to {} at width {}",
        upload.file_name, width, height, params.preset, request.target_width
    );
    let plan = plan_with_detector(
        detector,
        &request,
        &DetectionInput {
            image_path: workspace.input_path().to_path_buf(),
            width,
            height,
        },
        platform,
        telemetry,
    )?;

    let cropped = crop_image(&image, &plan.crop);
    let bytes = encode_output(&cropped, format)?;
    emit_event(
        telemetry,
        platform,
        TelemetryEventType::CropSuccess,
        None,
        Some(format!(
            "crop={},{},{},{}",
            plan.crop.left, plan.crop.upper, plan.crop.right, plan.crop.lower
        )),
    );

    Ok(CropOutput {
        file_name: cropped_file_name(&upload.file_name),
        format,
        bytes,
        source_width: width,
        source_height: height,
        preset: params.preset,
        plan,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use image::{DynamicImage, ImageBuffer, Rgb};
    use snapcrop_core::{BoundingBox, CenterSource, ErrorCode};

    use super::*;

    struct StubDetector {
        boxes: Result<Vec<BoundingBox>, String>,
        seen_path: Mutex<Option<PathBuf>>,
    }

    impl StubDetector {
        fn new(boxes: Result<Vec<BoundingBox>, String>) -> Self {
            Self {
                boxes,
                seen_path: Mutex::new(None),
            }
        }
    }

    impl Detector for StubDetector {
        fn detect(&self, input: &DetectionInput) -> Result<Vec<BoundingBox>, CoreError> {
            assert!(input.image_path.exists(), "upload must be on disk while detecting");
            *self.seen_path.lock().unwrap() = Some(input.image_path.clone());
            self.boxes.clone().map_err(CoreError::Detector)
        }
    }

    fn sample(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), format)
            .expect("sample image");
        out
    }

    /// Sampling factors `(h, v)` per component from the first SOF0 marker.
    fn jpeg_sampling_factors(bytes: &[u8]) -> Vec<(u8, u8)> {
        let mut pos = 2;
        while pos + 4 <= bytes.len() {
            assert_eq!(bytes[pos], 0xFF, "expected a marker at offset {}", pos);
            let marker = bytes[pos + 1];
            let len = u16::from_be_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
            if marker == 0xC0 {
                let components = bytes[pos + 9] as usize;
                return (0..components)
                    .map(|i| {
                        let factors = bytes[pos + 11 + i * 3];
                        (factors >> 4, factors & 0x0F)
                    })
                    .collect();
            }
            pos += 2 + len;
        }
        panic!("no SOF0 marker found");
    }

    #[test]
    fn jpeg_output_keeps_full_chroma_resolution() {
        let image = ImageBuffer::from_fn(32, 24, |x, y| Rgb([(x * 8) as u8, (y * 10) as u8, 128]));
        let bytes = encode_output(&image, OutputFormat::Jpeg).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

        let factors = jpeg_sampling_factors(&bytes);
        assert_eq!(factors.len(), 3);
        assert!(factors.iter().all(|&f| f == (1, 1)), "subsampled components: {:?}", factors);
    }

    #[test]
    fn crops_around_detection_and_reencodes_jpeg() {
        let detector = StubDetector::new(Ok(vec![BoundingBox {
            x1: 300.0,
            y1: 200.0,
            x2: 500.0,
            y2: 400.0,
            confidence: 0.8,
            class_id: 0,
        }]));
        let upload = Upload {
            file_name: "holiday.jpg".to_string(),
            bytes: sample(800, 600, ImageFormat::Jpeg),
        };
        let output = crop_upload(
            &detector,
            &upload,
            &CropParams {
                preset: AspectPreset::InstagramPortrait,
                target_width: Some(320),
            },
            PlatformTarget::Cli,
            None,
        )
        .expect("crop should succeed");

        assert_eq!(output.file_name, "cropped_holiday.jpg");
        assert_eq!(output.mime_type(), "image/jpeg");
        assert_eq!(output.plan.center_source, CenterSource::Detection { index: 0 });
        assert_eq!(
            output.plan.crop,
            CropRectangle {
                left: 240,
                upper: 100,
                right: 560,
                lower: 500
            }
        );
        let decoded = image::load_from_memory(&output.bytes).expect("output decodes");
        assert_eq!(decoded.width(), 320);
        assert_eq!(decoded.height(), 400);
    }

    #[test]
    fn default_width_is_clamped_and_fallback_is_reported() {
        let detector = StubDetector::new(Ok(vec![]));
        let upload = Upload {
            file_name: "square.png".to_string(),
            bytes: sample(400, 400, ImageFormat::Png),
        };
        let output = crop_upload(&detector, &upload, &CropParams::default(), PlatformTarget::Cli, None)
            .expect("fallback crop should succeed");

        assert_eq!(output.plan.target_width, 400);
        assert_eq!(output.plan.center_source, CenterSource::ImageCenter);
        assert!(output.warning().is_some());
        assert_eq!(output.format, OutputFormat::Png);
        assert_eq!(image::guess_format(&output.bytes).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn workspace_is_removed_after_success_and_failure() {
        let ok = StubDetector::new(Ok(vec![]));
        let upload = Upload {
            file_name: "a.png".to_string(),
            bytes: sample(120, 80, ImageFormat::Png),
        };
        crop_upload(&ok, &upload, &CropParams::default(), PlatformTarget::Cli, None).expect("crop");
        let seen = ok.seen_path.lock().unwrap().clone().expect("detector ran");
        assert!(!seen.exists());
        assert!(!seen.parent().unwrap().exists());

        let failing = StubDetector::new(Err("boom".to_string()));
        let err = crop_upload(&failing, &upload, &CropParams::default(), PlatformTarget::Cli, None)
            .expect_err("detector failure surfaces");
        assert_eq!(err.code(), ErrorCode::DetectorError);
        let seen = failing.seen_path.lock().unwrap().clone().expect("detector ran");
        assert!(!seen.parent().unwrap().exists());
    }

    #[test]
    fn undecodable_upload_is_a_decode_error() {
        let detector = StubDetector::new(Ok(vec![]));
        let upload = Upload {
            file_name: "broken.png".to_string(),
            bytes: b"definitely not a png".to_vec(),
        };
        let err = crop_upload(&detector, &upload, &CropParams::default(), PlatformTarget::Cli, None)
            .expect_err("garbage bytes");
        assert_eq!(err.code(), ErrorCode::DecodeError);
        assert!(detector.seen_path.lock().unwrap().is_none());
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let detector = StubDetector::new(Ok(vec![]));
        let upload = Upload {
            file_name: "clip.gif".to_string(),
            bytes: vec![0; 4],
        };
        let err = crop_upload(&detector, &upload, &CropParams::default(), PlatformTarget::Cli, None)
            .expect_err("gif is not accepted");
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[test]
    fn cropped_name_uses_base_name_only() {
        assert_eq!(cropped_file_name("photo.JPG"), "cropped_photo.JPG");
        assert_eq!(cropped_file_name("../../etc/pic.png"), "cropped_pic.png");
        assert_eq!(cropped_file_name("C:\\Users\\me\\cat.jpeg"), "cropped_cat.jpeg");
        assert!(is_supported_upload("dir/x.PNG"));
        assert!(!is_supported_upload("x.webp"));
    }

    #[test]
    fn inspect_reports_resolution_and_bounds() {
        let info = inspect_upload(&sample(1500, 900, ImageFormat::Png)).expect("inspect");
        assert_eq!((info.width, info.height), (1500, 900));
        assert_eq!(info.width_bounds.default, 1080);
        assert_eq!(info.width_bounds.max, 1500);
    }
}
