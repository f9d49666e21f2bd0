use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use snapcrop_core::{v1, AspectPreset, CenterSource, ErrorCode, Point};
use tauri_plugin_snapcrop::{crop_image_v1, inspect_image_command, list_presets_command, TauriInspectRequest};

fn build_sample(width: u32, height: u32, format: ImageFormat) -> Result<Vec<u8>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut out), format)?;
    Ok(out)
}

fn crop_request(bytes: Vec<u8>, file_name: &str, preset: &str, width: Option<u32>, model_dir: &std::path::Path) -> v1::CropImageRequest {
    v1::CropImageRequest {
        image_bytes: bytes,
        file_name: file_name.to_string(),
        preset: preset.to_string(),
        target_width: width,
        model_dir: Some(model_dir.display().to_string()),
        execution_provider: Some("cpu".to_string()),
        gpu_backend: None,
        confidence_threshold: None,
        iou_threshold: None,
    }
}

#[test]
fn story_crop_of_a_landscape_jpeg_falls_back_to_center() -> Result<()> {
    std::env::set_var("SNAPCROP_ALLOW_PLACEHOLDER", "1");
    let models = tempfile::tempdir()?;
    let sample = build_sample(640, 480, ImageFormat::Jpeg)?;

    let response = crop_image_v1(crop_request(sample, "dog.JPG", "instagram-story", Some(270), models.path()))
        .map_err(|err| anyhow!("{:?}: {}", err.code, err.message))?;

    assert_eq!(response.file_name, "cropped_dog.JPG");
    assert_eq!(response.mime_type, "image/jpeg");
    assert_eq!((response.source_width, response.source_height), (640, 480));
    assert_eq!(response.plan.center, Point { x: 320, y: 240 });
    assert_eq!(response.plan.center_source, CenterSource::ImageCenter);
    let crop = response.plan.crop;
    assert_eq!((crop.left, crop.upper, crop.right, crop.lower), (185, 0, 455, 480));
    assert!(response.warning.is_some());

    let decoded = image::load_from_memory(&response.image_bytes)?;
    assert_eq!((decoded.width(), decoded.height()), (270, 480));
    Ok(())
}

#[test]
fn every_preset_yields_an_in_bounds_crop() -> Result<()> {
    std::env::set_var("SNAPCROP_ALLOW_PLACEHOLDER", "1");
    let models = tempfile::tempdir()?;
    let sample = build_sample(1200, 800, ImageFormat::Png)?;

    for preset in list_presets_command() {
        let response = crop_image_v1(crop_request(sample.clone(), "wide.png", &preset.slug, None, models.path()))
            .map_err(|err| anyhow!("{}: {}", preset.slug, err.message))?;
        let parsed = AspectPreset::parse(&preset.slug).map_err(|err| anyhow!(err.to_string()))?;
        let crop = response.plan.crop;

        assert_eq!(response.preset, preset.slug);
        assert_eq!(response.plan.target_width, 1080);
        assert_eq!(response.plan.target_height, parsed.ratio().target_height(1080));
        assert!(crop.fits_within(1200, 800), "{} crop out of bounds", preset.slug);
        assert!(crop.width() <= 1080 && crop.height() <= response.plan.target_height);

        let decoded = image::load_from_memory(&response.image_bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (crop.width(), crop.height()));
    }
    Ok(())
}

#[test]
fn inspect_and_errors_share_the_wire_shape() -> Result<()> {
    let info = inspect_image_command(TauriInspectRequest {
        image_bytes: build_sample(2400, 1600, ImageFormat::Png)?,
    })
    .map_err(|err| anyhow!(err.message))?;
    assert_eq!(info.width_bounds.min, 100);
    assert_eq!(info.width_bounds.max, 2400);
    assert_eq!(info.width_bounds.default, 1080);

    let models = tempfile::tempdir()?;
    let err = crop_image_v1(crop_request(vec![0u8; 16], "notes.gif", "instagram-square", None, models.path()))
        .err()
        .ok_or_else(|| anyhow!("gif upload should be rejected"))?;
    assert_eq!(err.code, ErrorCode::InvalidRequest);
    let wire = serde_json::to_value(&err)?;
    assert_eq!(wire["code"], "invalid-request");
    assert!(wire["message"].as_str().is_some());
    Ok(())
}
