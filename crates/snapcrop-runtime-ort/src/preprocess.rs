use image::imageops::FilterType;
use image::RgbImage;

const PAD_VALUE: f32 = 114.0 / 255.0;

/// Geometry of a letterboxed model input: the source is scaled to fit the
/// square input and centered with gray padding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub input_size: u32,
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub scaled_width: u32,
    pub scaled_height: u32,
}

impl Letterbox {
    pub fn for_image(width: u32, height: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / width.max(1) as f32).min(input_size as f32 / height.max(1) as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, input_size);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, input_size);
        Self {
            input_size,
            scale,
            pad_x: (input_size - scaled_width) / 2,
            pad_y: (input_size - scaled_height) / 2,
            scaled_width,
            scaled_height,
        }
    }

    /// Maps a point in model-input space back to source pixels.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x as f32) / self.scale, (y - self.pad_y as f32) / self.scale)
    }
}

/// NCHW float tensor data in [0, 1] plus the letterbox used to build it.
pub fn letterbox_tensor(image: &RgbImage, input_size: u32) -> (Vec<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let letterbox = Letterbox::for_image(width, height, input_size);
    let resized = image::imageops::resize(
        image,
        letterbox.scaled_width,
        letterbox.scaled_height,
        FilterType::Triangle,
    );

    let plane = input_size as usize * input_size as usize;
    let mut data = vec![PAD_VALUE; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let idx = (y + letterbox.pad_y) as usize * input_size as usize + (x + letterbox.pad_x) as usize;
        data[idx] = pixel[0] as f32 / 255.0;
        data[plane + idx] = pixel[1] as f32 / 255.0;
        data[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }
    (data, letterbox)
}
