//! Image inspection for downloaded covers

use image::{DynamicImage, GenericImageView, ImageFormat};

/// Max per-channel spread for a pixel to count as gray
const GRAY_TOLERANCE: u8 = 12;

/// Upper bound on pixels sampled for grayscale detection
const GRAY_SAMPLE_TARGET: u32 = 4096;

/// Share of sampled pixels that must be gray for the image to be grayscale
const GRAY_RATIO: f64 = 0.98;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedImage {
    pub width: u32,
    pub height: u32,
    pub grayscale: bool,
    pub content_type: &'static str,
    pub extension: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("Unrecognized image format")]
    UnknownFormat,

    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Image too small ({width}x{height}), likely a placeholder")]
    Placeholder { width: u32, height: u32 },
}

/// Decode `bytes`, reject placeholders smaller than `min_dimension`, and
/// classify grayscale covers.
pub fn inspect(bytes: &[u8], min_dimension: u32) -> Result<InspectedImage, InspectError> {
    let format = image::guess_format(bytes).map_err(|_| InspectError::UnknownFormat)?;
    let decoded = image::load_from_memory_with_format(bytes, format)?;
    let (width, height) = decoded.dimensions();

    if width < min_dimension || height < min_dimension {
        return Err(InspectError::Placeholder { width, height });
    }

    let (content_type, extension) = match format {
        ImageFormat::Png => ("image/png", "png"),
        ImageFormat::Gif => ("image/gif", "gif"),
        ImageFormat::WebP => ("image/webp", "webp"),
        _ => ("image/jpeg", "jpg"),
    };

    Ok(InspectedImage {
        width,
        height,
        grayscale: is_grayscale(&decoded),
        content_type,
        extension,
    })
}

fn is_grayscale(image: &DynamicImage) -> bool {
    if !image.color().has_color() {
        return true;
    }

    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let total = u64::from(width) * u64::from(height);
    if total == 0 {
        return false;
    }

    let step = ((total / u64::from(GRAY_SAMPLE_TARGET)).max(1)) as usize;
    let mut sampled = 0usize;
    let mut gray = 0usize;

    for pixel in rgb.pixels().step_by(step) {
        let [r, g, b] = pixel.0;
        let spread = r.max(g).max(b) - r.min(g).min(b);
        sampled += 1;
        if spread <= GRAY_TOLERANCE {
            gray += 1;
        }
    }

    sampled > 0 && (gray as f64 / sampled as f64) >= GRAY_RATIO
}
