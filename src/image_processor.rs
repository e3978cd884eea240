use std::panic::{self, AssertUnwindSafe};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ColorType, DynamicImage, ImageFormat, ImageResult, Rgb, RgbImage};
use tracing::{info, warn};

const JPEG_QUALITY: u8 = 95;

/// Removes embedded metadata from generated images.
pub trait MetadataStripper: Send + Sync {
    /// Must not fail: on any problem the input comes back untouched.
    fn strip(&self, image: &[u8]) -> Vec<u8>;
}

/// Re-encodes images with the `image` crate. The encoders never write EXIF or
/// ICC chunks, so a decode/encode pass drops them along with PNG text chunks.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageScrubber;

impl MetadataStripper for ImageScrubber {
    fn strip(&self, image: &[u8]) -> Vec<u8> {
        match panic::catch_unwind(AssertUnwindSafe(|| reencode(image))) {
            Ok(Ok(cleaned)) => {
                info!("🧹 Stripped image metadata ({} -> {} bytes)", image.len(), cleaned.len());
                cleaned
            }
            Ok(Err(e)) => {
                warn!("⚠️ Error processing image metadata: {}", e);
                image.to_vec()
            }
            Err(_) => {
                warn!("⚠️ Image decoder panicked, returning original bytes");
                image.to_vec()
            }
        }
    }
}

fn reencode(data: &[u8]) -> ImageResult<Vec<u8>> {
    let format = image::guess_format(data)?;
    let decoded = image::load_from_memory_with_format(data, format)?;
    let img = normalize(decoded);

    let mut out = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            img.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY))?
        }
        ImageFormat::WebP => img.write_with_encoder(WebPEncoder::new_lossless(&mut out))?,
        _ => img.write_with_encoder(PngEncoder::new_with_quality(
            &mut out,
            CompressionType::Best,
            FilterType::Adaptive,
        ))?,
    }
    Ok(out)
}

/// Transparent images are flattened onto white; anything that is not plain
/// RGB or grayscale becomes RGB.
fn normalize(img: DynamicImage) -> DynamicImage {
    if img.color().has_alpha() {
        return DynamicImage::ImageRgb8(flatten_on_white(&img));
    }
    match img.color() {
        ColorType::Rgb8 | ColorType::L8 => img,
        _ => DynamicImage::ImageRgb8(img.to_rgb8()),
    }
}

fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| -> u8 {
            let (c, a) = (u16::from(c), u16::from(a));
            ((c * a + 255 * (255 - a) + 127) / 255) as u8
        };
        Rgb([blend(r), blend(g), blend(b)])
    })
}
