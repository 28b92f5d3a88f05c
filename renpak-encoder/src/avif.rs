//! Single-image AVIF encoding via the pure-Rust ravif encoder

use crate::{ravif_quality, EncoderConfig, Error, Result};
use image::RgbaImage;
use ravif::{Encoder, Img, RGB8, RGBA8};

/// Decodes arbitrary image bytes (JPG, PNG, WebP, BMP, ...) and encodes them
/// as a single-image AVIF. Alpha is preserved iff the source carries an
/// alpha channel.
pub fn encode_avif(data: &[u8], config: &EncoderConfig) -> Result<Vec<u8>> {
    let image = image::load_from_memory(data)?;
    let quality = ravif_quality(config.quality);

    let encoder = Encoder::new()
        .with_quality(quality)
        .with_alpha_quality(quality)
        .with_speed(config.speed.clamp(1, 10))
        // One thread per encode; the build scheduler already saturates the cores.
        .with_num_threads(Some(1));

    let encoded = if image.color().has_alpha() {
        let rgba = image.into_rgba8();
        let (w, h) = (rgba.width() as usize, rgba.height() as usize);
        encoder.encode_rgba(Img::new(rgba.as_raw().as_rgba(), w, h))
    } else {
        let rgb = image.into_rgb8();
        let (w, h) = (rgb.width() as usize, rgb.height() as usize);
        encoder.encode_rgb(Img::new(rgb.as_raw().as_rgb(), w, h))
    }
    .map_err(|e| Error::EncodeFailed(e.to_string()))?;

    Ok(encoded.avif_file)
}

/// Decodes arbitrary image bytes to RGBA pixels. Used by the build workers
/// to materialize sequence frames before AVIS encoding.
pub fn decode_rgba(data: &[u8]) -> Result<RgbaImage> {
    Ok(image::load_from_memory(data)?.into_rgba8())
}

// Helper traits to reinterpret packed pixel buffers for ravif
trait AsRgba {
    fn as_rgba(&self) -> &[RGBA8];
}

trait AsRgb {
    fn as_rgb(&self) -> &[RGB8];
}

impl AsRgba for [u8] {
    fn as_rgba(&self) -> &[RGBA8] {
        assert_eq!(self.len() % 4, 0, "RGBA buffer length must be a multiple of 4");
        // RGBA8 is four packed u8s with alignment 1
        unsafe { std::slice::from_raw_parts(self.as_ptr() as *const RGBA8, self.len() / 4) }
    }
}

impl AsRgb for [u8] {
    fn as_rgb(&self) -> &[RGB8] {
        assert_eq!(self.len() % 3, 0, "RGB buffer length must be a multiple of 3");
        unsafe { std::slice::from_raw_parts(self.as_ptr() as *const RGB8, self.len() / 3) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn png_bytes(image: DynamicImage) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_encode_small_rgb() {
        let png = png_bytes(DynamicImage::ImageRgb8(RgbImage::from_fn(8, 8, |x, y| {
            image::Rgb([x as u8 * 30, y as u8 * 30, 128])
        })));
        let avif = encode_avif(&png, &EncoderConfig { quality: 40, speed: 10 }).unwrap();
        assert!(!avif.is_empty());
        // AVIF files start with an ftyp box
        assert_eq!(&avif[4..8], b"ftyp");
    }

    #[test]
    fn test_encode_preserves_alpha_path() {
        let png = png_bytes(DynamicImage::ImageRgba8(RgbaImage::from_fn(8, 8, |x, _| {
            image::Rgba([200, 100, 50, if x < 4 { 0 } else { 255 }])
        })));
        let avif = encode_avif(&png, &EncoderConfig { quality: 40, speed: 10 }).unwrap();
        assert!(!avif.is_empty());
    }

    #[test]
    fn test_garbage_input_fails() {
        let err = encode_avif(b"not an image at all", &EncoderConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Image(_)));
    }

    #[test]
    fn test_decode_rgba_dimensions() {
        let png = png_bytes(DynamicImage::ImageRgb8(RgbImage::new(5, 7)));
        let rgba = decode_rgba(&png).unwrap();
        assert_eq!((rgba.width(), rgba.height()), (5, 7));
    }
}
