// ============================================================================
// OUTPUT ENCODING — the export boundary
// ============================================================================
//
// The editor hands the host encoded bytes; delivery (save, upload, clipboard)
// is the host's concern. Decoding a source bitmap is likewise the host's —
// the editor is constructed with an `RgbaImage` it already trusts.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ColorType, DynamicImage, ImageEncoder, RgbaImage};

/// Encoding for [`encode_composite`] / `Editor::to_output_bitmap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    /// JPEG with quality 1–100; alpha is flattened to RGB.
    Jpeg { quality: u8 },
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Png
    }
}

/// Encoding failed in the underlying codec.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode composite: {0}")]
pub struct EncodeError(#[from] image::ImageError);

/// Encode a composited bitmap to bytes in the requested format.
pub fn encode_composite(image: &RgbaImage, format: OutputFormat) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    match format {
        OutputFormat::Png => {
            let encoder = PngEncoder::new(&mut out);
            encoder.write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ColorType::Rgba8,
            )?;
        }
        OutputFormat::Jpeg { quality } => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
            encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn png_bytes_round_trip() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([10, 200, 30, 255]));
        let bytes = encode_composite(&img, OutputFormat::Png).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");

        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (8, 8));
        assert_eq!(*decoded.get_pixel(3, 3), Rgba([10, 200, 30, 255]));
    }

    #[test]
    fn jpeg_encodes_with_quality() {
        let img = RgbaImage::from_pixel(16, 16, Rgba([255, 0, 0, 255]));
        let bytes = encode_composite(&img, OutputFormat::Jpeg { quality: 90 }).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]); // SOI marker
    }
}
