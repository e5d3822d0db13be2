//! Image handling: JPEG re-encode and the synthetic placeholder.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::ImageReader;

/// Re-encode a fetched frame as JPEG at the configured quality.  Devices
/// occasionally hand back oversized or oddly-encoded frames; normalizing
/// here keeps the on-disk cache predictable.
pub fn optimize_jpeg(bytes: &[u8], quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let decoded = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()?;
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    decoded.write_with_encoder(encoder)?;
    Ok(out)
}

/// A tiny flat-gray frame served when no cached image exists yet, so
/// dashboards render immediately instead of erroring.
pub fn placeholder_jpeg() -> Vec<u8> {
    let gray = image::RgbImage::from_pixel(160, 90, image::Rgb([32, 32, 32]));
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, 70);
    image::DynamicImage::ImageRgb8(gray)
        .write_with_encoder(encoder)
        .expect("in-memory JPEG encode of a constant image cannot fail");
    out
}
