use image::imageops::FilterType;
use image::RgbImage;

use super::CodecError;

/// Width and height of the canonical image handed to `encode`.
pub const CANONICAL_SIZE: u32 = 200;

/// Decodes raw upload bytes (JPEG, PNG, GIF or BMP) and resizes them to the
/// canonical `CANONICAL_SIZE x CANONICAL_SIZE` RGB8 image.
pub fn normalize(raw: &[u8]) -> Result<RgbImage, CodecError> {
    if raw.is_empty() {
        return Err(CodecError::UnsupportedFormat("empty input".to_string()));
    }
    let img = image::load_from_memory(raw).map_err(|e| {
        tracing::debug!(error = %e, bytes = raw.len(), "image decode failed");
        CodecError::UnsupportedFormat(e.to_string())
    })?;
    if img.width() == 0 || img.height() == 0 {
        return Err(CodecError::UnsupportedFormat(
            "image has zero dimensions".to_string(),
        ));
    }
    Ok(img
        .resize_exact(CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle)
        .to_rgb8())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgb};

    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    #[test]
    fn normalize_resizes_to_canonical() {
        let img = normalize(&png_bytes(31, 77)).unwrap();
        assert_eq!(img.dimensions(), (CANONICAL_SIZE, CANONICAL_SIZE));
    }

    #[test]
    fn garbage_is_unsupported() {
        assert!(matches!(
            normalize(b"definitely not an image"),
            Err(CodecError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            normalize(&[]),
            Err(CodecError::UnsupportedFormat(_))
        ));
    }
}
