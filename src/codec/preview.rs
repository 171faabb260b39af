use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;

use super::{decode, CodecError, Pattern};

pub const PREVIEW_JPEG_QUALITY: u8 = 100;

/// JPEG bytes of the pattern preview.
pub fn preview_jpeg(pattern: &Pattern) -> Result<Vec<u8>, CodecError> {
    let img = decode(pattern)?;
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, PREVIEW_JPEG_QUALITY);
    DynamicImage::ImageRgb8(img)
        .write_with_encoder(encoder)
        .map_err(|e| CodecError::Export(e.to_string()))?;
    Ok(out)
}

/// Preview as an inline `data:` URL, suitable for embedding in API responses.
pub fn preview_data_url(pattern: &Pattern) -> Result<String, CodecError> {
    let jpeg = preview_jpeg(pattern)?;
    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_a_jpeg() {
        let jpeg = preview_jpeg(&Pattern::uniform([10, 80, 160])).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let img = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(img.width(), crate::codec::PATTERN_SIZE as u32);
    }

    #[test]
    fn data_url_has_jpeg_prefix() {
        let url = preview_data_url(&Pattern::uniform([0, 0, 0])).unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,/9j/"), "{url}");
    }
}
