//! Pattern codec.
//!
//! A pattern is a `PATTERN_SIZE x PATTERN_SIZE` grid of CIE L*a*b* colours
//! sampled from a canonical image. Cells are stored row-major as a flat
//! `[l, a, b, l, a, b, ...]` vector so the store can keep them in one
//! contiguous arena and the metric can walk them without indirection.
//!
//! Everything here is pure: the same canonical image always produces the same
//! pattern, bit for bit.

mod blob;
mod color;
mod normalize;
mod preview;
mod text;

use std::sync::OnceLock;

use image::imageops::FilterType;
use image::{Rgb, RgbImage};

pub use blob::{decode_blob, encode_blob, BLOB_TAG};
pub use normalize::{normalize, CANONICAL_SIZE};
pub use preview::{preview_data_url, preview_jpeg, PREVIEW_JPEG_QUALITY};

pub(crate) use blob::decode_blob_values;

/// Side length of the pattern grid.
pub const PATTERN_SIZE: usize = 12;
pub const PATTERN_CELLS: usize = PATTERN_SIZE * PATTERN_SIZE;
/// Number of `f32` values in a pattern (three Lab components per cell).
pub const PATTERN_VALUES: usize = PATTERN_CELLS * 3;
/// Bumped whenever `encode` changes; blobs of another version are rejected.
pub const CODEC_VERSION: u16 = 1;
/// Number of discrete distance levels reported with each match.
pub const N_LEVELS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid image format: {0}")]
    InvalidImageFormat(String),

    #[error("corrupt pattern: {0}")]
    CorruptPattern(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("preview export failed: {0}")]
    Export(String),
}

/// Compact, comparable summary of an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    values: Box<[f32]>,
}

impl Pattern {
    /// Wraps raw Lab values. The vector must hold exactly `PATTERN_VALUES`
    /// finite numbers.
    pub fn from_values(values: Vec<f32>) -> Result<Self, CodecError> {
        check_shape(&values)?;
        if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
            return Err(CodecError::CorruptPattern(format!(
                "non-finite value at index {pos}"
            )));
        }
        Ok(Self {
            values: values.into_boxed_slice(),
        })
    }

    /// A pattern where every cell has the same sRGB colour.
    pub fn uniform(rgb: [u8; 3]) -> Self {
        let lab = color::rgb_to_lab(rgb);
        let mut values = Vec::with_capacity(PATTERN_VALUES);
        for _ in 0..PATTERN_CELLS {
            values.extend_from_slice(&lab);
        }
        Self {
            values: values.into_boxed_slice(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn cell(&self, row: usize, col: usize) -> [f32; 3] {
        let base = (row * PATTERN_SIZE + col) * 3;
        [
            self.values[base],
            self.values[base + 1],
            self.values[base + 2],
        ]
    }

    pub fn to_text(&self) -> String {
        text::format_pattern(self)
    }

    pub fn parse(text: &str) -> Result<Self, CodecError> {
        text::parse_pattern(text)
    }
}

/// Encodes a canonical image (see [`normalize`]) into a pattern.
pub fn encode(image: &RgbImage) -> Result<Pattern, CodecError> {
    if image.width() != CANONICAL_SIZE || image.height() != CANONICAL_SIZE {
        return Err(CodecError::InvalidImageFormat(format!(
            "expected {CANONICAL_SIZE}x{CANONICAL_SIZE} canonical image, got {}x{}",
            image.width(),
            image.height()
        )));
    }

    let grid = image::imageops::resize(
        image,
        PATTERN_SIZE as u32,
        PATTERN_SIZE as u32,
        FilterType::Triangle,
    );
    let mut values = Vec::with_capacity(PATTERN_VALUES);
    for row in 0..PATTERN_SIZE as u32 {
        for col in 0..PATTERN_SIZE as u32 {
            values.extend_from_slice(&color::rgb_to_lab(grid.get_pixel(col, row).0));
        }
    }
    Pattern::from_values(values)
}

/// Normalizes raw image bytes and encodes the result.
pub fn encode_bytes(raw: &[u8]) -> Result<Pattern, CodecError> {
    encode(&normalize(raw)?)
}

/// Renders a `PATTERN_SIZE x PATTERN_SIZE` preview of a pattern.
pub fn decode(pattern: &Pattern) -> Result<RgbImage, CodecError> {
    decode_values(pattern.values())
}

pub fn decode_values(values: &[f32]) -> Result<RgbImage, CodecError> {
    check_shape(values)?;
    let mut out = RgbImage::new(PATTERN_SIZE as u32, PATTERN_SIZE as u32);
    for (idx, cell) in values.chunks_exact(3).enumerate() {
        let row = (idx / PATTERN_SIZE) as u32;
        let col = (idx % PATTERN_SIZE) as u32;
        out.put_pixel(col, row, Rgb(color::lab_to_rgb([cell[0], cell[1], cell[2]])));
    }
    Ok(out)
}

/// Distance between two patterns: the sum over cells of the Euclidean
/// distance between their Lab colours.
pub fn metric(a: &Pattern, b: &Pattern) -> f32 {
    accumulate(a.values(), b.values(), f64::INFINITY).unwrap_or(f64::INFINITY) as f32
}

/// Slice form of [`metric`]; fails when either side has the wrong shape.
pub fn metric_values(a: &[f32], b: &[f32]) -> Result<f32, CodecError> {
    check_shape(a)?;
    check_shape(b)?;
    Ok(accumulate(a, b, f64::INFINITY).unwrap_or(f64::INFINITY) as f32)
}

/// Like [`metric_values`] but gives up as soon as the running sum exceeds
/// `bound`, returning `Ok(None)`.
///
/// Inclusion is decided on the `f64` accumulator, so `Some(d)` is returned
/// exactly when the full distance is `<= bound`.
pub fn bounded_metric(a: &[f32], b: &[f32], bound: f64) -> Result<Option<f32>, CodecError> {
    check_shape(a)?;
    check_shape(b)?;
    Ok(accumulate(a, b, bound).map(|d| d as f32))
}

/// Codec-defined normalisation constant: the Lab distance between black and
/// white, times the number of cells.
pub fn max_pattern_distance() -> f32 {
    static MAX: OnceLock<f32> = OnceLock::new();
    *MAX.get_or_init(|| {
        let black = color::rgb_to_lab([0, 0, 0]);
        let white = color::rgb_to_lab([255, 255, 255]);
        (color::lab_distance(black, white) * PATTERN_CELLS as f64) as f32
    })
}

fn accumulate(a: &[f32], b: &[f32], bound: f64) -> Option<f64> {
    let mut acc = 0.0f64;
    for (ca, cb) in a.chunks_exact(3).zip(b.chunks_exact(3)) {
        acc += color::lab_distance([ca[0], ca[1], ca[2]], [cb[0], cb[1], cb[2]]);
        if acc > bound {
            return None;
        }
    }
    Some(acc)
}

fn check_shape(values: &[f32]) -> Result<(), CodecError> {
    if values.len() != PATTERN_VALUES {
        return Err(CodecError::CorruptPattern(format!(
            "expected {PATTERN_VALUES} values, got {}",
            values.len()
        )));
    }
    Ok(())
}
