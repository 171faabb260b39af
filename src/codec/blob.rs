//! Binary pattern blob.
//!
//! Layout (little endian):
//! `tag "pt1" | codec version u16 | cell count u16 | crc32 u32 | values f32 * 3 * cells`
//! The crc32 covers the value bytes only.

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, Pattern, CODEC_VERSION, PATTERN_CELLS};

pub const BLOB_TAG: &[u8] = b"pt1";
const HEADER_LEN: usize = 3 + 2 + 2 + 4;

pub fn encode_blob(pattern: &Pattern) -> Bytes {
    let values = pattern.values();
    let mut payload = Vec::with_capacity(values.len() * 4);
    for v in values {
        payload.extend_from_slice(&v.to_le_bytes());
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_slice(BLOB_TAG);
    out.put_u16_le(CODEC_VERSION);
    out.put_u16_le(PATTERN_CELLS as u16);
    out.put_u32_le(crc32fast::hash(&payload));
    out.put_slice(&payload);
    out.freeze()
}

pub fn decode_blob(raw: &[u8]) -> Result<Pattern, CodecError> {
    Pattern::from_values(decode_blob_values(raw)?)
}

/// Checks framing, version and checksum and returns the raw values without
/// enforcing the pattern shape.
pub(crate) fn decode_blob_values(raw: &[u8]) -> Result<Vec<f32>, CodecError> {
    let mut cursor = 0usize;
    let tag = take(raw, &mut cursor, BLOB_TAG.len())?;
    if tag != BLOB_TAG {
        return Err(corrupt("unknown blob tag"));
    }
    let version = read_u16(raw, &mut cursor)?;
    if version != CODEC_VERSION {
        return Err(CodecError::CorruptPattern(format!(
            "codec version {version} is not comparable with version {CODEC_VERSION}"
        )));
    }
    let cells = usize::from(read_u16(raw, &mut cursor)?);
    let expected_crc = read_u32(raw, &mut cursor)?;
    let payload = take(raw, &mut cursor, cells * 3 * 4)?;
    if cursor != raw.len() {
        return Err(corrupt("trailing bytes after pattern values"));
    }
    if crc32fast::hash(payload) != expected_crc {
        return Err(corrupt("checksum mismatch"));
    }

    Ok(payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn take<'a>(raw: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], CodecError> {
    let end = cursor.saturating_add(len);
    let Some(bytes) = raw.get(*cursor..end) else {
        return Err(corrupt("blob truncated"));
    };
    *cursor = end;
    Ok(bytes)
}

fn read_u16(raw: &[u8], cursor: &mut usize) -> Result<u16, CodecError> {
    let b = take(raw, cursor, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(raw: &[u8], cursor: &mut usize) -> Result<u32, CodecError> {
    let b = take(raw, cursor, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn corrupt(msg: &str) -> CodecError {
    CodecError::CorruptPattern(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_decodes_to_same_pattern() {
        let pattern = Pattern::uniform([33, 66, 99]);
        let blob = encode_blob(&pattern);
        assert!(blob.starts_with(BLOB_TAG));
        assert_eq!(decode_blob(&blob).unwrap(), pattern);
    }

    #[test]
    fn flipped_value_byte_fails_checksum() {
        let blob = encode_blob(&Pattern::uniform([1, 2, 3]));
        let mut raw = blob.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0x40;
        let err = decode_blob(&raw).unwrap_err();
        assert!(err.to_string().contains("checksum"), "{err}");
    }

    #[test]
    fn other_codec_version_is_rejected() {
        let mut raw = encode_blob(&Pattern::uniform([1, 2, 3])).to_vec();
        raw[3] = raw[3].wrapping_add(1);
        assert!(matches!(decode_blob(&raw), Err(CodecError::CorruptPattern(_))));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let raw = encode_blob(&Pattern::uniform([1, 2, 3]));
        for len in [0, 2, HEADER_LEN, raw.len() - 1] {
            assert!(decode_blob(&raw[..len]).is_err(), "len={len}");
        }
    }

    #[test]
    fn wrong_cell_count_keeps_values_but_fails_shape() {
        let values = vec![1.0f32; 6];
        let mut payload = Vec::new();
        for v in &values {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let mut raw = Vec::new();
        raw.extend_from_slice(BLOB_TAG);
        raw.extend_from_slice(&CODEC_VERSION.to_le_bytes());
        raw.extend_from_slice(&2u16.to_le_bytes());
        raw.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        raw.extend_from_slice(&payload);

        assert_eq!(decode_blob_values(&raw).unwrap(), values);
        assert!(matches!(decode_blob(&raw), Err(CodecError::CorruptPattern(_))));
    }
}
