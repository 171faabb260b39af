use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::{decode_blob_values, encode_blob, Pattern};

use super::{ArtworkId, StoreError};

pub const PATTERNS_FILE: &str = "PATTERNS";

const FRAME_HEADER: usize = 8;
// A record is one pattern blob plus its id; anything far larger is a damaged
// length field.
const MAX_FRAME_PAYLOAD: usize = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogRecord {
    artwork_id: ArtworkId,
    pattern: Vec<u8>,
}

/// Outcome of replaying one log record.
#[derive(Debug)]
pub(crate) enum Replayed {
    Valid { artwork_id: ArtworkId, values: Vec<f32> },
    Corrupt { artwork_id: ArtworkId, reason: String },
}

/// What recovery found while replaying `PATTERNS`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub records_replayed: u64,
    /// Damaged regions skipped because a valid frame follows them.
    pub checksum_failures: u64,
    pub skipped_bytes: u64,
    pub corrupt_patterns: u64,
    pub duplicate_records: u64,
    pub truncated_bytes: u64,
}

/// Append-only pattern log.
///
/// Frame: `[len u32][crc32 u32][bincode payload]`, the crc covering the
/// length bytes and the payload. A damaged frame followed by valid frames is
/// skipped; only a damaged region running to the end of the file is
/// truncated.
#[derive(Debug)]
pub(crate) struct PatternLog {
    path: PathBuf,
    file: std::fs::File,
    poisoned: bool,
}

impl PatternLog {
    pub(crate) fn open(dir: &Path) -> Result<(Self, Vec<Replayed>, RecoveryReport), StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(PATTERNS_FILE);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let mut data = Vec::new();
        file.seek(std::io::SeekFrom::Start(0))?;
        file.read_to_end(&mut data)?;

        let (records, mut report, valid_len) = replay(&data);
        if valid_len < data.len() {
            let torn = (data.len() - valid_len) as u64;
            tracing::warn!(
                path = %path.display(),
                bytes = torn,
                "truncating torn tail of pattern log"
            );
            file.set_len(valid_len as u64)?;
            file.sync_data()?;
            report.truncated_bytes = torn;
        }
        Ok((
            Self {
                path,
                file,
                poisoned: false,
            },
            records,
            report,
        ))
    }

    /// Appends one record. On failure the file is cut back to its previous
    /// length so no partial frame is left behind.
    pub(crate) fn append(
        &mut self,
        artwork_id: ArtworkId,
        pattern: &Pattern,
        sync: bool,
    ) -> Result<(), StoreError> {
        if self.poisoned {
            return Err(StoreError::Io(std::io::Error::other(
                "pattern log holds a partial write; reopen the store to recover",
            )));
        }
        let record = LogRecord {
            artwork_id,
            pattern: encode_blob(pattern).to_vec(),
        };
        let payload = bincode::serialize(&record).map_err(|e| StoreError::Encode(e.to_string()))?;
        let frame = encode_frame(&payload)?;

        let start = self.file.metadata()?.len();
        let written = self.file.write_all(&frame).and_then(|()| {
            if sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            self.rewind(start);
            return Err(e.into());
        }
        Ok(())
    }

    fn rewind(&mut self, len: u64) {
        if let Err(e) = self.file.set_len(len) {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "could not drop partial frame; refusing further appends"
            );
            self.poisoned = true;
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, StoreError> {
    let len: u32 = payload
        .len()
        .try_into()
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_PAYLOAD)
        .ok_or_else(|| StoreError::Encode("log record too large".to_string()))?;
    let len_bytes = len.to_le_bytes();

    let mut buf = Vec::with_capacity(FRAME_HEADER + payload.len());
    buf.extend_from_slice(&len_bytes);
    buf.extend_from_slice(&frame_crc(&len_bytes, payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn frame_crc(len_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(len_bytes);
    hasher.update(payload);
    hasher.finalize()
}

/// The payload and end offset of the frame at `offset`, if a complete frame
/// with a matching checksum starts there.
fn frame_at(data: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let header = data.get(offset..offset.checked_add(FRAME_HEADER)?)?;
    let len = read_u32(header, 0) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return None;
    }
    let start = offset + FRAME_HEADER;
    let payload = data.get(start..start + len)?;
    (frame_crc(&header[..4], payload) == read_u32(header, 4)).then_some((payload, start + len))
}

/// Returns the replayed records, the report, and the offset past the last
/// valid frame. Bytes beyond that offset hold no valid frame.
fn replay(data: &[u8]) -> (Vec<Replayed>, RecoveryReport, usize) {
    let mut offset = 0usize;
    let mut records = Vec::new();
    let mut report = RecoveryReport::default();

    while offset < data.len() {
        let Some((payload, end)) = frame_at(data, offset) else {
            let Some(next) = (offset + 1..data.len()).find(|o| frame_at(data, *o).is_some()) else {
                break;
            };
            tracing::warn!(
                offset,
                bytes = next - offset,
                "skipping damaged region of pattern log"
            );
            report.checksum_failures += 1;
            report.skipped_bytes += (next - offset) as u64;
            offset = next;
            continue;
        };
        offset = end;

        let record: LogRecord = match bincode::deserialize(payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(offset, error = %e, "skipping undecodable pattern log record");
                report.checksum_failures += 1;
                continue;
            }
        };

        report.records_replayed += 1;
        match decode_blob_values(&record.pattern) {
            Ok(values) => records.push(Replayed::Valid {
                artwork_id: record.artwork_id,
                values,
            }),
            Err(e) => {
                tracing::warn!(
                    artwork_id = record.artwork_id,
                    error = %e,
                    "pattern could not be decoded; keeping id as corrupt entry"
                );
                report.corrupt_patterns += 1;
                records.push(Replayed::Corrupt {
                    artwork_id: record.artwork_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    (records, report, offset)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Rewrites the log so the pattern blob of `artwork_id` fails its own
/// checksum while the frame stays valid.
#[cfg(test)]
pub(crate) fn damage_pattern_blob(dir: &Path, artwork_id: ArtworkId) -> anyhow::Result<()> {
    let path = dir.join(PATTERNS_FILE);
    let data = std::fs::read(&path)?;
    let mut out = Vec::with_capacity(data.len());
    let mut offset = 0;
    while let Some((payload, end)) = frame_at(&data, offset) {
        let mut record: LogRecord = bincode::deserialize(payload)?;
        if record.artwork_id == artwork_id {
            if let Some(last) = record.pattern.last_mut() {
                *last ^= 0xFF;
            }
        }
        out.extend_from_slice(&encode_frame(&bincode::serialize(&record)?)?);
        offset = end;
    }
    std::fs::write(&path, out)?;
    Ok(())
}
