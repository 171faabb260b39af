use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::{decode_blob, encode_blob};

use super::{Pivot, PivotError, PivotIndex};

pub const PIVOTS_FILE: &str = "PIVOTS";
const PIVOTS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedPivotSet {
    schema_version: u32,
    pivots: Vec<PersistedPivot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedPivot {
    level: i32,
    pattern: Vec<u8>,
}

/// Writes the pivot set to `dir/PIVOTS` via a temp file + rename.
///
/// Record framing: `[len u32][crc32 u32][bincode payload]`.
pub fn save_pivots(dir: &Path, index: &PivotIndex) -> Result<(), PivotError> {
    let set = PersistedPivotSet {
        schema_version: PIVOTS_SCHEMA_VERSION,
        pivots: index
            .pivots()
            .iter()
            .map(|p| PersistedPivot {
                level: p.level,
                pattern: encode_blob(&p.pattern).to_vec(),
            })
            .collect(),
    };
    let payload = bincode::serialize(&set).map_err(|e| PivotError::Corrupt(e.to_string()))?;
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| PivotError::Corrupt("pivot set too large".to_string()))?;

    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    buf.extend_from_slice(&payload);

    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{PIVOTS_FILE}.tmp"));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&buf)?;
        file.sync_data()?;
    }
    std::fs::rename(&tmp, dir.join(PIVOTS_FILE))?;
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

/// Loads `dir/PIVOTS`; `Ok(None)` when no pivot set has been built yet.
pub fn load_pivots(dir: &Path) -> Result<Option<PivotIndex>, PivotError> {
    let path = dir.join(PIVOTS_FILE);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if data.len() < 8 {
        return Err(PivotError::Corrupt("pivot file truncated".to_string()));
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let Some(payload) = data.get(8..8 + len) else {
        return Err(PivotError::Corrupt("pivot file truncated".to_string()));
    };
    if crc32fast::hash(payload) != crc {
        return Err(PivotError::Corrupt("pivot file checksum mismatch".to_string()));
    }

    let set: PersistedPivotSet =
        bincode::deserialize(payload).map_err(|e| PivotError::Corrupt(e.to_string()))?;
    if set.schema_version != PIVOTS_SCHEMA_VERSION {
        return Err(PivotError::Corrupt(format!(
            "unsupported pivot schema version {}",
            set.schema_version
        )));
    }

    let mut pivots = Vec::with_capacity(set.pivots.len());
    for p in set.pivots {
        pivots.push(Pivot::new(p.level, decode_blob(&p.pattern)?));
    }
    PivotIndex::build(pivots).map(Some)
}
