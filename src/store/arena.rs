use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codec::{CodecError, Pattern, PATTERN_VALUES};
use crate::pivot::Level;

use super::ArtworkId;

/// Immutable block of records. Pattern values of every record live in one
/// contiguous `values` vector; `spans` index into it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Chunk {
    ids: Vec<ArtworkId>,
    levels: Vec<Option<Level>>,
    spans: Vec<(u32, u32)>,
    values: Vec<f32>,
}

impl Chunk {
    pub(crate) fn with_capacity(records: usize) -> Self {
        Self {
            ids: Vec::with_capacity(records),
            levels: Vec::with_capacity(records),
            spans: Vec::with_capacity(records),
            values: Vec::with_capacity(records * PATTERN_VALUES),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn push(&mut self, id: ArtworkId, level: Option<Level>, values: &[f32]) {
        let offset = self.values.len() as u32;
        self.values.extend_from_slice(values);
        self.ids.push(id);
        self.levels.push(level);
        self.spans.push((offset, values.len() as u32));
    }

    pub(crate) fn record(&self, slot: usize) -> RecordView<'_> {
        let (offset, len) = self.spans[slot];
        RecordView {
            artwork_id: self.ids[slot],
            level: self.levels[slot],
            values: &self.values[offset as usize..(offset + len) as usize],
        }
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = RecordView<'_>> + '_ {
        (0..self.len()).map(move |slot| self.record(slot))
    }

    /// Copy of this chunk with every level replaced by `level_of(record)`.
    pub(crate) fn with_levels<F>(&self, level_of: F) -> Self
    where
        F: Fn(&RecordView<'_>) -> Option<Level>,
    {
        let levels = self.records().map(|r| level_of(&r)).collect();
        Self {
            ids: self.ids.clone(),
            levels,
            spans: self.spans.clone(),
            values: self.values.clone(),
        }
    }
}

/// A record borrowed from a store snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub artwork_id: ArtworkId,
    pub level: Option<Level>,
    values: &'a [f32],
}

impl<'a> RecordView<'a> {
    pub fn values(&self) -> &'a [f32] {
        self.values
    }

    /// A record is corrupt when its persisted pattern could not be decoded
    /// into the current codec's shape.
    pub fn is_corrupt(&self) -> bool {
        self.values.len() != PATTERN_VALUES
    }

    pub fn pattern(&self) -> Result<Pattern, CodecError> {
        Pattern::from_values(self.values.to_vec())
    }

    pub fn to_record(&self) -> Result<PatternRecord, CodecError> {
        Ok(PatternRecord {
            artwork_id: self.artwork_id,
            pattern: self.pattern()?,
        })
    }
}

/// Owned `(artwork_id, pattern)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternRecord {
    pub artwork_id: ArtworkId,
    pub pattern: Pattern,
}

/// Point-in-time view of the store.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    pub(crate) chunks: Vec<Arc<Chunk>>,
    pub(crate) len: usize,
    /// Fingerprint of the pivot index the level tags were computed with.
    pub(crate) fingerprint: Option<u64>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fingerprint(&self) -> Option<u64> {
        self.fingerprint
    }
}

/// Lazy, restartable scan over one snapshot.
///
/// Records come out in insertion order. When a level filter is active, a
/// record is yielded if its level is in the filter or if it has no level tag.
#[derive(Debug, Clone)]
pub struct Scan {
    snapshot: Arc<StoreSnapshot>,
    filter: Option<BTreeSet<Level>>,
}

impl Scan {
    pub(crate) fn new(snapshot: Arc<StoreSnapshot>, filter: Option<BTreeSet<Level>>) -> Self {
        Self { snapshot, filter }
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordView<'_>> + '_ {
        self.snapshot
            .chunks
            .iter()
            .flat_map(move |chunk| self.chunk_records(chunk))
    }

    /// Number of records in the snapshot, before level filtering.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len
    }

    pub fn is_filtered(&self) -> bool {
        self.filter.is_some()
    }

    pub(crate) fn chunks(&self) -> &[Arc<Chunk>] {
        &self.snapshot.chunks
    }

    pub(crate) fn chunk_records<'a>(
        &'a self,
        chunk: &'a Chunk,
    ) -> impl Iterator<Item = RecordView<'a>> + 'a {
        chunk.records().filter(move |r| self.accepts(r.level))
    }

    fn accepts(&self, level: Option<Level>) -> bool {
        match (&self.filter, level) {
            (None, _) | (Some(_), None) => true,
            (Some(filter), Some(level)) => filter.contains(&level),
        }
    }
}
