//! Pattern store.
//!
//! Records live in an arena of immutable chunks. The last chunk is still being
//! filled; every write publishes a fresh [`StoreSnapshot`] (sealed chunks are
//! shared, the open tail is copied) through `arc-swap`, so a scan keeps
//! working on the snapshot it started with while writers move on.
//!
//! In directory mode every record is appended to the `PATTERNS` log before it
//! becomes visible.

mod arena;
mod log;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::codec::{CodecError, Pattern};
use crate::pivot::{CandidateLevels, Level, LevelTag, PivotIndex};

use arena::Chunk;
use log::{PatternLog, Replayed};

pub use arena::{PatternRecord, RecordView, Scan, StoreSnapshot};
pub use log::{RecoveryReport, PATTERNS_FILE};
#[cfg(test)]
pub(crate) use log::damage_pattern_blob;

pub type ArtworkId = u64;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// fsync the pattern log after every put.
    pub fsync_writes: bool,
    /// Records per arena chunk; also the unit of parallel scanning.
    pub chunk_records: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            fsync_writes: true,
            chunk_records: 128,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artwork {0} already has a pattern")]
    DuplicateArtwork(ArtworkId),

    #[error("artwork {0} not found")]
    NotFound(ArtworkId),

    #[error("pattern: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScrubReport {
    pub records_checked: u64,
    pub records_by_level: BTreeMap<Level, u64>,
    pub untagged: u64,
    /// Ids whose pattern no longer decodes, ascending.
    pub corrupt: Vec<ArtworkId>,
}

impl ScrubReport {
    fn merge(&mut self, other: ScrubReport) {
        self.records_checked += other.records_checked;
        self.untagged += other.untagged;
        for (level, n) in other.records_by_level {
            *self.records_by_level.entry(level).or_default() += n;
        }
        self.corrupt.extend(other.corrupt);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub chunks: usize,
    pub level_fingerprint: Option<u64>,
    pub log_path: Option<PathBuf>,
    pub recovery: RecoveryReport,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    chunk: usize,
    slot: usize,
}

#[derive(Debug)]
struct Writer {
    sealed: Vec<Arc<Chunk>>,
    tail: Chunk,
    len: usize,
    chunk_records: usize,
    fingerprint: Option<u64>,
    log: Option<PatternLog>,
}

impl Writer {
    fn new(chunk_records: usize, log: Option<PatternLog>) -> Self {
        let chunk_records = chunk_records.max(1);
        Self {
            sealed: Vec::new(),
            tail: Chunk::with_capacity(chunk_records),
            len: 0,
            chunk_records,
            fingerprint: None,
            log,
        }
    }

    fn push(&mut self, id: ArtworkId, level: Option<Level>, values: &[f32]) -> Location {
        let location = Location {
            chunk: self.sealed.len(),
            slot: self.tail.len(),
        };
        self.tail.push(id, level, values);
        self.len += 1;
        if self.tail.len() >= self.chunk_records {
            let full = std::mem::replace(&mut self.tail, Chunk::with_capacity(self.chunk_records));
            self.sealed.push(Arc::new(full));
        }
        location
    }

    fn snapshot(&self) -> StoreSnapshot {
        let mut chunks = self.sealed.clone();
        if !self.tail.is_empty() {
            chunks.push(Arc::new(self.tail.clone()));
        }
        StoreSnapshot {
            chunks,
            len: self.len,
            fingerprint: self.fingerprint,
        }
    }

    fn set_levels<F>(&mut self, fingerprint: Option<u64>, level_of: F)
    where
        F: Fn(&RecordView<'_>) -> Option<Level> + Sync + Copy,
    {
        let sealed: Vec<Arc<Chunk>> = self
            .sealed
            .par_iter()
            .map(|chunk| Arc::new(chunk.with_levels(level_of)))
            .collect();
        self.sealed = sealed;
        self.tail = self.tail.with_levels(level_of);
        self.fingerprint = fingerprint;
    }
}

/// Durable `(artwork_id, pattern)` collection. One record per artwork;
/// records are never updated or removed.
#[derive(Debug)]
pub struct PatternStore {
    options: StoreOptions,
    snapshot: ArcSwap<StoreSnapshot>,
    locations: RwLock<FxHashMap<ArtworkId, Location>>,
    writer: Mutex<Writer>,
    recovery: RecoveryReport,
}

impl PatternStore {
    /// Store that lives only in memory.
    pub fn in_memory(options: StoreOptions) -> Self {
        let writer = Writer::new(options.chunk_records, None);
        Self {
            options,
            snapshot: ArcSwap::from_pointee(StoreSnapshot::default()),
            locations: RwLock::new(FxHashMap::default()),
            writer: Mutex::new(writer),
            recovery: RecoveryReport::default(),
        }
    }

    /// Opens (or creates) a store in `dir`, replaying its pattern log.
    pub fn open(dir: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        let (log, replayed, mut recovery) = PatternLog::open(dir)?;
        let mut writer = Writer::new(options.chunk_records, Some(log));
        let mut locations = FxHashMap::default();

        for record in replayed {
            let (artwork_id, values) = match record {
                Replayed::Valid { artwork_id, values } => (artwork_id, values),
                Replayed::Corrupt { artwork_id, reason } => {
                    tracing::debug!(artwork_id, %reason, "recovered corrupt pattern entry");
                    (artwork_id, Vec::new())
                }
            };
            if locations.contains_key(&artwork_id) {
                tracing::warn!(artwork_id, "ignoring duplicate record in pattern log");
                recovery.duplicate_records += 1;
                continue;
            }
            let location = writer.push(artwork_id, None, &values);
            locations.insert(artwork_id, location);
        }

        tracing::info!(
            dir = %dir.display(),
            records = writer.len,
            corrupt = recovery.corrupt_patterns,
            skipped = recovery.checksum_failures,
            skipped_bytes = recovery.skipped_bytes,
            "pattern store opened"
        );

        let snapshot = writer.snapshot();
        Ok(Self {
            options,
            snapshot: ArcSwap::from_pointee(snapshot),
            locations: RwLock::new(locations),
            writer: Mutex::new(writer),
            recovery,
        })
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn put(&self, artwork_id: ArtworkId, pattern: &Pattern) -> Result<(), StoreError> {
        self.insert(artwork_id, pattern, None)
    }

    /// Stores a record together with its nearest-pivot level.
    ///
    /// The tag is kept only if it comes from the pivot index the store's
    /// other tags belong to; otherwise the record is stored untagged and is
    /// visited by every filtered scan.
    pub fn put_tagged(
        &self,
        artwork_id: ArtworkId,
        pattern: &Pattern,
        tag: LevelTag,
    ) -> Result<(), StoreError> {
        self.insert(artwork_id, pattern, Some(tag))
    }

    fn insert(
        &self,
        artwork_id: ArtworkId,
        pattern: &Pattern,
        tag: Option<LevelTag>,
    ) -> Result<(), StoreError> {
        let mut guard = self.writer.lock();
        let writer = &mut *guard;
        if self.locations.read().contains_key(&artwork_id) {
            return Err(StoreError::DuplicateArtwork(artwork_id));
        }

        let mut fingerprint = writer.fingerprint;
        let level = match (tag, fingerprint) {
            (None, _) => None,
            (Some(tag), Some(fp)) if fp == tag.fingerprint => Some(tag.level),
            (Some(_), Some(_)) => None,
            (Some(tag), None) => {
                fingerprint = Some(tag.fingerprint);
                Some(tag.level)
            }
        };

        if let Some(log) = writer.log.as_mut() {
            log.append(artwork_id, pattern, self.options.fsync_writes)?;
        }
        writer.fingerprint = fingerprint;
        let location = writer.push(artwork_id, level, pattern.values());
        self.snapshot.store(Arc::new(writer.snapshot()));
        self.locations.write().insert(artwork_id, location);
        Ok(())
    }

    pub fn get(&self, artwork_id: ArtworkId) -> Result<Pattern, StoreError> {
        let location = self
            .locations
            .read()
            .get(&artwork_id)
            .copied()
            .ok_or(StoreError::NotFound(artwork_id))?;
        let snapshot = self.snapshot.load();
        let chunk = snapshot
            .chunks
            .get(location.chunk)
            .ok_or(StoreError::NotFound(artwork_id))?;
        Ok(chunk.record(location.slot).pattern()?)
    }

    pub fn contains(&self, artwork_id: ArtworkId) -> bool {
        self.locations.read().contains_key(&artwork_id)
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Artwork ids in insertion order.
    pub fn ids(&self) -> Vec<ArtworkId> {
        self.scan(None).iter().map(|r| r.artwork_id).collect()
    }

    /// Every decodable record, in insertion order.
    pub fn records(&self) -> Vec<PatternRecord> {
        self.scan(None)
            .iter()
            .filter_map(|r| r.to_record().ok())
            .collect()
    }

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.load_full()
    }

    /// Scan over the current snapshot, optionally restricted to `levels`.
    pub fn scan(&self, levels: Option<&CandidateLevels>) -> Scan {
        let snapshot = self.snapshot.load_full();
        let filter = match levels {
            Some(levels) if snapshot.fingerprint == Some(levels.fingerprint()) => {
                Some(levels.levels().clone())
            }
            Some(levels) => {
                tracing::debug!(
                    filter = levels.fingerprint(),
                    store = ?snapshot.fingerprint,
                    "level filter does not match stored tags; scanning all records"
                );
                None
            }
            None => None,
        };
        Scan::new(snapshot, filter)
    }

    /// Recomputes every record's level against `index`.
    pub fn relevel(&self, index: &PivotIndex) {
        let mut writer = self.writer.lock();
        writer.set_levels(Some(index.fingerprint()), |r: &RecordView<'_>| {
            r.pattern().ok().map(|p| index.bucket_for(&p))
        });
        self.snapshot.store(Arc::new(writer.snapshot()));
        tracing::info!(
            records = writer.len,
            fingerprint = index.fingerprint(),
            "store relevelled"
        );
    }

    /// Drops every level tag; subsequent scans visit all records.
    pub fn clear_levels(&self) {
        let mut writer = self.writer.lock();
        writer.set_levels(None, |_: &RecordView<'_>| None);
        self.snapshot.store(Arc::new(writer.snapshot()));
    }

    /// Checks every record of the current snapshot, chunks in parallel.
    pub fn scrub(&self) -> ScrubReport {
        let snapshot = self.snapshot.load_full();
        let parts: Vec<ScrubReport> = snapshot
            .chunks
            .par_iter()
            .map(|chunk| {
                let mut part = ScrubReport::default();
                for record in chunk.records() {
                    part.records_checked += 1;
                    match record.level {
                        Some(level) => *part.records_by_level.entry(level).or_default() += 1,
                        None => part.untagged += 1,
                    }
                    if record.pattern().is_err() {
                        part.corrupt.push(record.artwork_id);
                    }
                }
                part
            })
            .collect();

        let mut report = ScrubReport::default();
        for part in parts {
            report.merge(part);
        }
        report.corrupt.sort_unstable();
        if !report.corrupt.is_empty() {
            tracing::warn!(corrupt = report.corrupt.len(), "scrub found corrupt patterns");
        }
        report
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn stats(&self) -> StoreStats {
        let writer = self.writer.lock();
        let snapshot = self.snapshot.load();
        StoreStats {
            records: snapshot.len,
            chunks: snapshot.chunks.len(),
            level_fingerprint: snapshot.fingerprint,
            log_path: writer.log.as_ref().map(|log| log.path().to_path_buf()),
            recovery: self.recovery.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::pivot::Pivot;

    fn shade(v: u8) -> Pattern {
        Pattern::uniform([v, v, v])
    }

    fn small_chunks() -> StoreOptions {
        StoreOptions {
            fsync_writes: false,
            chunk_records: 2,
        }
    }

    #[test]
    fn duplicate_put_leaves_store_unchanged() -> anyhow::Result<()> {
        let store = PatternStore::in_memory(StoreOptions::default());
        store.put(1, &shade(10))?;
        assert!(matches!(
            store.put(1, &shade(200)),
            Err(StoreError::DuplicateArtwork(1))
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1)?, shade(10));
        Ok(())
    }

    #[test]
    fn missing_id_is_not_found() {
        let store = PatternStore::in_memory(StoreOptions::default());
        assert!(matches!(store.get(5), Err(StoreError::NotFound(5))));
        assert!(!store.contains(5));
        assert!(store.is_empty());
    }

    #[test]
    fn scan_follows_insertion_order_across_chunks() -> anyhow::Result<()> {
        let store = PatternStore::in_memory(small_chunks());
        for id in [9, 3, 7, 1, 5] {
            store.put(id, &shade(id as u8))?;
        }
        assert_eq!(store.ids(), vec![9, 3, 7, 1, 5]);
        assert_eq!(store.stats().chunks, 3);
        for id in [9, 3, 7, 1, 5] {
            assert_eq!(store.get(id)?, shade(id as u8));
        }
        Ok(())
    }

    #[test]
    fn scan_does_not_see_later_writes() -> anyhow::Result<()> {
        let store = PatternStore::in_memory(small_chunks());
        store.put(1, &shade(1))?;
        let scan = store.scan(None);
        store.put(2, &shade(2))?;
        store.put(3, &shade(3))?;
        assert_eq!(scan.iter().count(), 1);
        assert_eq!(scan.snapshot_len(), 1);
        assert_eq!(store.scan(None).iter().count(), 3);
        Ok(())
    }

    #[test]
    fn reopened_store_keeps_records() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        {
            let store = PatternStore::open(dir.path(), small_chunks())?;
            store.put(11, &shade(11))?;
            store.put(12, &shade(12))?;
            store.put(13, &shade(13))?;
        }
        let store = PatternStore::open(dir.path(), small_chunks())?;
        assert_eq!(store.ids(), vec![11, 12, 13]);
        assert_eq!(store.get(12)?, shade(12));
        assert!(matches!(
            store.put(13, &shade(0)),
            Err(StoreError::DuplicateArtwork(13))
        ));
        assert_eq!(store.recovery().records_replayed, 3);
        Ok(())
    }

    #[test]
    fn corrupt_log_entry_reserves_id() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        {
            let store = PatternStore::open(dir.path(), small_chunks())?;
            store.put(1, &shade(1))?;
        }
        damage_pattern_blob(dir.path(), 1)?;

        let store = PatternStore::open(dir.path(), small_chunks())?;
        assert!(store.contains(1));
        assert!(matches!(store.get(1), Err(StoreError::Codec(_))));
        assert!(matches!(
            store.put(1, &shade(1)),
            Err(StoreError::DuplicateArtwork(1))
        ));
        assert_eq!(store.scrub().corrupt, vec![1]);
        Ok(())
    }

    #[test]
    fn level_filter_applies_only_to_matching_index() -> anyhow::Result<()> {
        let index = PivotIndex::build(vec![
            Pivot::new(0, shade(0)),
            Pivot::new(1, shade(128)),
            Pivot::new(2, shade(255)),
        ])?;
        let other = PivotIndex::build(vec![Pivot::new(0, shade(60))])?;
        let store = PatternStore::in_memory(StoreOptions::default());
        store.put_tagged(1, &shade(5), index.tag_for(&shade(5)))?;
        store.put_tagged(2, &shade(250), index.tag_for(&shade(250)))?;
        // Tag from a different index is dropped.
        store.put_tagged(3, &shade(240), other.tag_for(&shade(240)))?;

        let dark = index.candidate_levels(&shade(5), 0.0);
        assert!(!dark.contains(2));
        let ids: Vec<ArtworkId> = store
            .scan(Some(&dark))
            .iter()
            .map(|r| r.artwork_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);

        let foreign = other.candidate_levels(&shade(5), 0.0);
        assert!(!store.scan(Some(&foreign)).is_filtered());
        assert!(store.scan(Some(&dark)).is_filtered());
        Ok(())
    }

    #[test]
    fn relevel_and_clear_levels() -> anyhow::Result<()> {
        let store = PatternStore::in_memory(small_chunks());
        for v in [0u8, 100, 200, 255] {
            store.put(u64::from(v), &shade(v))?;
        }
        let index = PivotIndex::build(vec![Pivot::new(0, shade(0)), Pivot::new(1, shade(255))])?;
        store.relevel(&index);
        let report = store.scrub();
        assert_eq!(report.records_checked, 4);
        assert_eq!(report.untagged, 0);
        assert_eq!(report.records_by_level.get(&0), Some(&2));
        assert_eq!(report.records_by_level.get(&1), Some(&2));
        assert_eq!(store.stats().level_fingerprint, Some(index.fingerprint()));

        store.clear_levels();
        let report = store.scrub();
        assert_eq!(report.untagged, 4);
        assert_eq!(store.stats().level_fingerprint, None);
        Ok(())
    }

    #[test]
    fn concurrent_duplicate_puts_have_one_winner() -> anyhow::Result<()> {
        let store = Arc::new(PatternStore::in_memory(small_chunks()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || store.put(77, &shade(t)).is_ok())
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.join().expect("writer thread panicked") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
        Ok(())
    }
}
