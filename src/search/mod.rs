//! Similarity search engine.
//!
//! A search takes one store snapshot, narrows it to the candidate levels the
//! installed pivot index allows (or scans everything when there is no
//! index), measures every candidate against the query with an early-exit
//! metric, and returns the matches within `radius` sorted by
//! `(distance, artwork_id)` and cut to `limit`.

mod control;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use rayon::prelude::*;
use serde::Serialize;

use crate::codec::{bounded_metric, encode_bytes, max_pattern_distance, CodecError, Pattern, N_LEVELS};
use crate::pivot::PivotIndex;
use crate::store::{ArtworkId, PatternStore, RecordView, Scan, StoreError};

pub use control::{CancelToken, SearchControl};

/// Limit used when the caller does not pass one.
pub const DEFAULT_LIMIT: usize = 20;

/// Radius used when the caller does not pass one: a tenth of the maximum
/// pattern distance.
pub fn default_radius() -> f32 {
    max_pattern_distance() / 10.0
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Use the installed pivot index to skip levels that cannot match.
    pub prune_with_pivots: bool,
    /// Snapshots with at least this many records are scanned chunk-parallel.
    pub parallel_threshold: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            prune_with_pivots: true,
            parallel_threshold: 4096,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid radius {0}: must be a non-negative number")]
    InvalidRadius(f32),

    #[error("invalid limit: must be at least 1")]
    InvalidLimit,

    #[error("search cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One ranked hit with its derived scores.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub artwork_id: ArtworkId,
    pub distance: f32,
    pub discrete_distance_level: u32,
    pub proportional_distance: f32,
    pub similarity: f32,
    pub percentage_similarity: f32,
}

impl MatchResult {
    pub fn from_distance(artwork_id: ArtworkId, distance: f32) -> Self {
        let max = max_pattern_distance();
        let proportional = (distance / max).min(1.0);
        let level = ((proportional * N_LEVELS as f32).floor() as u32).min(N_LEVELS - 1);
        Self {
            artwork_id,
            distance,
            discrete_distance_level: level,
            proportional_distance: proportional,
            similarity: max * (1.0 - proportional),
            percentage_similarity: 100.0 * (1.0 - proportional),
        }
    }
}

/// What a search is measured against.
#[derive(Debug, Clone)]
pub enum Reference {
    Artwork(ArtworkId),
    /// Raw image bytes; normalised and encoded before the search.
    Image(Vec<u8>),
    Pattern(Pattern),
}

#[derive(Debug, Clone)]
pub struct Query {
    pub reference: Reference,
    pub radius: f32,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchReport {
    pub matches: Vec<MatchResult>,
    /// Candidates whose distance was measured (or attempted).
    pub scanned: u64,
    pub corrupt_skipped: u64,
    /// Number of candidate levels, when the scan was level-filtered.
    pub levels_probed: Option<usize>,
    /// False when a budget or deadline stopped the scan early.
    pub complete: bool,
}

impl SearchReport {
    fn empty() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }
}

/// Per-search shared scan state.
struct ScanState<'a> {
    control: &'a SearchControl,
    query: &'a [f32],
    bound: f64,
    scanned: AtomicU64,
    corrupt: AtomicU64,
    truncated: AtomicBool,
}

impl ScanState<'_> {
    /// Claims one unit of budget; false once the budget is spent.
    fn claim(&self) -> bool {
        let prior = self.scanned.fetch_add(1, Ordering::Relaxed);
        match self.control.budget {
            Some(budget) if prior >= budget => {
                self.scanned.fetch_sub(1, Ordering::Relaxed);
                self.truncated.store(true, Ordering::Relaxed);
                false
            }
            _ => true,
        }
    }

    fn measure<'r>(
        &self,
        records: impl Iterator<Item = RecordView<'r>>,
    ) -> Result<Vec<MatchResult>, SearchError> {
        if self.control.is_cancelled() {
            return Err(SearchError::Cancelled);
        }
        if self.truncated.load(Ordering::Relaxed) {
            return Ok(Vec::new());
        }
        if self.control.past_deadline() {
            self.truncated.store(true, Ordering::Relaxed);
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for record in records {
            if !self.claim() {
                break;
            }
            if record.is_corrupt() {
                self.skip_corrupt(record.artwork_id);
                continue;
            }
            match bounded_metric(self.query, record.values(), self.bound) {
                Ok(Some(distance)) if distance.is_finite() => {
                    hits.push(MatchResult::from_distance(record.artwork_id, distance));
                }
                Ok(Some(_)) | Err(_) => self.skip_corrupt(record.artwork_id),
                Ok(None) => {}
            }
        }
        Ok(hits)
    }

    fn skip_corrupt(&self, artwork_id: ArtworkId) {
        tracing::debug!(artwork_id, "skipping corrupt candidate");
        self.corrupt.fetch_add(1, Ordering::Relaxed);
    }
}

/// Range search over a [`PatternStore`], optionally pruned by a
/// [`PivotIndex`].
#[derive(Debug)]
pub struct SimilarityEngine {
    store: Arc<PatternStore>,
    pivots: ArcSwapOption<PivotIndex>,
    options: SearchOptions,
}

impl SimilarityEngine {
    pub fn new(store: Arc<PatternStore>, options: SearchOptions) -> Self {
        Self {
            store,
            pivots: ArcSwapOption::empty(),
            options,
        }
    }

    pub fn store(&self) -> &Arc<PatternStore> {
        &self.store
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    pub fn pivots(&self) -> Option<Arc<PivotIndex>> {
        self.pivots.load_full()
    }

    /// Installs (or removes) the pivot index. Stored records are relevelled
    /// against the new index before it becomes visible to searches.
    pub fn install_pivots(&self, index: Option<Arc<PivotIndex>>) {
        match index {
            Some(index) => {
                self.store.relevel(&index);
                tracing::info!(
                    pivots = index.len(),
                    levels = index.levels().len(),
                    fingerprint = index.fingerprint(),
                    "pivot index installed"
                );
                self.pivots.store(Some(index));
            }
            None => {
                self.pivots.store(None);
                tracing::info!("pivot index removed; searches scan linearly");
            }
        }
    }

    /// Stores a pattern, tagged with its level when a pivot index is installed.
    pub fn insert(&self, artwork_id: ArtworkId, pattern: &Pattern) -> Result<(), StoreError> {
        match self.pivots.load_full() {
            Some(index) => self
                .store
                .put_tagged(artwork_id, pattern, index.tag_for(pattern)),
            None => self.store.put(artwork_id, pattern),
        }
    }

    pub fn search(
        &self,
        query: &Pattern,
        radius: f32,
        limit: usize,
    ) -> Result<Vec<MatchResult>, SearchError> {
        Ok(self
            .search_with(query, radius, limit, &SearchControl::default())?
            .matches)
    }

    /// Resolves the query's reference, then searches.
    pub fn execute(&self, query: &Query, control: &SearchControl) -> Result<SearchReport, SearchError> {
        if self.store.is_empty() {
            return Ok(SearchReport::empty());
        }
        match &query.reference {
            Reference::Pattern(pattern) => self.search_with(pattern, query.radius, query.limit, control),
            Reference::Artwork(id) => {
                let pattern = self.store.get(*id)?;
                self.search_with(&pattern, query.radius, query.limit, control)
            }
            Reference::Image(raw) => {
                let pattern = encode_bytes(raw)?;
                self.search_with(&pattern, query.radius, query.limit, control)
            }
        }
    }

    pub fn search_with(
        &self,
        query: &Pattern,
        radius: f32,
        limit: usize,
        control: &SearchControl,
    ) -> Result<SearchReport, SearchError> {
        let started = Instant::now();
        if self.store.is_empty() {
            return Ok(SearchReport::empty());
        }
        if radius.is_nan() || radius < 0.0 {
            return Err(SearchError::InvalidRadius(radius));
        }
        if limit == 0 {
            return Err(SearchError::InvalidLimit);
        }
        if control.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let index = if self.options.prune_with_pivots {
            self.pivots.load_full()
        } else {
            None
        };
        let levels = index.map(|index| index.candidate_levels(query, radius));
        let scan = self.store.scan(levels.as_ref());
        let levels_probed = match (&levels, scan.is_filtered()) {
            (Some(levels), true) => Some(levels.len()),
            _ => None,
        };

        let state = ScanState {
            control,
            query: query.values(),
            bound: f64::from(radius),
            scanned: AtomicU64::new(0),
            corrupt: AtomicU64::new(0),
            truncated: AtomicBool::new(false),
        };
        let mut matches = self.scan_chunks(&scan, &state)?;
        matches.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.artwork_id.cmp(&b.artwork_id))
        });
        matches.truncate(limit);

        let report = SearchReport {
            matches,
            scanned: state.scanned.into_inner(),
            corrupt_skipped: state.corrupt.into_inner(),
            levels_probed,
            complete: !state.truncated.into_inner(),
        };
        if report.corrupt_skipped > 0 {
            tracing::warn!(
                corrupt = report.corrupt_skipped,
                "search skipped corrupt candidates"
            );
        }
        tracing::debug!(
            radius,
            limit,
            snapshot = scan.snapshot_len(),
            scanned = report.scanned,
            matches = report.matches.len(),
            levels_probed = ?report.levels_probed,
            complete = report.complete,
            elapsed_us = started.elapsed().as_micros() as u64,
            "search finished"
        );
        Ok(report)
    }

    fn scan_chunks(&self, scan: &Scan, state: &ScanState<'_>) -> Result<Vec<MatchResult>, SearchError> {
        let parts: Vec<Vec<MatchResult>> = if scan.snapshot_len() >= self.options.parallel_threshold {
            scan.chunks()
                .par_iter()
                .map(|chunk| state.measure(scan.chunk_records(chunk)))
                .collect::<Result<_, _>>()?
        } else {
            scan.chunks()
                .iter()
                .map(|chunk| state.measure(scan.chunk_records(chunk)))
                .collect::<Result<_, _>>()?
        };
        Ok(parts.into_iter().flatten().collect())
    }
}
