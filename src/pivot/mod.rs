//! Pivot index.
//!
//! Pivots are reference patterns tagged with a level. Every stored record is
//! bucketed under the level of its nearest pivot; a query then only needs the
//! buckets whose pivot could be near enough to hold a match.
//!
//! Pruning uses the generalised hyperplane bound. A record `r` bucketed at
//! pivot `p` satisfies `d(r, p) <= d(r, p_q)` for the query's nearest pivot
//! `p_q`, so by the triangle inequality
//! `d(q, r) >= (d(q, p) - d(q, p_q)) / 2`. A level is therefore only skipped
//! when every one of its pivots has `d(q, p) - d(q, p_q) > 2 * radius`.

mod persist;
mod select;

use std::collections::BTreeSet;

use crate::codec::{encode_blob, metric, CodecError, Pattern};

pub use persist::{load_pivots, save_pivots, PIVOTS_FILE};
pub use select::select_pivots;

pub type Level = i32;

// Float slack added to the pruning threshold; the metric is summed in f64 but
// reported as f32, so the triangle inequality only holds up to rounding.
const SLACK_REL: f32 = 1e-5;
const SLACK_ABS: f32 = 1e-2;

#[derive(Debug, thiserror::Error)]
pub enum PivotError {
    #[error("pivot set is empty")]
    EmptyPivotSet,

    #[error("pivot pattern: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pivot file corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pivot {
    pub level: Level,
    pub pattern: Pattern,
}

impl Pivot {
    pub fn new(level: Level, pattern: Pattern) -> Self {
        Self { level, pattern }
    }
}

/// Nearest-pivot level of a record, together with the fingerprint of the
/// index that computed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelTag {
    pub level: Level,
    pub fingerprint: u64,
}

/// Levels that may hold a match for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateLevels {
    fingerprint: u64,
    levels: BTreeSet<Level>,
}

impl CandidateLevels {
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn levels(&self) -> &BTreeSet<Level> {
        &self.levels
    }

    pub fn contains(&self, level: Level) -> bool {
        self.levels.contains(&level)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PivotIndex {
    pivots: Vec<Pivot>,
    levels: Vec<Level>,
    fingerprint: u64,
}

impl PivotIndex {
    pub fn build(mut pivots: Vec<Pivot>) -> Result<Self, PivotError> {
        if pivots.is_empty() {
            return Err(PivotError::EmptyPivotSet);
        }
        // Stable: pivots sharing a level keep their input order.
        pivots.sort_by_key(|p| p.level);

        let mut levels: Vec<Level> = pivots.iter().map(|p| p.level).collect();
        levels.dedup();

        let mut hasher = blake3::Hasher::new();
        for pivot in &pivots {
            hasher.update(&pivot.level.to_le_bytes());
            hasher.update(&encode_blob(&pivot.pattern));
        }
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);

        Ok(Self {
            pivots,
            levels,
            fingerprint: u64::from_le_bytes(head),
        })
    }

    pub fn pivots(&self) -> &[Pivot] {
        &self.pivots
    }

    /// Distinct levels, ascending.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.pivots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pivots.is_empty()
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Level of the pivot nearest to `pattern`; ties go to the lowest level.
    pub fn bucket_for(&self, pattern: &Pattern) -> Level {
        self.nearest(pattern).0
    }

    pub fn tag_for(&self, pattern: &Pattern) -> LevelTag {
        LevelTag {
            level: self.bucket_for(pattern),
            fingerprint: self.fingerprint,
        }
    }

    /// Every level that could contain a record within `radius` of `pattern`,
    /// widened by the immediate neighbour levels of each candidate.
    pub fn candidate_levels(&self, pattern: &Pattern, radius: f32) -> CandidateLevels {
        let radius = radius.max(0.0);
        let distances: Vec<f32> = self
            .pivots
            .iter()
            .map(|p| metric(pattern, &p.pattern))
            .collect();
        let nearest = distances.iter().copied().fold(f32::INFINITY, f32::min);

        let mut hits = BTreeSet::new();
        for (pivot, d) in self.pivots.iter().zip(&distances) {
            let slack = SLACK_REL * (d + nearest) + SLACK_ABS;
            if d - nearest <= 2.0 * radius + slack {
                hits.insert(pivot.level);
            }
        }

        let mut levels = hits.clone();
        for level in hits {
            let Ok(pos) = self.levels.binary_search(&level) else {
                continue;
            };
            if pos > 0 {
                levels.insert(self.levels[pos - 1]);
            }
            if let Some(next) = self.levels.get(pos + 1) {
                levels.insert(*next);
            }
        }

        CandidateLevels {
            fingerprint: self.fingerprint,
            levels,
        }
    }

    fn nearest(&self, pattern: &Pattern) -> (Level, f32) {
        let mut best = (self.pivots[0].level, f32::INFINITY);
        for pivot in &self.pivots {
            let d = metric(pattern, &pivot.pattern);
            if d < best.1 {
                best = (pivot.level, d);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shade(v: u8) -> Pattern {
        Pattern::uniform([v, v, v])
    }

    fn index() -> PivotIndex {
        PivotIndex::build(vec![
            Pivot::new(2, shade(255)),
            Pivot::new(0, shade(0)),
            Pivot::new(1, shade(128)),
        ])
        .unwrap()
    }

    #[test]
    fn empty_pivot_set_is_rejected() {
        assert!(matches!(
            PivotIndex::build(Vec::new()),
            Err(PivotError::EmptyPivotSet)
        ));
    }

    #[test]
    fn pivots_are_ordered_by_level() {
        let idx = index();
        let levels: Vec<Level> = idx.pivots().iter().map(|p| p.level).collect();
        assert_eq!(levels, vec![0, 1, 2]);
        assert_eq!(idx.levels(), &[0, 1, 2]);
    }

    #[test]
    fn bucket_is_nearest_pivot() {
        let idx = index();
        assert_eq!(idx.bucket_for(&shade(10)), 0);
        assert_eq!(idx.bucket_for(&shade(120)), 1);
        assert_eq!(idx.bucket_for(&shade(250)), 2);
    }

    #[test]
    fn ties_go_to_lowest_level() {
        let idx = PivotIndex::build(vec![
            Pivot::new(7, shade(40)),
            Pivot::new(3, shade(40)),
        ])
        .unwrap();
        assert_eq!(idx.bucket_for(&shade(200)), 3);
    }

    #[test]
    fn zero_radius_keeps_own_bucket_and_neighbours() {
        let idx = index();
        let got = idx.candidate_levels(&shade(5), 0.0);
        assert!(got.contains(0));
        assert!(got.contains(1));
        assert!(!got.contains(2));
        assert_eq!(got.fingerprint(), idx.fingerprint());
    }

    #[test]
    fn huge_radius_keeps_everything() {
        let idx = index();
        let got = idx.candidate_levels(&shade(5), crate::codec::max_pattern_distance());
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = index();
        let b = index();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = PivotIndex::build(vec![Pivot::new(0, shade(1))]).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
