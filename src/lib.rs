//! `patterndb` finds artworks that look alike.
//!
//! Every image is reduced to a small grid of CIE L*a*b* colours (a
//! *pattern*). Patterns are kept in an append-only store, optionally
//! partitioned by a set of pivot patterns, and queried with a radius + limit
//! range search:
//! - `codec`: image → pattern, pattern → preview, the pattern metric.
//! - `pivot`: pivot selection, level bucketing and sound level pruning.
//! - `store`: durable one-record-per-artwork store with snapshot scans.
//! - `search`: ranked range search over a store snapshot.
//! - `catalog`: a catalogue directory with store, pivots and engine wired up.

pub mod catalog;
pub mod codec;
pub mod pivot;
pub mod search;
pub mod store;

pub use catalog::{ArtworkRegistry, Catalog, CatalogError, CatalogOptions, MemoryRegistry, NewArtwork};
pub use codec::{encode, encode_bytes, metric, normalize, CodecError, Pattern};
pub use pivot::{CandidateLevels, Level, Pivot, PivotError, PivotIndex};
pub use search::{
    CancelToken, MatchResult, Query, Reference, SearchControl, SearchError, SearchOptions,
    SearchReport, SimilarityEngine,
};
pub use store::{ArtworkId, PatternStore, StoreError, StoreOptions};
