//! Catalogue façade.
//!
//! A catalogue directory holds the `PATTERNS` log and, once built, the
//! `PIVOTS` file. [`Catalog`] opens both and exposes the operations the
//! surrounding service needs: adding artworks, fetching patterns and
//! previews, and finding similar artworks.

mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::codec::{encode_bytes, preview_data_url, preview_jpeg, CodecError, Pattern};
use crate::pivot::{load_pivots, save_pivots, select_pivots, PivotError, PivotIndex};
use crate::search::{
    MatchResult, Query, Reference, SearchControl, SearchError, SearchOptions, SearchReport,
    SimilarityEngine,
};
use crate::store::{ArtworkId, PatternStore, StoreError, StoreOptions};

pub use registry::{ArtworkRegistry, MemoryRegistry, NewArtwork};

#[derive(Debug, Clone, Default)]
pub struct CatalogOptions {
    pub store: StoreOptions,
    pub search: SearchOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Pivot(#[from] PivotError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("artwork registry: {0:#}")]
    Registry(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PivotPreview {
    pub level: i32,
    pub preview: String,
}

#[derive(Debug)]
pub struct Catalog {
    dir: Option<PathBuf>,
    engine: SimilarityEngine,
}

impl Catalog {
    /// Opens the catalogue in `dir`. A missing or unreadable pivot set leaves
    /// the catalogue in linear-scan mode.
    pub fn open(dir: &Path, options: CatalogOptions) -> Result<Self, CatalogError> {
        let store = PatternStore::open(dir, options.store)?;
        let engine = SimilarityEngine::new(Arc::new(store), options.search);
        match load_pivots(dir) {
            Ok(Some(index)) => engine.install_pivots(Some(Arc::new(index))),
            Ok(None) => tracing::debug!(dir = %dir.display(), "no pivot set; using linear scan"),
            Err(e) => tracing::warn!(
                dir = %dir.display(),
                error = %e,
                "pivot set unreadable; using linear scan"
            ),
        }
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            engine,
        })
    }

    pub fn in_memory(options: CatalogOptions) -> Self {
        let store = PatternStore::in_memory(options.store);
        Self {
            dir: None,
            engine: SimilarityEngine::new(Arc::new(store), options.search),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn engine(&self) -> &SimilarityEngine {
        &self.engine
    }

    pub fn store(&self) -> &PatternStore {
        self.engine.store()
    }

    /// Creates the artwork entity and stores its pattern as one unit.
    ///
    /// The image is encoded before the registry is touched, and the entity is
    /// discarded again when the pattern cannot be stored.
    pub fn add_artwork(
        &self,
        registry: &dyn ArtworkRegistry,
        artwork: &NewArtwork,
        image: &[u8],
    ) -> Result<ArtworkId, CatalogError> {
        let pattern = encode_bytes(image)?;
        let artwork_id = registry
            .create_artwork(artwork)
            .map_err(CatalogError::Registry)?;

        if let Err(e) = self.engine.insert(artwork_id, &pattern) {
            if let Err(discard) = registry.discard_artwork(artwork_id) {
                tracing::warn!(
                    artwork_id,
                    error = %discard,
                    "could not discard artwork after failed pattern insert"
                );
            }
            return Err(e.into());
        }
        tracing::debug!(artwork_id, title = %artwork.title, "artwork added");
        Ok(artwork_id)
    }

    /// Stores the pattern of raw image bytes for an existing artwork.
    pub fn put_image(&self, artwork_id: ArtworkId, image: &[u8]) -> Result<Pattern, CatalogError> {
        let pattern = encode_bytes(image)?;
        self.engine.insert(artwork_id, &pattern)?;
        Ok(pattern)
    }

    pub fn put_pattern(&self, artwork_id: ArtworkId, pattern: &Pattern) -> Result<(), CatalogError> {
        self.engine.insert(artwork_id, pattern)?;
        Ok(())
    }

    pub fn pattern(&self, artwork_id: ArtworkId) -> Result<Pattern, CatalogError> {
        Ok(self.store().get(artwork_id)?)
    }

    /// JPEG preview of a stored pattern.
    pub fn preview(&self, artwork_id: ArtworkId) -> Result<Vec<u8>, CatalogError> {
        Ok(preview_jpeg(&self.pattern(artwork_id)?)?)
    }

    pub fn similar_to_artwork(
        &self,
        artwork_id: ArtworkId,
        radius: f32,
        limit: usize,
    ) -> Result<Vec<MatchResult>, CatalogError> {
        let query = Query {
            reference: Reference::Artwork(artwork_id),
            radius,
            limit,
        };
        Ok(self.search(&query, &SearchControl::default())?.matches)
    }

    pub fn similar_to_image(
        &self,
        image: &[u8],
        radius: f32,
        limit: usize,
    ) -> Result<Vec<MatchResult>, CatalogError> {
        let query = Query {
            reference: Reference::Image(image.to_vec()),
            radius,
            limit,
        };
        Ok(self.search(&query, &SearchControl::default())?.matches)
    }

    pub fn search(&self, query: &Query, control: &SearchControl) -> Result<SearchReport, CatalogError> {
        Ok(self.engine.execute(query, control)?)
    }

    /// Selects `count` pivots from the stored patterns, persists them (in
    /// directory mode) and installs them.
    pub fn build_pivots(&self, count: usize) -> Result<Arc<PivotIndex>, CatalogError> {
        let candidates: Vec<(ArtworkId, Pattern)> = self
            .store()
            .records()
            .into_iter()
            .map(|r| (r.artwork_id, r.pattern))
            .collect();
        let index = PivotIndex::build(select_pivots(&candidates, count))?;
        if let Some(dir) = &self.dir {
            save_pivots(dir, &index)?;
        }
        let index = Arc::new(index);
        self.engine.install_pivots(Some(index.clone()));
        Ok(index)
    }

    /// Level and preview data URL of every installed pivot.
    pub fn pivot_previews(&self) -> Result<Vec<PivotPreview>, CatalogError> {
        let Some(index) = self.engine.pivots() else {
            return Ok(Vec::new());
        };
        index
            .pivots()
            .iter()
            .map(|pivot| -> Result<PivotPreview, CatalogError> {
                Ok(PivotPreview {
                    level: pivot.level,
                    preview: preview_data_url(&pivot.pattern)?,
                })
            })
            .collect()
    }
}
