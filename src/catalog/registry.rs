use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::ArtworkId;

/// Fields needed to create an artwork entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArtwork {
    pub title: String,
    pub artist_id: u64,
    pub filepath: String,
}

/// The system that owns artwork entities. The catalogue only creates them and,
/// when storing the pattern fails, discards them again.
pub trait ArtworkRegistry: Send + Sync {
    fn create_artwork(&self, artwork: &NewArtwork) -> anyhow::Result<ArtworkId>;

    fn discard_artwork(&self, artwork_id: ArtworkId) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: ArtworkId,
    artworks: BTreeMap<ArtworkId, NewArtwork>,
}

/// Registry that keeps artworks in memory and numbers them from 1.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, artwork_id: ArtworkId) -> Option<NewArtwork> {
        self.state.lock().artworks.get(&artwork_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().artworks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtworkRegistry for MemoryRegistry {
    fn create_artwork(&self, artwork: &NewArtwork) -> anyhow::Result<ArtworkId> {
        if artwork.title.trim().is_empty() {
            anyhow::bail!("artwork title must not be empty");
        }
        let mut state = self.state.lock();
        state.next_id += 1;
        let artwork_id = state.next_id;
        state.artworks.insert(artwork_id, artwork.clone());
        Ok(artwork_id)
    }

    fn discard_artwork(&self, artwork_id: ArtworkId) -> anyhow::Result<()> {
        match self.state.lock().artworks.remove(&artwork_id) {
            Some(_) => Ok(()),
            None => anyhow::bail!("artwork {artwork_id} does not exist"),
        }
    }
}
