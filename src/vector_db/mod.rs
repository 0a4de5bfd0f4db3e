// Exact brute-force cosine index; repositories are small enough that an
// approximate structure would only add nondeterminism
pub mod flat_index;
pub use flat_index::FlatIndex;

// Atomic on-disk persistence of a flat index
pub mod storage;
pub use storage::{FORMAT_VERSION, IndexMeta, IndexStorage, LoadedIndex};

use crate::error::VectorDbError;
use crate::types::{EmbeddedUnit, SearchHit, UnitId};

/// Trait for vector store operations
pub trait VectorStore: Send + Sync {
    /// Dimension every stored vector has, once known
    fn dimension(&self) -> Option<usize>;

    /// Insert a unit, replacing any unit with the same id; returns the
    /// replaced unit
    fn insert(&mut self, unit: EmbeddedUnit) -> Result<Option<EmbeddedUnit>, VectorDbError>;

    /// Remove a unit; unknown ids are a no-op
    fn remove(&mut self, id: &UnitId) -> Option<EmbeddedUnit>;

    fn get(&self, id: &UnitId) -> Option<&EmbeddedUnit>;

    fn contains(&self, id: &UnitId) -> bool {
        self.get(id).is_some()
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored id, ascending
    fn ids(&self) -> Vec<UnitId>;

    /// At most `k` units by descending cosine similarity, ties broken by id
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>, VectorDbError>;

    /// Units of one source file, in file order
    fn units_for_path(&self, path: &str) -> Vec<&EmbeddedUnit>;

    fn stats(&self) -> StoreStats;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub units: usize,
    pub files: usize,
    pub dimension: Option<usize>,
}
