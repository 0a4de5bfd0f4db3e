use super::{StoreStats, VectorStore};
use crate::error::VectorDbError;
use crate::types::{EmbeddedUnit, SearchHit, UnitId};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Stores at or above this size are scored on the rayon pool
const PARALLEL_THRESHOLD: usize = 2048;

/// Exact cosine-similarity index over every stored vector.
///
/// Units are kept in id order, so iteration and serialization are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatIndex {
    units: BTreeMap<UnitId, EmbeddedUnit>,
    dimension: Option<usize>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty index that only accepts vectors of `dimension` entries
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            units: BTreeMap::new(),
            dimension: Some(dimension),
        }
    }

    pub fn from_units(
        dimension: Option<usize>,
        units: impl IntoIterator<Item = EmbeddedUnit>,
    ) -> Result<Self, VectorDbError> {
        let mut index = Self {
            units: BTreeMap::new(),
            dimension,
        };
        for unit in units {
            index.insert(unit)?;
        }
        Ok(index)
    }

    /// Units in id order
    pub fn iter(&self) -> impl Iterator<Item = &EmbeddedUnit> {
        self.units.values()
    }

    fn validate(&self, id: &UnitId, vector: &[f32]) -> Result<(), VectorDbError> {
        if let Some(expected) = self.dimension
            && vector.len() != expected
        {
            return Err(VectorDbError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(VectorDbError::NonFinite(id.to_string()));
        }
        if norm(vector) == 0.0 {
            return Err(VectorDbError::ZeroVector(id.to_string()));
        }
        Ok(())
    }
}

fn norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, vector: &[f32]) -> f32 {
    let dot: f32 = query.iter().zip(vector).map(|(a, b)| a * b).sum();
    let denom = query_norm * norm(vector);
    if denom == 0.0 { 0.0 } else { dot / denom }
}

impl VectorStore for FlatIndex {
    fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    fn insert(&mut self, unit: EmbeddedUnit) -> Result<Option<EmbeddedUnit>, VectorDbError> {
        self.validate(unit.id(), &unit.vector)?;
        if self.dimension.is_none() {
            self.dimension = Some(unit.vector.len());
        }
        Ok(self.units.insert(unit.id().clone(), unit))
    }

    fn remove(&mut self, id: &UnitId) -> Option<EmbeddedUnit> {
        self.units.remove(id)
    }

    fn get(&self, id: &UnitId) -> Option<&EmbeddedUnit> {
        self.units.get(id)
    }

    fn len(&self) -> usize {
        self.units.len()
    }

    fn ids(&self) -> Vec<UnitId> {
        self.units.keys().cloned().collect()
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchHit>, VectorDbError> {
        if k == 0 || self.units.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dimension
            && vector.len() != expected
        {
            return Err(VectorDbError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        let query_norm = norm(vector);
        if query_norm == 0.0 || !query_norm.is_finite() {
            return Err(VectorDbError::ZeroVector("query".to_string()));
        }

        let mut scored: Vec<(f32, &EmbeddedUnit)> = if self.units.len() >= PARALLEL_THRESHOLD {
            self.units
                .par_iter()
                .map(|(_, unit)| (cosine(vector, query_norm, &unit.vector), unit))
                .collect()
        } else {
            self.units
                .values()
                .map(|unit| (cosine(vector, query_norm, &unit.vector), unit))
                .collect()
        };

        scored.sort_by(|(sa, ua), (sb, ub)| sb.total_cmp(sa).then_with(|| ua.id().cmp(ub.id())));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, unit)| SearchHit {
                unit: unit.unit.clone(),
                score,
            })
            .collect())
    }

    fn units_for_path(&self, path: &str) -> Vec<&EmbeddedUnit> {
        let mut units: Vec<&EmbeddedUnit> = self
            .units
            .values()
            .filter(|u| u.unit.source_path == path)
            .collect();
        units.sort_by_key(|u| u.unit.span.start_byte);
        units
    }

    fn stats(&self) -> StoreStats {
        let files: BTreeSet<&str> = self
            .units
            .values()
            .map(|u| u.unit.source_path.as_str())
            .collect();
        StoreStats {
            units: self.units.len(),
            files: files.len(),
            dimension: self.dimension,
        }
    }
}
