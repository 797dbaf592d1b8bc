//! Dense Index
//!
//! In-memory store of unit-norm vectors keyed by resource id. The baseline
//! search is an exact cosine scan — for unit vectors a dot product — which
//! holds the recall contract up to ~100k resources. With the
//! `vector-search` feature an HNSW accelerator (USearch) answers queries
//! once the corpus grows past the exact-scan comfort zone.
//!
//! Deleted ids never come back from `search`: removal is synchronous with
//! the resource-deleted event, and the map is the source of truth for
//! membership even when the accelerator answers.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{CoreError, Result};
use crate::vector::dot;

#[cfg(feature = "vector-search")]
use std::sync::Mutex;

/// Corpus size at which the HNSW accelerator takes over from the exact scan.
#[cfg(feature = "vector-search")]
const HNSW_CUTOVER: usize = 10_000;

#[cfg(feature = "vector-search")]
struct HnswState {
    index: usearch::Index,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

#[cfg(feature = "vector-search")]
impl HnswState {
    fn new(dimensions: usize) -> Result<Self> {
        let options = usearch::IndexOptions {
            dimensions,
            metric: usearch::MetricKind::Cos,
            quantization: usearch::ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = usearch::Index::new(&options)
            .map_err(|e| CoreError::Internal(format!("hnsw index creation: {e}")))?;
        Ok(Self {
            index,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    fn upsert(&mut self, key: &str, vector: &[f32]) -> Result<()> {
        if let Some(&id) = self.key_to_id.get(key) {
            self.index
                .remove(id)
                .map_err(|e| CoreError::Internal(format!("hnsw remove: {e}")))?;
            self.index
                .reserve(self.index.size() + 1)
                .map_err(|e| CoreError::Internal(format!("hnsw reserve: {e}")))?;
            self.index
                .add(id, vector)
                .map_err(|e| CoreError::Internal(format!("hnsw add: {e}")))?;
            return Ok(());
        }

        if self.index.size() >= self.index.capacity() {
            let capacity = (self.index.capacity() * 2).max(16);
            self.index
                .reserve(capacity)
                .map_err(|e| CoreError::Internal(format!("hnsw reserve: {e}")))?;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, vector)
            .map_err(|e| CoreError::Internal(format!("hnsw add: {e}")))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) {
        if let Some(id) = self.key_to_id.remove(key) {
            self.id_to_key.remove(&id);
            let _ = self.index.remove(id);
        }
    }

    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        let matches = self
            .index
            .search(query, limit)
            .map_err(|e| CoreError::Internal(format!("hnsw search: {e}")))?;
        let mut results = Vec::with_capacity(matches.keys.len());
        for (id, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(key) = self.id_to_key.get(id) {
                results.push((key.clone(), 1.0 - distance));
            }
        }
        Ok(results)
    }
}

/// The dense vector index.
pub struct DenseIndex {
    dimensions: usize,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    #[cfg(feature = "vector-search")]
    hnsw: Mutex<Option<HnswState>>,
}

impl DenseIndex {
    /// Create an empty index for vectors of `dimensions`.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: RwLock::new(HashMap::new()),
            #[cfg(feature = "vector-search")]
            hnsw: Mutex::new(None),
        }
    }

    /// Expected dimensionality.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.vectors.read().expect("dense index lock poisoned").len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-load vectors (index warm-up from the store). Entries with the
    /// wrong dimensionality are skipped with a warning.
    pub fn warm(&self, entries: Vec<(String, Vec<f32>)>) {
        for (id, vector) in entries {
            if let Err(e) = self.upsert(&id, vector) {
                tracing::warn!(resource_id = %id, error = %e, "skipping vector during warm-up");
            }
        }
    }

    /// Insert or replace a vector.
    pub fn upsert(&self, id: &str, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dimensions {
            return Err(CoreError::Validation(format!(
                "dense vector for {id}: expected {} dimensions, got {}",
                self.dimensions,
                vector.len()
            )));
        }

        #[cfg(feature = "vector-search")]
        {
            let mut hnsw = self.hnsw.lock().expect("hnsw lock poisoned");
            if let Some(state) = hnsw.as_mut() {
                state.upsert(id, &vector)?;
            }
        }

        self.vectors
            .write()
            .expect("dense index lock poisoned")
            .insert(id.to_string(), vector);
        Ok(())
    }

    /// Remove a vector. Idempotent.
    pub fn remove(&self, id: &str) {
        #[cfg(feature = "vector-search")]
        {
            let mut hnsw = self.hnsw.lock().expect("hnsw lock poisoned");
            if let Some(state) = hnsw.as_mut() {
                state.remove(id);
            }
        }

        self.vectors
            .write()
            .expect("dense index lock poisoned")
            .remove(id);
    }

    /// kNN by cosine similarity, best first; ties break by id ascending so
    /// results are deterministic.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(String, f32)>> {
        if query.len() != self.dimensions {
            return Err(CoreError::Validation(format!(
                "query vector: expected {} dimensions, got {}",
                self.dimensions,
                query.len()
            )));
        }

        #[cfg(feature = "vector-search")]
        if self.len() >= HNSW_CUTOVER {
            self.ensure_hnsw()?;
            let hnsw = self.hnsw.lock().expect("hnsw lock poisoned");
            if let Some(state) = hnsw.as_ref() {
                let vectors = self.vectors.read().expect("dense index lock poisoned");
                // The map stays authoritative for membership
                let results = state
                    .search(query, limit)?
                    .into_iter()
                    .filter(|(id, _)| vectors.contains_key(id))
                    .collect();
                return Ok(results);
            }
        }

        let vectors = self.vectors.read().expect("dense index lock poisoned");
        let mut scored: Vec<(String, f32)> = vectors
            .iter()
            .map(|(id, vector)| (id.clone(), dot(query, vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// All indexed ids, sorted for determinism.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .vectors
            .read()
            .expect("dense index lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Fetch a stored vector.
    pub fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.vectors
            .read()
            .expect("dense index lock poisoned")
            .get(id)
            .cloned()
    }

    /// Build the HNSW accelerator from the current map if absent.
    #[cfg(feature = "vector-search")]
    fn ensure_hnsw(&self) -> Result<()> {
        let mut hnsw = self.hnsw.lock().expect("hnsw lock poisoned");
        if hnsw.is_some() {
            return Ok(());
        }
        let mut state = HnswState::new(self.dimensions)?;
        let vectors = self.vectors.read().expect("dense index lock poisoned");
        state
            .index
            .reserve(vectors.len().max(16))
            .map_err(|e| CoreError::Internal(format!("hnsw reserve: {e}")))?;
        for (id, vector) in vectors.iter() {
            state.upsert(id, vector)?;
        }
        *hnsw = Some(state);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::l2_normalize;

    fn unit(seed: u64, dims: usize) -> Vec<f32> {
        let v: Vec<f32> = (0..dims)
            .map(|i| (((i as u64 + 1) * (seed + 3)) % 97) as f32 / 97.0 - 0.5)
            .collect();
        l2_normalize(v)
    }

    #[test]
    fn test_upsert_search_orders_by_similarity() {
        let index = DenseIndex::new(8);
        let target = unit(1, 8);
        index.upsert("near", target.clone()).unwrap();
        index.upsert("far", unit(40, 8)).unwrap();

        let results = index.search(&target, 2).unwrap();
        assert_eq!(results[0].0, "near");
        assert!((results[0].1 - 1.0).abs() < 1e-5);
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn test_removed_ids_never_returned() {
        let index = DenseIndex::new(8);
        let v = unit(1, 8);
        index.upsert("gone", v.clone()).unwrap();
        index.upsert("kept", unit(2, 8)).unwrap();
        index.remove("gone");

        let results = index.search(&v, 10).unwrap();
        assert!(results.iter().all(|(id, _)| id != "gone"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = DenseIndex::new(8);
        assert!(index.upsert("r1", vec![1.0; 4]).is_err());
        assert!(index.search(&[1.0; 4], 5).is_err());
    }

    #[test]
    fn test_deterministic_tie_break() {
        let index = DenseIndex::new(4);
        let v = l2_normalize(vec![1.0, 0.0, 0.0, 0.0]);
        index.upsert("b", v.clone()).unwrap();
        index.upsert("a", v.clone()).unwrap();

        let results = index.search(&v, 2).unwrap();
        assert_eq!(results[0].0, "a");
        assert_eq!(results[1].0, "b");
    }

    #[test]
    fn test_warm_loads_bulk() {
        let index = DenseIndex::new(8);
        index.warm(vec![
            ("r1".to_string(), unit(1, 8)),
            ("r2".to_string(), unit(2, 8)),
            ("bad".to_string(), vec![1.0; 3]),
        ]);
        assert_eq!(index.len(), 2);
    }
}
