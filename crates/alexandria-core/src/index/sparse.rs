//! Sparse Index
//!
//! Learned sparse vectors (term-id → weight) keyed by resource id, scored by
//! dot product against an identically encoded query. Each document carries
//! the model version that produced it; documents encoded by a different
//! version than the query are skipped and counted, so the engine can emit a
//! mismatch warning and collapse to two-way retrieval when the index has
//! nothing compatible.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::kernel::gateway::SparseVector;

struct SparseEntry {
    vector: SparseVector,
    model: String,
}

/// Result of a sparse search: ranked hits plus the number of documents that
/// were skipped for carrying a different model version.
#[derive(Debug, Clone)]
pub struct SparseSearchOutcome {
    /// (resource id, dot product), best first
    pub results: Vec<(String, f32)>,
    /// Documents skipped due to model version mismatch
    pub version_mismatches: usize,
}

/// The sparse vector index.
pub struct SparseIndex {
    entries: RwLock<HashMap<String, SparseEntry>>,
}

impl Default for SparseIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of indexed documents.
    pub fn len(&self) -> usize {
        self.entries.read().expect("sparse index lock poisoned").len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-load documents (index warm-up from the store).
    pub fn warm(&self, entries: Vec<(String, SparseVector, String)>) {
        let mut map = self.entries.write().expect("sparse index lock poisoned");
        for (id, vector, model) in entries {
            map.insert(id, SparseEntry { vector, model });
        }
    }

    /// Insert or replace a document vector with its model version.
    pub fn upsert(&self, id: &str, vector: SparseVector, model: &str) {
        self.entries
            .write()
            .expect("sparse index lock poisoned")
            .insert(
                id.to_string(),
                SparseEntry {
                    vector,
                    model: model.to_string(),
                },
            );
    }

    /// Remove a document. Idempotent.
    pub fn remove(&self, id: &str) {
        self.entries
            .write()
            .expect("sparse index lock poisoned")
            .remove(id);
    }

    /// Whether any document was encoded by the given model version.
    pub fn has_model(&self, model: &str) -> bool {
        self.entries
            .read()
            .expect("sparse index lock poisoned")
            .values()
            .any(|entry| entry.model == model)
    }

    /// Dot-product search restricted to documents sharing the query's model
    /// version. Zero-score documents are dropped; ties break by id ascending.
    pub fn search(&self, query: &SparseVector, query_model: &str, limit: usize) -> SparseSearchOutcome {
        let entries = self.entries.read().expect("sparse index lock poisoned");

        let mut version_mismatches = 0usize;
        let mut scored: Vec<(String, f32)> = Vec::new();
        for (id, entry) in entries.iter() {
            if entry.model != query_model {
                version_mismatches += 1;
                continue;
            }
            let score = query.dot(&entry.vector);
            if score > 0.0 {
                scored.push((id.clone(), score));
            }
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(limit);

        SparseSearchOutcome {
            results: scored,
            version_mismatches,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::gateway::{SparseEncoder, TermWeightEncoder};
    use crate::kernel::Deadline;

    fn encode(text: &str) -> SparseVector {
        TermWeightEncoder::new()
            .encode(text, Deadline::from_millis(100))
            .unwrap()
    }

    #[test]
    fn test_search_ranks_by_dot_product() {
        let index = SparseIndex::new();
        index.upsert("strong", encode("rust rust rust memory"), "term-weight/v1");
        index.upsert("weak", encode("rust gardening"), "term-weight/v1");
        index.upsert("none", encode("pottery"), "term-weight/v1");

        let outcome = index.search(&encode("rust"), "term-weight/v1", 10);
        assert_eq!(outcome.version_mismatches, 0);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].0, "strong");
        assert!(outcome.results[0].1 > outcome.results[1].1);
    }

    #[test]
    fn test_version_mismatch_skipped_and_counted() {
        let index = SparseIndex::new();
        index.upsert("old", encode("rust"), "term-weight/v0");
        index.upsert("new", encode("rust"), "term-weight/v1");

        let outcome = index.search(&encode("rust"), "term-weight/v1", 10);
        assert_eq!(outcome.version_mismatches, 1);
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].0, "new");

        assert!(index.has_model("term-weight/v0"));
        assert!(!index.has_model("term-weight/v2"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let index = SparseIndex::new();
        index.upsert("r1", encode("rust"), "term-weight/v1");
        index.remove("r1");
        index.remove("r1");
        assert!(index.is_empty());
    }
}
