//! Engine Configuration
//!
//! Every tunable named in the deployment contract lives here, with the
//! documented default. `Settings::validate()` is called once at engine
//! construction; invalid combinations never reach the modules.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Per-kind TTLs for the keyed cache, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheTtls {
    /// `embedding:*` entries
    pub embedding: u64,
    /// `quality:*` entries
    pub quality: u64,
    /// `search_query:*` entries
    pub search_query: u64,
    /// `resource:*` entries
    pub resource: u64,
    /// `graph:*:neighbors` entries
    pub graph_neighbors: u64,
    /// `user:*:profile` entries
    pub user_profile: u64,
    /// `classification:*` entries
    pub classification: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            embedding: 3600,
            quality: 1800,
            search_query: 300,
            resource: 600,
            graph_neighbors: 1800,
            user_profile: 600,
            classification: 3600,
        }
    }
}

impl CacheTtls {
    /// TTL for a cache key, chosen by its `<kind>` prefix.
    pub fn for_key(&self, key: &str) -> u64 {
        let kind = key.split(':').next().unwrap_or("");
        match kind {
            "embedding" => self.embedding,
            "quality" => self.quality,
            "search_query" => self.search_query,
            "resource" => self.resource,
            "graph" => self.graph_neighbors,
            "user" => self.user_profile,
            "classification" => self.classification,
            _ => self.resource,
        }
    }
}

/// Knowledge-graph edge formula weights. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphWeights {
    /// Dense-vector cosine component
    pub vector: f64,
    /// Subject Jaccard component
    pub tags: f64,
    /// Same-classification indicator component
    pub classification: f64,
}

impl Default for GraphWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            tags: 0.3,
            classification: 0.1,
        }
    }
}

/// Engine settings with the deployment-contract defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Store location; `None` resolves to the platform data directory.
    pub database_path: Option<PathBuf>,
    /// Model version tag stamped on new dense embeddings.
    pub embedding_model_name: String,
    /// Dense embedding dimensionality; completed resources carry a unit-norm
    /// vector of exactly this size.
    pub embedding_dimensions: usize,
    /// Seeds two-way lexical/dense weighting when sparse is unavailable.
    pub default_hybrid_weight: f64,
    /// Edge formula weights; validated to sum to 1 ± 1e-6.
    pub graph_weights: GraphWeights,
    /// Edges scoring below this are dropped.
    pub graph_min_edge_score: f64,
    /// Overview filter floor on the vector component.
    pub graph_vector_min_sim_threshold: f64,
    /// Cap on cached embedding entries.
    pub embedding_cache_size: usize,
    /// Total cache capacity (entries) across kinds.
    pub cache_capacity: usize,
    /// Per-kind cache TTLs, seconds. None may be negative (enforced by type).
    pub cache_ttls: CacheTtls,
    /// Background worker threads. Minimum 4 in production profiles.
    pub worker_count: usize,
    /// Hard budget for the parallel retrieval phase, milliseconds.
    pub retrieval_budget_ms: u64,
    /// Hard budget for the rerank phase, milliseconds.
    pub rerank_budget_ms: u64,
    /// Manual examples required before a retrain task launches.
    pub retrain_threshold: usize,
    /// Max delivery attempts before a task dead-letters.
    pub task_max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: None,
            embedding_model_name: "hash-embedder/256".to_string(),
            embedding_dimensions: 256,
            default_hybrid_weight: 0.5,
            graph_weights: GraphWeights::default(),
            graph_min_edge_score: 0.20,
            graph_vector_min_sim_threshold: 0.85,
            embedding_cache_size: 1000,
            cache_capacity: 10_000,
            cache_ttls: CacheTtls::default(),
            worker_count: 4,
            retrieval_budget_ms: 500,
            rerank_budget_ms: 1000,
            retrain_threshold: 100,
            task_max_attempts: 3,
        }
    }
}

impl Settings {
    /// Check cross-field constraints. Runs once at engine construction.
    pub fn validate(&self) -> Result<()> {
        let w = &self.graph_weights;
        let sum = w.vector + w.tags + w.classification;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(CoreError::Validation(format!(
                "graph weights must sum to 1.0, got {sum}"
            )));
        }
        if !(0.0..=1.0).contains(&self.default_hybrid_weight) {
            return Err(CoreError::Validation(
                "default_hybrid_weight must be in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.graph_vector_min_sim_threshold) {
            return Err(CoreError::Validation(
                "graph_vector_min_sim_threshold must be in [0, 1]".to_string(),
            ));
        }
        if self.embedding_dimensions == 0 {
            return Err(CoreError::Validation(
                "embedding_dimensions must be positive".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(CoreError::Validation(
                "worker_count must be positive".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(CoreError::Validation(
                "cache_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_graph_weights_must_sum_to_one() {
        let mut settings = Settings::default();
        settings.graph_weights.vector = 0.9;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_ttl_lookup_by_kind() {
        let ttls = CacheTtls::default();
        assert_eq!(ttls.for_key("embedding:abc"), 3600);
        assert_eq!(ttls.for_key("search_query:xyz"), 300);
        assert_eq!(ttls.for_key("graph:abc:neighbors"), 1800);
        assert_eq!(ttls.for_key("user:u1:profile"), 600);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let settings = Settings {
            worker_count: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
