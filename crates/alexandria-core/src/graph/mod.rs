//! Knowledge Graph
//!
//! Derived, never authoritative: edges between resources are scored on
//! demand from the hybrid formula
//!
//! ```text
//! edge(A,B) = 0.6·cosine(dense) + 0.3·jaccard(subjects) + 0.1·[same classification]
//! ```
//!
//! (weights configurable, must sum to 1), with edges under the minimum
//! threshold (default 0.20) dropped. Neighborhood queries go through the
//! cache; the overview is bounded to 100 nodes.

mod citation;
mod pagerank;

pub use citation::{classify_url, Citation, CitationGraph, CitationType, CitationsView};
pub use pagerank::{pagerank, CONVERGENCE, DAMPING, MAX_ITERATIONS};

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::index::DenseIndex;
use crate::kernel::Kernel;
use crate::resource::{Resource, ResourceStore};
use crate::vector::dot;

/// A scored edge between two resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// One endpoint
    pub source: String,
    /// The other endpoint
    pub target: String,
    /// Combined edge score
    pub score: f64,
    /// Dense cosine component (unweighted)
    pub vector_similarity: f64,
    /// Subject Jaccard component (unweighted)
    pub subject_overlap: f64,
    /// Same-classification indicator
    pub same_classification: bool,
}

/// A neighbor of a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    /// Neighboring resource
    pub resource_id: String,
    /// Its title
    pub title: String,
    /// The connecting edge
    pub edge: GraphEdge,
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let set_a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let set_b: HashSet<&str> = b.iter().map(String::as_str).collect();
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// The knowledge-graph service.
pub struct KnowledgeGraph {
    kernel: Arc<Kernel>,
    resources: Arc<ResourceStore>,
    dense: Arc<DenseIndex>,
}

impl KnowledgeGraph {
    /// Wire the service.
    pub fn new(kernel: Arc<Kernel>, resources: Arc<ResourceStore>, dense: Arc<DenseIndex>) -> Self {
        Self {
            kernel,
            resources,
            dense,
        }
    }

    fn score_edge(
        &self,
        a: &Resource,
        a_vec: &[f32],
        b: &Resource,
        b_vec: &[f32],
    ) -> GraphEdge {
        let weights = self.kernel.settings.graph_weights;
        // Stored vectors are unit-norm, so the dot product is the cosine
        let vector_similarity = f64::from(dot(a_vec, b_vec)).clamp(-1.0, 1.0);
        let subject_overlap = jaccard(&a.subjects, &b.subjects);
        let same_classification = match (&a.classification_code, &b.classification_code) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => false,
        };

        let score = weights.vector * vector_similarity.max(0.0)
            + weights.tags * subject_overlap
            + weights.classification * if same_classification { 1.0 } else { 0.0 };

        GraphEdge {
            source: a.id.clone(),
            target: b.id.clone(),
            score,
            vector_similarity,
            subject_overlap,
            same_classification,
        }
    }

    /// Top-`limit` neighbors by edge score. Ties break by descending vector
    /// similarity, then id ascending. Served from the cache when warm.
    pub fn neighbors(&self, resource_id: &str, limit: usize) -> Result<Vec<Neighbor>> {
        let cache_key = format!("graph:{resource_id}:neighbors");
        if let Some(cached) = self.kernel.cache.get::<Vec<Neighbor>>(&cache_key) {
            return Ok(cached.into_iter().take(limit).collect());
        }

        let center = self.resources.get(resource_id)?;
        let center_vec = self.dense.get(resource_id).ok_or_else(|| {
            CoreError::NotFound(format!("resource {resource_id} has no dense vector"))
        })?;

        let min_score = self.kernel.settings.graph_min_edge_score;
        let candidate_ids = self.dense.ids();
        let others = self.resources.get_many(&candidate_ids)?;

        let mut neighbors: Vec<Neighbor> = Vec::new();
        for other in &others {
            if other.id == resource_id {
                continue;
            }
            let Some(other_vec) = self.dense.get(&other.id) else {
                continue;
            };
            let edge = self.score_edge(&center, &center_vec, other, &other_vec);
            if edge.score >= min_score {
                neighbors.push(Neighbor {
                    resource_id: other.id.clone(),
                    title: other.title.clone(),
                    edge,
                });
            }
        }

        neighbors.sort_by(|a, b| {
            b.edge
                .score
                .partial_cmp(&a.edge.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.edge
                        .vector_similarity
                        .partial_cmp(&a.edge.vector_similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        // Cache a generous head so nearby limits share the entry
        neighbors.truncate(limit.max(50));
        self.kernel.cache.put(&cache_key, &neighbors);

        neighbors.truncate(limit);
        Ok(neighbors)
    }

    /// Drop the cached neighborhood for a node (membership or vector
    /// changed).
    pub fn invalidate_neighbors(&self, resource_id: &str) {
        self.kernel
            .cache
            .invalidate_pattern(&format!("graph:{resource_id}:*"));
    }

    /// Global overview: the top-`limit` edges whose vector component clears
    /// the threshold. The node set is capped at 100 and edges come from
    /// each node's nearest neighbors (depth 1 from every included node,
    /// i.e. subgraph diameter ≤ 2 hops around any edge).
    pub fn overview(&self, limit: usize, vector_threshold: f64) -> Result<Vec<GraphEdge>> {
        const MAX_NODES: usize = 100;
        const PER_NODE_CANDIDATES: usize = 10;

        let min_score = self.kernel.settings.graph_min_edge_score;
        let node_ids: Vec<String> = self.dense.ids().into_iter().take(MAX_NODES).collect();
        let resources = self.resources.get_many(&node_ids)?;
        let included: HashSet<&str> = resources.iter().map(|r| r.id.as_str()).collect();

        let mut seen_pairs: HashSet<(String, String)> = HashSet::new();
        let mut edges: Vec<GraphEdge> = Vec::new();

        for resource in &resources {
            let Some(vector) = self.dense.get(&resource.id) else {
                continue;
            };
            for (other_id, _) in self.dense.search(&vector, PER_NODE_CANDIDATES + 1)? {
                if other_id == resource.id || !included.contains(other_id.as_str()) {
                    continue;
                }
                let pair = if resource.id < other_id {
                    (resource.id.clone(), other_id.clone())
                } else {
                    (other_id.clone(), resource.id.clone())
                };
                if !seen_pairs.insert(pair) {
                    continue;
                }
                let Some(other) = resources.iter().find(|r| r.id == other_id) else {
                    continue;
                };
                let Some(other_vec) = self.dense.get(&other_id) else {
                    continue;
                };
                let edge = self.score_edge(resource, &vector, other, &other_vec);
                if edge.vector_similarity >= vector_threshold && edge.score >= min_score {
                    edges.push(edge);
                }
            }
        }

        edges.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.source.as_str(), a.target.as_str()).cmp(&(b.source.as_str(), b.target.as_str())))
        });
        edges.truncate(limit);
        Ok(edges)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jaccard() {
        let a = vec!["ml".to_string(), "ai".to_string()];
        let b = vec!["ml".to_string(), "stats".to_string()];
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&a, &[]), 0.0);
        assert_eq!(jaccard(&[], &[]), 0.0);
    }
}
