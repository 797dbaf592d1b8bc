//! Reciprocal Rank Fusion
//!
//! Combines up to three ranked lists without score calibration:
//!
//! ```text
//! score(id) = Σ_m  w_m · 1 / (k + rank_m(id))
//! ```
//!
//! with k = 60. A missing id in a list reads as rank ∞ and contributes
//! nothing. Rank-based fusion rewards ids surfaced by several methods while
//! staying robust to each method's score scale.

use std::collections::HashMap;

use serde::Serialize;

use super::query::{FusionWeights, RetrievalMethod};

/// The RRF dampening constant.
pub const RRF_K: f64 = 60.0;

/// A fused candidate with its per-method contributions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedCandidate {
    /// Resource id
    pub id: String,
    /// Fused score
    pub score: f64,
    /// Score contribution per method (lexical, dense, sparse)
    pub contributions: [f64; 3],
    /// Raw method score where the method returned this id
    pub method_scores: [Option<f32>; 3],
}

/// Fuse ranked per-method lists with weighted RRF. Output is deduplicated
/// and sorted by fused score descending, ties broken by id ascending for
/// determinism.
pub fn weighted_rrf(
    lists: &[(RetrievalMethod, Vec<(String, f32)>)],
    weights: &FusionWeights,
) -> Vec<FusedCandidate> {
    let mut fused: HashMap<String, FusedCandidate> = HashMap::new();

    for (method, results) in lists {
        let weight = weights.get(*method);
        if weight <= 0.0 {
            continue;
        }
        for (rank, (id, raw_score)) in results.iter().enumerate() {
            let contribution = weight / (RRF_K + rank as f64 + 1.0);
            let entry = fused.entry(id.clone()).or_insert_with(|| FusedCandidate {
                id: id.clone(),
                score: 0.0,
                contributions: [0.0; 3],
                method_scores: [None; 3],
            });
            entry.score += contribution;
            entry.contributions[method.idx()] += contribution;
            entry.method_scores[method.idx()] = Some(*raw_score);
        }
    }

    let mut candidates: Vec<FusedCandidate> = fused.into_values().collect();
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}

/// Aggregate share of the fused mass contributed by each method over a
/// candidate set. Sums to 1 when any candidate exists.
pub fn method_contributions(candidates: &[FusedCandidate]) -> [f64; 3] {
    let mut totals = [0.0f64; 3];
    for candidate in candidates {
        for (slot, contribution) in totals.iter_mut().zip(candidate.contributions.iter()) {
            *slot += contribution;
        }
    }
    let sum: f64 = totals.iter().sum();
    if sum > f64::EPSILON {
        for slot in &mut totals {
            *slot /= sum;
        }
    }
    totals
}

// ============================================================================
// TESTS
// ============================================================================
