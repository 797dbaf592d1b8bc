//! Retrieval Evaluation
//!
//! Standard rank metrics over a ranked id list and graded relevance
//! judgments: nDCG@K, Recall@K, Precision@K, MRR. A judgment > 0 counts as
//! relevant for the set-based metrics; graded values feed DCG.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Evaluation metrics at a cutoff K.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalMetrics {
    /// Cutoff used
    pub k: usize,
    /// Normalized discounted cumulative gain at K
    pub ndcg: f64,
    /// Fraction of relevant items retrieved in the top K
    pub recall: f64,
    /// Fraction of the top K that is relevant
    pub precision: f64,
    /// Mean reciprocal rank of the first relevant item
    pub mrr: f64,
}

/// Evaluate a ranked list against judgments (`id → graded relevance ≥ 0`).
pub fn evaluate(ranked: &[String], judgments: &HashMap<String, f64>, k: usize) -> EvalMetrics {
    let k = k.max(1);
    let top: Vec<&String> = ranked.iter().take(k).collect();

    let relevant_total = judgments.values().filter(|&&g| g > 0.0).count();
    let retrieved_relevant = top
        .iter()
        .filter(|id| judgments.get(id.as_str()).copied().unwrap_or(0.0) > 0.0)
        .count();

    let recall = if relevant_total == 0 {
        0.0
    } else {
        retrieved_relevant as f64 / relevant_total as f64
    };
    let precision = retrieved_relevant as f64 / top.len().max(1) as f64;

    let mrr = ranked
        .iter()
        .position(|id| judgments.get(id).copied().unwrap_or(0.0) > 0.0)
        .map_or(0.0, |pos| 1.0 / (pos as f64 + 1.0));

    EvalMetrics {
        k,
        ndcg: ndcg_at_k(&top, judgments, k),
        recall,
        precision,
        mrr,
    }
}

fn dcg(gains: impl Iterator<Item = f64>) -> f64 {
    gains
        .enumerate()
        .map(|(i, gain)| gain / (i as f64 + 2.0).log2())
        .sum()
}

fn ndcg_at_k(top: &[&String], judgments: &HashMap<String, f64>, k: usize) -> f64 {
    let actual = dcg(
        top.iter()
            .map(|id| judgments.get(id.as_str()).copied().unwrap_or(0.0)),
    );

    let mut ideal_gains: Vec<f64> = judgments.values().copied().filter(|&g| g > 0.0).collect();
    ideal_gains.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let ideal = dcg(ideal_gains.into_iter().take(k));

    if ideal <= f64::EPSILON {
        0.0
    } else {
        actual / ideal
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn judgments(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(id, g)| (id.to_string(), *g)).collect()
    }

    fn ranked(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_perfect_ranking() {
        let judged = judgments(&[("a", 3.0), ("b", 2.0), ("c", 1.0)]);
        let metrics = evaluate(&ranked(&["a", "b", "c"]), &judged, 3);
        assert!((metrics.ndcg - 1.0).abs() < 1e-9);
        assert!((metrics.recall - 1.0).abs() < 1e-9);
        assert!((metrics.precision - 1.0).abs() < 1e-9);
        assert!((metrics.mrr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_relevant_item_buried() {
        let judged = judgments(&[("hit", 1.0)]);
        let metrics = evaluate(&ranked(&["x", "y", "hit", "z"]), &judged, 4);
        assert!((metrics.mrr - 1.0 / 3.0).abs() < 1e-9);
        assert!((metrics.recall - 1.0).abs() < 1e-9);
        assert!((metrics.precision - 0.25).abs() < 1e-9);
        assert!(metrics.ndcg < 1.0);
    }

    #[test]
    fn test_no_relevant_retrieved() {
        let judged = judgments(&[("hit", 1.0)]);
        let metrics = evaluate(&ranked(&["x", "y"]), &judged, 2);
        assert_eq!(metrics.recall, 0.0);
        assert_eq!(metrics.precision, 0.0);
        assert_eq!(metrics.mrr, 0.0);
        assert_eq!(metrics.ndcg, 0.0);
    }

    #[test]
    fn test_cutoff_limits_credit() {
        let judged = judgments(&[("a", 1.0), ("b", 1.0)]);
        let metrics = evaluate(&ranked(&["a", "x", "b"]), &judged, 2);
        assert!((metrics.recall - 0.5).abs() < 1e-9);
    }
}
