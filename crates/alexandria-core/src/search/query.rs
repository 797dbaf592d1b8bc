//! Query Analysis and Adaptive Weighting
//!
//! Deterministic rules choose the fusion weights from surface features of
//! the query (token count, stopword ratio, exact-term frequency). When a
//! retriever is unavailable its weight is zeroed and the remainder
//! renormalizes to sum to 1 within 1e-9.

use serde::{Deserialize, Serialize};

use crate::kernel::gateway::tokenize;

/// The three retrieval methods feeding fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    /// Full-text BM25
    Lexical,
    /// Dense kNN
    Dense,
    /// Learned sparse dot-product
    Sparse,
}

impl RetrievalMethod {
    /// Stable index into per-method arrays.
    pub fn idx(&self) -> usize {
        match self {
            RetrievalMethod::Lexical => 0,
            RetrievalMethod::Dense => 1,
            RetrievalMethod::Sparse => 2,
        }
    }

    /// Display name for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMethod::Lexical => "lexical",
            RetrievalMethod::Dense => "dense",
            RetrievalMethod::Sparse => "sparse",
        }
    }
}

/// Per-method fusion weights. Always kept normalized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionWeights {
    /// Lexical share
    pub lexical: f64,
    /// Dense share
    pub dense: f64,
    /// Sparse share
    pub sparse: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self::uniform()
    }
}

impl FusionWeights {
    /// Equal thirds.
    pub fn uniform() -> Self {
        Self {
            lexical: 1.0 / 3.0,
            dense: 1.0 / 3.0,
            sparse: 1.0 / 3.0,
        }
    }

    /// Two-way split seeded by a semantic share `w`: dense gets `w`,
    /// lexical the rest, sparse nothing. Used when sparse is unavailable
    /// and the caller supplied an explicit hybrid weight.
    pub fn two_way(semantic_share: f64) -> Self {
        let w = semantic_share.clamp(0.0, 1.0);
        Self {
            lexical: 1.0 - w,
            dense: w,
            sparse: 0.0,
        }
    }

    /// Weight for one method.
    pub fn get(&self, method: RetrievalMethod) -> f64 {
        match method {
            RetrievalMethod::Lexical => self.lexical,
            RetrievalMethod::Dense => self.dense,
            RetrievalMethod::Sparse => self.sparse,
        }
    }

    /// Zero the weight of an unavailable method and renormalize the rest to
    /// sum to 1 (within 1e-9). All-zero degenerates to uniform.
    pub fn without(&self, method: RetrievalMethod) -> Self {
        let mut weights = *self;
        match method {
            RetrievalMethod::Lexical => weights.lexical = 0.0,
            RetrievalMethod::Dense => weights.dense = 0.0,
            RetrievalMethod::Sparse => weights.sparse = 0.0,
        }
        weights.normalized()
    }

    /// Scale so the components sum to 1.
    pub fn normalized(&self) -> Self {
        let sum = self.lexical + self.dense + self.sparse;
        if sum <= f64::EPSILON {
            return Self::uniform();
        }
        Self {
            lexical: self.lexical / sum,
            dense: self.dense / sum,
            sparse: self.sparse / sum,
        }
    }

    /// Component sum (1 ± 1e-9 after normalization).
    pub fn sum(&self) -> f64 {
        self.lexical + self.dense + self.sparse
    }
}

/// Common English stopwords for the ratio heuristic.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "how",
    "in", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "very", "was", "what",
    "when", "where", "which", "who", "why", "will", "with", "about",
];

/// Surface features extracted from a query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    /// Alphanumeric tokens
    pub tokens: Vec<String>,
    /// Fraction of tokens that are stopwords
    pub stopword_ratio: f64,
    /// Single ASCII token query
    pub single_ascii_token: bool,
}

/// Analyze a query's surface features.
pub fn analyze(query: &str) -> QueryAnalysis {
    let tokens = tokenize(query);
    let stopwords = tokens
        .iter()
        .filter(|t| STOPWORDS.contains(&t.as_str()))
        .count();
    let stopword_ratio = if tokens.is_empty() {
        0.0
    } else {
        stopwords as f64 / tokens.len() as f64
    };
    let single_ascii_token = tokens.len() == 1 && tokens[0].is_ascii();
    QueryAnalysis {
        tokens,
        stopword_ratio,
        single_ascii_token,
    }
}

/// Deterministic adaptive weighting:
/// - single ASCII token appearing as an exact term in ≥5 documents →
///   lexical-heavy (0.50 / 0.25 / 0.25);
/// - short query (2-3 tokens) with stopword ratio < 0.5 →
///   balanced (0.35 / 0.35 / 0.30);
/// - long query (≥4 tokens) or stopword ratio ≥ 0.5 →
///   dense-heavy (0.25 / 0.45 / 0.30);
/// - anything else → uniform.
pub fn adaptive_weights(analysis: &QueryAnalysis, exact_term_doc_count: usize) -> FusionWeights {
    if analysis.single_ascii_token && exact_term_doc_count >= 5 {
        return FusionWeights {
            lexical: 0.50,
            dense: 0.25,
            sparse: 0.25,
        };
    }
    let n = analysis.tokens.len();
    if n >= 4 || analysis.stopword_ratio >= 0.5 {
        return FusionWeights {
            lexical: 0.25,
            dense: 0.45,
            sparse: 0.30,
        };
    }
    if (2..=3).contains(&n) {
        return FusionWeights {
            lexical: 0.35,
            dense: 0.35,
            sparse: 0.30,
        };
    }
    FusionWeights::uniform()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frequent_token_is_lexical_heavy() {
        let analysis = analyze("rust");
        let weights = adaptive_weights(&analysis, 12);
        assert_eq!(weights.lexical, 0.50);
        assert!((weights.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_rare_token_falls_back_to_uniform() {
        let analysis = analyze("quixotic");
        let weights = adaptive_weights(&analysis, 1);
        assert_eq!(weights, FusionWeights::uniform());
    }

    #[test]
    fn test_short_query_balanced() {
        let analysis = analyze("rust borrow checker");
        assert!(analysis.stopword_ratio < 0.5);
        let weights = adaptive_weights(&analysis, 0);
        assert_eq!(weights.lexical, 0.35);
        assert_eq!(weights.dense, 0.35);
    }

    #[test]
    fn test_long_query_is_dense_heavy() {
        let analysis =
            analyze("a very long multi term query about deep reinforcement learning transformers");
        let weights = adaptive_weights(&analysis, 0);
        assert_eq!(weights.dense, 0.45);
        assert!(weights.lexical < weights.dense);
    }

    #[test]
    fn test_stopword_heavy_short_query_is_dense_heavy() {
        let analysis = analyze("what is the rust");
        assert!(analysis.stopword_ratio >= 0.5);
        let weights = adaptive_weights(&analysis, 0);
        assert_eq!(weights.dense, 0.45);
    }

    #[test]
    fn test_renormalization_without_method() {
        let weights = FusionWeights {
            lexical: 0.25,
            dense: 0.45,
            sparse: 0.30,
        };
        let collapsed = weights.without(RetrievalMethod::Sparse);
        assert_eq!(collapsed.sparse, 0.0);
        assert!((collapsed.sum() - 1.0).abs() < 1e-9);
        // Relative lexical/dense proportions preserved
        assert!((collapsed.dense / collapsed.lexical - 0.45 / 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_two_way_seed() {
        let weights = FusionWeights::two_way(0.7);
        assert!((weights.dense - 0.7).abs() < 1e-9);
        assert!((weights.lexical - 0.3).abs() < 1e-9);
        assert_eq!(weights.sparse, 0.0);
    }
}
