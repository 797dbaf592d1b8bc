//! Hybrid Search
//!
//! Three-way retrieval (lexical BM25 + dense kNN + learned sparse) fused
//! with weighted reciprocal rank fusion, optionally reranked by a
//! cross-encoder, with post-ranking filters, facets, snippets, and a
//! standard rank-metric evaluation surface.

mod engine;
mod eval;
mod facets;
mod fusion;
mod query;
mod snippets;

pub use engine::{
    HybridSearchEngine, MethodComparison, MethodContributions, MethodScores, SearchDiagnostics,
    SearchHit, SearchRequest, SearchResponse,
};
pub use eval::{evaluate, EvalMetrics};
pub use facets::{compute_facets, Facets, FACET_CAP};
pub use fusion::{method_contributions, weighted_rrf, FusedCandidate, RRF_K};
pub use query::{adaptive_weights, analyze, FusionWeights, QueryAnalysis, RetrievalMethod};
pub use snippets::{make_snippet, MAX_SNIPPET_LEN};
