//! Hybrid Search Engine
//!
//! Three timed phases:
//! - **Retrieval**: lexical, dense, and sparse searches fan out to detached
//!   threads over the unfiltered corpus; the collector waits out a hard
//!   budget (default 500 ms) and treats stragglers as soft failures.
//! - **Fusion**: weighted reciprocal rank fusion (k = 60) with uniform,
//!   caller-seeded two-way, or adaptive weights; unavailable methods are
//!   zeroed and the remainder renormalizes to 1.
//! - **Rerank** (optional): the top min(100, 5·limit) candidates go to the
//!   cross-encoder gateway under a 1 s budget; failure falls back to the
//!   fused ranking with a diagnostic.
//!
//! Filters apply after ranking so they never perturb fusion; facets count
//! the filtered candidates (capped at 1000); snippets center on the first
//! query-term hit.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::index::{DenseIndex, LexicalIndex, SparseIndex};
use crate::kernel::bus::{topics, Event};
use crate::kernel::gateway::tokenize;
use crate::kernel::{Deadline, Kernel};
use crate::resource::{Resource, ResourceFilters, ResourceStore};

use super::eval::{evaluate, EvalMetrics};
use super::facets::{compute_facets, Facets, FACET_CAP};
use super::fusion::{method_contributions, weighted_rrf, FusedCandidate};
use super::query::{adaptive_weights, analyze, FusionWeights, RetrievalMethod};
use super::snippets::make_snippet;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// A hybrid search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SearchRequest {
    /// Query text
    pub query: String,
    /// Page size, clamped to 1..=100
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Page offset
    #[serde(default)]
    pub offset: usize,
    /// Post-retrieval filters
    #[serde(default)]
    pub filters: ResourceFilters,
    /// Run the cross-encoder rerank phase
    #[serde(default)]
    pub enable_reranking: bool,
    /// Choose fusion weights by query analysis
    #[serde(default)]
    pub adaptive_weights: bool,
    /// Semantic share for the two-way fallback (sparse unavailable)
    pub hybrid_weight: Option<f64>,
}

fn default_limit() -> usize {
    25
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            limit: default_limit(),
            offset: 0,
            filters: ResourceFilters::default(),
            enable_reranking: false,
            adaptive_weights: false,
            hybrid_weight: None,
        }
    }
}

impl SearchRequest {
    /// A plain query with defaults.
    pub fn of(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

/// Raw per-method scores for a hit, where the method returned it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodScores {
    /// BM25 score
    pub lexical: Option<f32>,
    /// Cosine similarity
    pub dense: Option<f32>,
    /// Sparse dot product
    pub sparse: Option<f32>,
}

/// One search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    /// Resource id
    pub resource_id: String,
    /// Resource title
    pub title: String,
    /// Final score (fused, or cross-encoder when reranked)
    pub score: f64,
    /// ≤280-char excerpt
    pub snippet: String,
    /// Per-method raw scores
    pub method_scores: MethodScores,
}

/// Aggregate share of the fused mass per method.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodContributions {
    /// Lexical share
    pub lexical: f64,
    /// Dense share
    pub dense: f64,
    /// Sparse share
    pub sparse: f64,
}

/// Phase timings and degradation flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDiagnostics {
    /// Retrieval phase wall time
    pub retrieval_ms: u64,
    /// Fusion phase wall time
    pub fusion_ms: u64,
    /// Rerank phase wall time (0 when skipped)
    pub rerank_ms: u64,
    /// End-to-end wall time
    pub total_ms: u64,
    /// Weights used for fusion (renormalized)
    pub weights_used: FusionWeights,
    /// Share of fused mass per method
    pub method_contributions: MethodContributions,
    /// Soft failures, e.g. `lexical=timeout`, `reranker=skipped`
    pub degraded: Vec<String>,
    /// Rerank outcome: `applied`, `skipped`, or `disabled`
    pub reranker: String,
}

/// A full search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// The requested page, best first
    pub results: Vec<SearchHit>,
    /// Filtered total, bounded by the retrieval pool
    pub total: u64,
    /// Facet counts over the filtered candidates
    pub facets: Facets,
    /// Phase timings and flags
    pub diagnostics: SearchDiagnostics,
}

/// Per-method result lists for the comparison surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodComparison {
    /// Lexical results (id, bm25)
    pub lexical: Vec<(String, f32)>,
    /// Dense results (id, cosine)
    pub dense: Vec<(String, f32)>,
    /// Sparse results (id, dot product)
    pub sparse: Vec<(String, f32)>,
}

// ============================================================================
// RETRIEVAL FAN-OUT
// ============================================================================

struct RetrieverReply {
    method: RetrievalMethod,
    result: Result<Vec<(String, f32)>>,
    sparse_mismatches: usize,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The three-way hybrid search engine.
pub struct HybridSearchEngine {
    kernel: Arc<Kernel>,
    resources: Arc<ResourceStore>,
    lexical: Arc<LexicalIndex>,
    dense: Arc<DenseIndex>,
    sparse: Arc<SparseIndex>,
    /// LRU of query embeddings so repeated queries skip the embedder.
    query_embeddings: Arc<std::sync::Mutex<lru::LruCache<String, Vec<f32>>>>,
}

impl HybridSearchEngine {
    /// Wire the engine over the kernel and the three indices.
    pub fn new(
        kernel: Arc<Kernel>,
        resources: Arc<ResourceStore>,
        lexical: Arc<LexicalIndex>,
        dense: Arc<DenseIndex>,
        sparse: Arc<SparseIndex>,
    ) -> Self {
        let capacity = std::num::NonZeroUsize::new(kernel.settings.embedding_cache_size.max(1))
            .expect("capacity is at least 1");
        Self {
            kernel,
            resources,
            lexical,
            dense,
            sparse,
            query_embeddings: Arc::new(std::sync::Mutex::new(lru::LruCache::new(capacity))),
        }
    }

    /// Run the full pipeline.
    pub fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        if request.query.trim().is_empty() {
            return Err(CoreError::Validation("query must not be empty".to_string()));
        }
        let started = Instant::now();
        let limit = request.limit.clamp(1, 100);
        let k_retrieve = 200.max(5 * limit);

        let cache_key = request_cache_key(request);
        if let Some(cached) = self.kernel.cache.get::<SearchResponse>(&cache_key) {
            return Ok(cached);
        }

        let mut degraded: Vec<String> = Vec::new();

        // ---- Phase R: parallel retrieval -----------------------------------
        let retrieval_started = Instant::now();
        let (lists, sparse_usable, sparse_mismatches) =
            self.retrieve_parallel(&request.query, k_retrieve, &mut degraded);
        let retrieval_ms = retrieval_started.elapsed().as_millis() as u64;

        if sparse_mismatches > 0 {
            self.kernel.bus.emit(Event::new(
                topics::SPARSE_MODEL_MISMATCH,
                serde_json::json!({
                    "query_model": self.kernel.sparse_encoder.model_version(),
                    "mismatched_documents": sparse_mismatches,
                }),
            ));
            if !sparse_usable {
                degraded.push("sparse=model_mismatch".to_string());
            }
        }

        // ---- Weights -------------------------------------------------------
        let analysis = analyze(&request.query);
        let mut weights = if request.adaptive_weights {
            let doc_count = if analysis.single_ascii_token {
                self.lexical.doc_count(&analysis.tokens[0]).unwrap_or(0)
            } else {
                0
            };
            adaptive_weights(&analysis, doc_count)
        } else if !sparse_usable {
            let seed = request
                .hybrid_weight
                .unwrap_or(self.kernel.settings.default_hybrid_weight);
            FusionWeights::two_way(seed)
        } else {
            FusionWeights::uniform()
        };
        for (method, list) in &lists {
            if list.is_none() {
                weights = weights.without(*method);
            }
        }
        if !sparse_usable {
            weights = weights.without(RetrievalMethod::Sparse);
        }

        // ---- Phase F: fusion ----------------------------------------------
        let fusion_started = Instant::now();
        let available: Vec<(RetrievalMethod, Vec<(String, f32)>)> = lists
            .into_iter()
            .filter_map(|(method, list)| list.map(|l| (method, l)))
            .collect();

        if available.is_empty() {
            degraded.push("all_retrievers_failed".to_string());
        }

        let mut candidates = weighted_rrf(&available, &weights);
        let contributions = method_contributions(&candidates);
        let fusion_ms = fusion_started.elapsed().as_millis() as u64;

        // ---- Phase X: rerank ----------------------------------------------
        let rerank_started = Instant::now();
        let reranker_outcome = if !request.enable_reranking {
            "disabled".to_string()
        } else if candidates.is_empty() {
            "skipped".to_string()
        } else {
            match self.rerank_top(&request.query, &mut candidates, limit) {
                Ok(()) => "applied".to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "reranker failed; keeping fused order");
                    degraded.push("reranker=skipped".to_string());
                    "skipped".to_string()
                }
            }
        };
        let rerank_ms = rerank_started.elapsed().as_millis() as u64;

        // ---- Filter, facets, paginate -------------------------------------
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let fetched = self.resources.get_many(&ids)?;
        let by_id: HashMap<&str, &Resource> =
            fetched.iter().map(|r| (r.id.as_str(), r)).collect();

        let filtered: Vec<&FusedCandidate> = candidates
            .iter()
            .filter(|c| {
                by_id
                    .get(c.id.as_str())
                    .is_some_and(|r| request.filters.matches(r))
            })
            .collect();
        let total = filtered.len() as u64;

        let facets = compute_facets(
            filtered
                .iter()
                .take(FACET_CAP)
                .filter_map(|c| by_id.get(c.id.as_str()).copied()),
        );

        let terms = tokenize(&request.query);
        let mut results = Vec::with_capacity(limit);
        for candidate in filtered.iter().skip(request.offset).take(limit) {
            let Some(resource) = by_id.get(candidate.id.as_str()) else {
                continue;
            };
            let body = self.resources.archive(&candidate.id)?.unwrap_or_default();
            results.push(SearchHit {
                resource_id: candidate.id.clone(),
                title: resource.title.clone(),
                score: candidate.score,
                snippet: make_snippet(&resource.title, &resource.description, &body, &terms),
                method_scores: MethodScores {
                    lexical: candidate.method_scores[RetrievalMethod::Lexical.idx()],
                    dense: candidate.method_scores[RetrievalMethod::Dense.idx()],
                    sparse: candidate.method_scores[RetrievalMethod::Sparse.idx()],
                },
            });
        }

        let response = SearchResponse {
            results,
            total,
            facets,
            diagnostics: SearchDiagnostics {
                retrieval_ms,
                fusion_ms,
                rerank_ms,
                total_ms: started.elapsed().as_millis() as u64,
                weights_used: weights,
                method_contributions: MethodContributions {
                    lexical: contributions[RetrievalMethod::Lexical.idx()],
                    dense: contributions[RetrievalMethod::Dense.idx()],
                    sparse: contributions[RetrievalMethod::Sparse.idx()],
                },
                degraded,
                reranker: reranker_outcome,
            },
        };

        self.kernel.cache.put(&cache_key, &response);
        Ok(response)
    }

    /// Fan the three retrievals out to detached threads and collect whatever
    /// lands before the budget expires. A missing or failed method reads as
    /// `None`; stragglers deliver into a dropped channel and are discarded.
    fn retrieve_parallel(
        &self,
        query: &str,
        k_retrieve: usize,
        degraded: &mut Vec<String>,
    ) -> (Vec<(RetrievalMethod, Option<Vec<(String, f32)>>)>, bool, usize) {
        let budget_ms = self.kernel.settings.retrieval_budget_ms;
        let deadline = Deadline::from_millis(budget_ms);
        let (tx, rx) = mpsc::channel::<RetrieverReply>();

        {
            let tx = tx.clone();
            let lexical = Arc::clone(&self.lexical);
            let query = query.to_string();
            std::thread::spawn(move || {
                let result = lexical.search(&query, k_retrieve);
                let _ = tx.send(RetrieverReply {
                    method: RetrievalMethod::Lexical,
                    result,
                    sparse_mismatches: 0,
                });
            });
        }
        {
            let tx = tx.clone();
            let dense = Arc::clone(&self.dense);
            let embedder = Arc::clone(&self.kernel.embedder);
            let embeddings = Arc::clone(&self.query_embeddings);
            let query = query.to_string();
            std::thread::spawn(move || {
                let cached = embeddings
                    .lock()
                    .ok()
                    .and_then(|mut cache| cache.get(&query).cloned());
                let vector = match cached {
                    Some(qv) => Ok(qv),
                    None => embedder
                        .embed(&[query.as_str()], deadline)
                        .map_err(|e| CoreError::from_gateway("embedding", e))
                        .and_then(|vectors| {
                            vectors.into_iter().next().ok_or_else(|| {
                                CoreError::Internal("embedder returned no vector".to_string())
                            })
                        })
                        .inspect(|qv| {
                            if let Ok(mut cache) = embeddings.lock() {
                                cache.put(query.clone(), qv.clone());
                            }
                        }),
                };
                let result = vector.and_then(|qv| dense.search(&qv, k_retrieve));
                let _ = tx.send(RetrieverReply {
                    method: RetrievalMethod::Dense,
                    result,
                    sparse_mismatches: 0,
                });
            });
        }
        {
            let tx = tx.clone();
            let sparse = Arc::clone(&self.sparse);
            let encoder = Arc::clone(&self.kernel.sparse_encoder);
            let query = query.to_string();
            std::thread::spawn(move || {
                let reply = match encoder.encode(&query, deadline) {
                    Ok(qv) => {
                        let outcome = sparse.search(&qv, encoder.model_version(), k_retrieve);
                        RetrieverReply {
                            method: RetrievalMethod::Sparse,
                            result: Ok(outcome.results),
                            sparse_mismatches: outcome.version_mismatches,
                        }
                    }
                    Err(e) => RetrieverReply {
                        method: RetrievalMethod::Sparse,
                        result: Err(CoreError::from_gateway("sparse_encoder", e)),
                        sparse_mismatches: 0,
                    },
                };
                let _ = tx.send(reply);
            });
        }
        drop(tx);

        let mut lists: Vec<(RetrievalMethod, Option<Vec<(String, f32)>>)> = vec![
            (RetrievalMethod::Lexical, None),
            (RetrievalMethod::Dense, None),
            (RetrievalMethod::Sparse, None),
        ];
        let mut sparse_mismatches = 0usize;
        let mut received = 0;
        while received < 3 {
            match rx.recv_timeout(deadline.remaining()) {
                Ok(reply) => {
                    received += 1;
                    match reply.result {
                        Ok(results) => {
                            if reply.method == RetrievalMethod::Sparse {
                                sparse_mismatches = reply.sparse_mismatches;
                            }
                            lists[reply.method.idx()].1 = Some(results);
                        }
                        Err(e) => {
                            tracing::warn!(
                                method = reply.method.as_str(),
                                error = %e,
                                "retriever failed; fusing the rest"
                            );
                            degraded.push(format!("{}=error", reply.method.as_str()));
                        }
                    }
                }
                Err(_) => break,
            }
        }
        for (method, list) in &lists {
            let already_flagged = degraded
                .iter()
                .any(|d| d.starts_with(method.as_str()));
            if list.is_none() && !already_flagged {
                degraded.push(format!("{}=timeout", method.as_str()));
            }
        }

        // Sparse is usable when the method succeeded and the index holds at
        // least one document for the current model version (or is empty, in
        // which case there is simply nothing to find).
        let sparse_ok = lists[RetrievalMethod::Sparse.idx()].1.is_some();
        let sparse_usable = sparse_ok
            && (self.sparse.is_empty()
                || self
                    .sparse
                    .has_model(self.kernel.sparse_encoder.model_version()));

        (lists, sparse_usable, sparse_mismatches)
    }

    /// Rerank the top candidates in place: cross-encoder scores replace the
    /// fused scores for those ids, everything re-sorts descending (stable).
    fn rerank_top(
        &self,
        query: &str,
        candidates: &mut [FusedCandidate],
        limit: usize,
    ) -> Result<()> {
        let k_rerank = 100.min(5 * limit).min(candidates.len());
        let head = &candidates[..k_rerank];

        let ids: Vec<String> = head.iter().map(|c| c.id.clone()).collect();
        let fetched = self.resources.get_many(&ids)?;
        let by_id: HashMap<&str, &Resource> =
            fetched.iter().map(|r| (r.id.as_str(), r)).collect();

        // Fixed reranker input per deployment: title + description, archive
        // prefix when the description is empty.
        let mut documents: Vec<String> = Vec::with_capacity(head.len());
        for candidate in head {
            let text = match by_id.get(candidate.id.as_str()) {
                Some(resource) if !resource.description.is_empty() => {
                    format!("{}\n{}", resource.title, resource.description)
                }
                Some(resource) => {
                    let body = self.resources.archive(&candidate.id)?.unwrap_or_default();
                    let prefix: String = body.chars().take(512).collect();
                    format!("{}\n{}", resource.title, prefix)
                }
                None => String::new(),
            };
            documents.push(text);
        }
        let doc_refs: Vec<&str> = documents.iter().map(String::as_str).collect();

        let deadline = Deadline::from_millis(self.kernel.settings.rerank_budget_ms);
        let scores = self
            .kernel
            .reranker
            .score(query, &doc_refs, deadline)
            .map_err(|e| CoreError::from_gateway("reranker", e))?;

        for (candidate, score) in candidates.iter_mut().zip(scores.iter()) {
            candidate.score = *score as f64;
        }
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    /// Per-method result lists, for side-by-side comparison.
    pub fn compare_methods(&self, query: &str, limit: usize) -> Result<MethodComparison> {
        let limit = limit.clamp(1, 100);
        let deadline = Deadline::from_millis(self.kernel.settings.retrieval_budget_ms);

        let lexical = self.lexical.search(query, limit).unwrap_or_default();

        let dense = self
            .kernel
            .embedder
            .embed(&[query], deadline)
            .ok()
            .and_then(|vectors| vectors.into_iter().next())
            .and_then(|qv| self.dense.search(&qv, limit).ok())
            .unwrap_or_default();

        let sparse = self
            .kernel
            .sparse_encoder
            .encode(query, deadline)
            .map(|qv| {
                self.sparse
                    .search(&qv, self.kernel.sparse_encoder.model_version(), limit)
                    .results
            })
            .unwrap_or_default();

        Ok(MethodComparison {
            lexical,
            dense,
            sparse,
        })
    }

    /// Rank-quality metrics for a query against graded judgments.
    pub fn evaluate(
        &self,
        query: &str,
        judgments: &HashMap<String, f64>,
        k: usize,
    ) -> Result<EvalMetrics> {
        let response = self.search(&SearchRequest {
            query: query.to_string(),
            limit: k.clamp(1, 100),
            ..Default::default()
        })?;
        let ranked: Vec<String> = response
            .results
            .iter()
            .map(|hit| hit.resource_id.clone())
            .collect();
        Ok(evaluate(&ranked, judgments, k))
    }
}

/// Stable cache key for a search request.
fn request_cache_key(request: &SearchRequest) -> String {
    let serialized = serde_json::to_string(request).unwrap_or_default();
    format!(
        "search_query:{:016x}",
        crate::kernel::gateway::fnv1a(&serialized)
    )
}
