//! Model Gateways
//!
//! The engine treats embedding models, sparse encoders, and cross-encoder
//! rerankers as opaque functions behind traits, so production code can plug
//! in real inference (fastembed behind the `embeddings` feature) while tests
//! and default deployments run on deterministic local implementations.
//!
//! Every gateway call takes a [`Deadline`]; implementations are expected to
//! give up once it passes rather than block the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::kernel::Deadline;
use crate::vector::l2_normalize;

// ============================================================================
// SPARSE VECTORS
// ============================================================================

/// Learned sparse representation: term-id → nonnegative weight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    /// Term weights, keyed by hashed term id. BTreeMap keeps serialization
    /// deterministic.
    pub weights: BTreeMap<u32, f32>,
}

impl SparseVector {
    /// Dot product with another sparse vector.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        // Iterate the smaller side
        let (small, large) = if self.weights.len() <= other.weights.len() {
            (&self.weights, &other.weights)
        } else {
            (&other.weights, &self.weights)
        };
        small
            .iter()
            .filter_map(|(term, w)| large.get(term).map(|v| w * v))
            .sum()
    }

    /// Number of nonzero terms.
    pub fn nnz(&self) -> usize {
        self.weights.len()
    }

    /// True when no term has weight.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

// ============================================================================
// GATEWAY TRAITS
// ============================================================================

/// Dense embedding model. Returned vectors MUST be unit-norm and of a fixed
/// dimensionality for a given model version.
pub trait EmbeddingGateway: Send + Sync {
    /// Model version tag stamped on produced vectors.
    fn model_version(&self) -> &str;

    /// Output dimensionality.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, one unit-norm vector per text.
    fn embed(&self, texts: &[&str], deadline: Deadline) -> Result<Vec<Vec<f32>>, GatewayError>;
}

/// Learned sparse encoder. Queries and documents go through the same
/// encoder so their term spaces line up.
pub trait SparseEncoder: Send + Sync {
    /// Model version tag recorded per encoded document.
    fn model_version(&self) -> &str;

    /// Encode text into a term-weight map.
    fn encode(&self, text: &str, deadline: Deadline) -> Result<SparseVector, GatewayError>;
}

/// Cross-encoder reranker scoring (query, document) pairs.
pub trait RerankGateway: Send + Sync {
    /// Model version tag, surfaced in diagnostics.
    fn model_version(&self) -> &str;

    /// One relevance score per document, higher is better.
    fn score(
        &self,
        query: &str,
        documents: &[&str],
        deadline: Deadline,
    ) -> Result<Vec<f32>, GatewayError>;
}

// ============================================================================
// TOKENIZATION
// ============================================================================

/// Lowercased alphanumeric tokens, the shared view of text for the local
/// gateways.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// FNV-1a over a token. Stable across runs and platforms, unlike the std
/// hasher's randomized keys.
pub(crate) fn fnv1a(token: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in token.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

// ============================================================================
// DETERMINISTIC LOCAL GATEWAYS
// ============================================================================

/// Feature-hashing embedder: each token lands in a hash bucket with a
/// hash-derived sign, the result is L2-normalized. Deterministic, fast, and
/// good enough for tests and model-free deployments: identical texts map to
/// identical vectors, token overlap yields cosine overlap.
pub struct HashingEmbedder {
    dimensions: usize,
    version: String,
}

impl HashingEmbedder {
    /// Create an embedder producing `dimensions`-length vectors.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            version: format!("hash-embedder/{dimensions}"),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            let h = fnv1a(&token);
            let bucket = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        l2_normalize(v)
    }
}

impl EmbeddingGateway for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[&str], deadline: Deadline) -> Result<Vec<Vec<f32>>, GatewayError> {
        if deadline.expired() {
            return Err(GatewayError::transient("embedding deadline expired"));
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Bucket space for hashed term ids (2^20 buckets).
const TERM_BUCKETS: u64 = 1 << 20;

/// Log-TF sparse encoder over hashed term ids. Plays the role of a learned
/// sparse model with a fixed vocabulary hash; weights are nonnegative.
pub struct TermWeightEncoder {
    version: String,
}

impl Default for TermWeightEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TermWeightEncoder {
    /// Create the encoder.
    pub fn new() -> Self {
        Self {
            version: "term-weight/v1".to_string(),
        }
    }
}

impl SparseEncoder for TermWeightEncoder {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn encode(&self, text: &str, deadline: Deadline) -> Result<SparseVector, GatewayError> {
        if deadline.expired() {
            return Err(GatewayError::transient("sparse encode deadline expired"));
        }

        let mut tf: BTreeMap<u32, f32> = BTreeMap::new();
        for token in tokenize(text) {
            let term = (fnv1a(&token) % TERM_BUCKETS) as u32;
            *tf.entry(term).or_default() += 1.0;
        }
        let weights = tf
            .into_iter()
            .map(|(term, count)| (term, 1.0 + count.ln()))
            .collect();
        Ok(SparseVector { weights })
    }
}

/// Term-overlap reranker: BM25-flavored scoring of the document against the
/// query. The fallback path when no cross-encoder model is loaded.
pub struct OverlapReranker {
    version: String,
}

impl Default for OverlapReranker {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlapReranker {
    /// Create the reranker.
    pub fn new() -> Self {
        Self {
            version: "overlap-reranker/v1".to_string(),
        }
    }

    fn score_one(query_terms: &[String], document: &str) -> f32 {
        let doc_lower = document.to_lowercase();
        let doc_len = doc_lower.len() as f32;
        if doc_len == 0.0 || query_terms.is_empty() {
            return 0.0;
        }

        let k1 = 1.2_f32;
        let b = 0.75_f32;
        let avg_doc_len = 500.0_f32;

        let mut score = 0.0;
        for term in query_terms {
            let tf = doc_lower.matches(term.as_str()).count() as f32;
            if tf > 0.0 {
                let numerator = tf * (k1 + 1.0);
                let denominator = tf + k1 * (1.0 - b + b * (doc_len / avg_doc_len));
                score += numerator / denominator;
            }
        }
        score / query_terms.len() as f32
    }
}

impl RerankGateway for OverlapReranker {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn score(
        &self,
        query: &str,
        documents: &[&str],
        deadline: Deadline,
    ) -> Result<Vec<f32>, GatewayError> {
        if deadline.expired() {
            return Err(GatewayError::transient("rerank deadline expired"));
        }
        let query_terms = tokenize(query);
        Ok(documents
            .iter()
            .map(|doc| Self::score_one(&query_terms, doc))
            .collect())
    }
}

// ============================================================================
// FASTEMBED GATEWAYS (feature = "embeddings")
// ============================================================================

/// Local ONNX embedding model via fastembed.
#[cfg(feature = "embeddings")]
pub struct FastembedEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
    version: String,
    dimensions: usize,
}

#[cfg(feature = "embeddings")]
impl FastembedEmbedder {
    /// Load the default model. Downloads weights on first use; call during
    /// startup, not on hot paths.
    pub fn new(dimensions: usize) -> Result<Self, GatewayError> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| GatewayError::permanent(format!("embedding model init: {e}")))?;
        Ok(Self {
            model: std::sync::Mutex::new(model),
            version: "nomic-ai/nomic-embed-text-v1.5".to_string(),
            dimensions,
        })
    }
}

#[cfg(feature = "embeddings")]
impl EmbeddingGateway for FastembedEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, texts: &[&str], deadline: Deadline) -> Result<Vec<Vec<f32>>, GatewayError> {
        if deadline.expired() {
            return Err(GatewayError::transient("embedding deadline expired"));
        }
        let owned: Vec<String> = texts.iter().map(|t| (*t).to_string()).collect();
        let mut model = self
            .model
            .lock()
            .map_err(|_| GatewayError::permanent("embedding model lock poisoned"))?;
        let raw = model
            .embed(owned, None)
            .map_err(|e| GatewayError::transient(format!("embedding inference: {e}")))?;
        Ok(raw
            .into_iter()
            .map(|v| l2_normalize(v.into_iter().take(self.dimensions).collect()))
            .collect())
    }
}

/// Cross-encoder reranker via fastembed (Jina Reranker v1 Turbo).
#[cfg(feature = "embeddings")]
pub struct FastembedReranker {
    model: std::sync::Mutex<fastembed::TextRerank>,
    version: String,
}

#[cfg(feature = "embeddings")]
impl FastembedReranker {
    /// Load the reranker model (~150 MB download on first use).
    pub fn new() -> Result<Self, GatewayError> {
        use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

        let options = RerankInitOptions::new(RerankerModel::JINARerankerV1TurboEn);
        let model = TextRerank::try_new(options)
            .map_err(|e| GatewayError::permanent(format!("reranker init: {e}")))?;
        Ok(Self {
            model: std::sync::Mutex::new(model),
            version: "jina-reranker-v1-turbo-en".to_string(),
        })
    }
}

#[cfg(feature = "embeddings")]
impl RerankGateway for FastembedReranker {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn score(
        &self,
        query: &str,
        documents: &[&str],
        deadline: Deadline,
    ) -> Result<Vec<f32>, GatewayError> {
        if deadline.expired() {
            return Err(GatewayError::transient("rerank deadline expired"));
        }
        let mut model = self
            .model
            .lock()
            .map_err(|_| GatewayError::permanent("reranker lock poisoned"))?;
        let docs: Vec<&str> = documents.to_vec();
        let results = model
            .rerank(query, &docs, false, None)
            .map_err(|e| GatewayError::transient(format!("rerank inference: {e}")))?;

        // fastembed returns results sorted by score; restore input order
        let mut scores = vec![0.0f32; documents.len()];
        for r in results {
            if let Some(slot) = scores.get_mut(r.index) {
                *slot = r.score;
            }
        }
        Ok(scores)
    }
}

// ============================================================================
// TESTS
// ============================================================================
