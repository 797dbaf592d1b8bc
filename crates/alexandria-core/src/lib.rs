//! # Alexandria Core
//!
//! Retrieval and knowledge-organization engine for a self-hosted knowledge
//! base: ingest URLs, archive and enrich their content, and expose
//! discovery over three tightly coupled subsystems:
//!
//! - **Three-way hybrid search**: lexical BM25 (SQLite FTS5) + dense kNN +
//!   learned sparse retrieval, fused with weighted Reciprocal Rank Fusion
//!   (k = 60), adaptive query weighting, and optional cross-encoder
//!   reranking.
//! - **Multi-signal knowledge graph**: hybrid-weighted resource edges
//!   (vector cosine + subject Jaccard + classification match), plus a
//!   citation network with PageRank importance.
//! - **Event-driven runtime**: an in-process pub/sub bus and a durable
//!   prioritized task queue keep indices, embeddings, quality scores,
//!   classifications, and graph edges converging with the resource store.
//!
//! Model inference is a boundary, not a dependency: embedders, sparse
//! encoders, rerankers, classifiers, and trainers sit behind traits with
//! deterministic local implementations, and fastembed-backed versions are
//! available behind the `embeddings` feature.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use alexandria_core::{Engine, Settings, StaticFetcher};
//!
//! let fetcher = Arc::new(StaticFetcher::new());
//! let engine = Engine::open(Settings::default(), fetcher)?;
//! engine.start_workers();
//!
//! // Ingest a URL: the id comes back immediately, processing is async
//! let resource = engine.ingest.ingest("https://example.com/paper", &Default::default())?;
//!
//! // Search once the pipeline has run
//! let results = engine.search.search(&alexandria_core::SearchRequest::of("neural retrieval"))?;
//! ```
//!
//! ## Feature Flags
//!
//! - `bundled-sqlite` (default): compile SQLite in
//! - `embeddings`: fastembed dense embeddings + cross-encoder reranker
//! - `vector-search`: USearch HNSW acceleration for the dense index
//! - `full`: both of the above

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod annotation;
pub mod collection;
pub mod config;
pub mod error;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod kernel;
pub mod monitoring;
pub mod quality;
pub mod recommend;
pub mod resource;
pub mod runtime;
pub mod search;
pub mod storage;
pub mod taxonomy;
pub mod vector;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{CacheTtls, GraphWeights, Settings};
pub use error::{CoreError, GatewayError, Result};
pub use runtime::{Engine, Gateways};

// Kernel surfaces
pub use kernel::{
    Clock, Deadline, Event, EventBus, HandlerRegistry, HashingEmbedder, Kernel, ManualClock,
    OverlapReranker, SparseVector, SystemClock, Task, TaskHandler, TaskQueue, TaskRequest,
    TermWeightEncoder, TtlCache, WorkerPool,
};

// Resource aggregate
pub use resource::{
    IngestionStatus, QualityDimensions, ReadStatus, Resource, ResourceFilters, ResourceOverrides,
    ResourceStore, ResourceUpdate, SortDir, SortField,
};

// Ingestion boundary
pub use ingest::{ContentFetcher, ContentKind, FetchedDocument, IngestOrchestrator, StaticFetcher};

// Search
pub use search::{
    EvalMetrics, Facets, FusionWeights, HybridSearchEngine, MethodComparison, RetrievalMethod,
    SearchHit, SearchRequest, SearchResponse,
};

// Indices
pub use index::{DenseIndex, LexicalDocument, LexicalIndex, SparseIndex};

// Taxonomy + classification
pub use taxonomy::{
    uncertainty, ActiveLearning, Classifier, ClassifierModel, KeywordClassifier, LabelInfo,
    Prediction, StaticTrainer, TaxonomyNode, TaxonomyStore, TrainedClassifier, Trainer,
    TrainingExample,
};

// Quality
pub use quality::{
    DegradationReport, OutlierDetector, OutlierReport, QualityEngine, QualityMonitor,
    QualityScore, QualityWeights,
};

// Graph + citations
pub use graph::{
    classify_url, pagerank, Citation, CitationGraph, CitationType, GraphEdge, KnowledgeGraph,
    Neighbor,
};

// Recommendations
pub use recommend::{
    CollaborativeModel, InteractionKind, ProfileStore, Recommendation, Recommender, Strategy,
    UserInteraction, UserProfile,
};

// Collections + annotations
pub use annotation::{Annotation, AnnotationInput, AnnotationStore, AnnotationUpdate};
pub use collection::{Collection, CollectionStore, Visibility};

// Monitoring
pub use monitoring::MonitoringSnapshot;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        ContentFetcher, CoreError, Engine, FetchedDocument, IngestionStatus, Resource,
        ResourceFilters, ResourceOverrides, Result, SearchRequest, SearchResponse, Settings,
        StaticFetcher, Strategy,
    };
}
