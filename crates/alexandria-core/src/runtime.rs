//! Engine Runtime
//!
//! Constructs the kernel and every module over it, wires the event
//! subscriptions and task handlers that keep derived state converging with
//! the resource store, and owns the worker pool. Modules never call each
//! other directly; everything crosses the bus or the queue, and the wiring
//! closures capture only the service handles they need.

use std::sync::{Arc, Mutex};

use rusqlite::params;

use crate::annotation::AnnotationStore;
use crate::collection::CollectionStore;
use crate::config::Settings;
use crate::error::{CoreError, Result};
use crate::graph::{CitationGraph, KnowledgeGraph};
use crate::index::{DenseIndex, LexicalDocument, LexicalIndex, SparseIndex};
use crate::ingest::{ContentFetcher, IngestOrchestrator};
use crate::kernel::bus::{topics, EventBus};
use crate::kernel::cache::TtlCache;
use crate::kernel::clock::{Clock, SystemClock};
use crate::kernel::gateway::{
    EmbeddingGateway, HashingEmbedder, OverlapReranker, RerankGateway, SparseEncoder,
    TermWeightEncoder,
};
use crate::kernel::queue::{kinds, HandlerRegistry, Task, TaskQueue, WorkerPool};
use crate::kernel::{Deadline, Kernel, TaskRequest};
use crate::monitoring::MonitoringSnapshot;
use crate::quality::{OutlierDetector, QualityEngine, QualityMonitor};
use crate::recommend::{
    CollaborativeModel, CooccurrenceCollaborative, InteractionKind, ProfileStore, Recommender,
};
use crate::resource::ResourceStore;
use crate::search::HybridSearchEngine;
use crate::storage::Store;
use crate::taxonomy::{
    ActiveLearning, Classifier, KeywordClassifier, StaticTrainer, TaxonomyStore, Trainer,
};

/// Swappable gateway set for [`Engine::open_with`]. Defaults are the
/// deterministic local implementations.
pub struct Gateways {
    /// Dense embedder
    pub embedder: Arc<dyn EmbeddingGateway>,
    /// Sparse encoder
    pub sparse_encoder: Arc<dyn SparseEncoder>,
    /// Cross-encoder reranker
    pub reranker: Arc<dyn RerankGateway>,
    /// Classifier trainer
    pub trainer: Arc<dyn Trainer>,
    /// Clock
    pub clock: Arc<dyn Clock>,
}

impl Gateways {
    /// Deterministic local gateways sized from the settings.
    pub fn local(settings: &Settings) -> Self {
        Self {
            embedder: Arc::new(HashingEmbedder::new(settings.embedding_dimensions)),
            sparse_encoder: Arc::new(TermWeightEncoder::new()),
            reranker: Arc::new(OverlapReranker::new()),
            trainer: Arc::new(StaticTrainer::with_f1(0.85)),
            clock: Arc::new(SystemClock),
        }
    }
}

/// The assembled engine.
pub struct Engine {
    /// Shared kernel
    pub kernel: Arc<Kernel>,
    /// Resource store
    pub resources: Arc<ResourceStore>,
    /// Annotations
    pub annotations: Arc<AnnotationStore>,
    /// Collections
    pub collections: Arc<CollectionStore>,
    /// Taxonomy tree
    pub taxonomy: Arc<TaxonomyStore>,
    /// Classifier
    pub classifier: Arc<Classifier>,
    /// Active learning
    pub active_learning: Arc<ActiveLearning>,
    /// Quality engine
    pub quality: Arc<QualityEngine>,
    /// Outlier detector
    pub outliers: Arc<OutlierDetector>,
    /// Degradation monitor
    pub quality_monitor: Arc<QualityMonitor>,
    /// Knowledge graph
    pub graph: Arc<KnowledgeGraph>,
    /// Citation subgraph
    pub citations: Arc<CitationGraph>,
    /// Recommendations
    pub recommender: Arc<Recommender>,
    /// Interaction log + profiles
    pub profiles: Arc<ProfileStore>,
    /// Hybrid search
    pub search: Arc<HybridSearchEngine>,
    /// Ingestion orchestrator
    pub ingest: Arc<IngestOrchestrator>,
    /// Lexical index
    pub lexical: Arc<LexicalIndex>,
    /// Dense index
    pub dense: Arc<DenseIndex>,
    /// Sparse index
    pub sparse: Arc<SparseIndex>,

    handlers: Arc<HandlerRegistry>,
    workers: Mutex<Option<WorkerPool>>,
}

impl Engine {
    /// Open the engine with deterministic local gateways.
    pub fn open(settings: Settings, fetcher: Arc<dyn ContentFetcher>) -> Result<Arc<Engine>> {
        let gateways = Gateways::local(&settings);
        Self::open_with(settings, fetcher, gateways)
    }

    /// Open the engine with explicit gateways.
    pub fn open_with(
        settings: Settings,
        fetcher: Arc<dyn ContentFetcher>,
        gateways: Gateways,
    ) -> Result<Arc<Engine>> {
        settings.validate()?;
        let trainer = Arc::clone(&gateways.trainer);

        let store = Arc::new(Store::open(settings.database_path.clone())?);
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(TaskQueue::new(Arc::clone(&store), Arc::clone(&gateways.clock)));
        let cache = Arc::new(TtlCache::new(
            settings.cache_capacity,
            settings.cache_ttls.clone(),
            Arc::clone(&gateways.clock),
        ));

        let kernel = Arc::new(Kernel {
            store: Arc::clone(&store),
            bus: Arc::clone(&bus),
            queue: Arc::clone(&queue),
            cache,
            clock: gateways.clock,
            embedder: gateways.embedder,
            sparse_encoder: gateways.sparse_encoder,
            reranker: gateways.reranker,
            settings,
        });

        let resources = Arc::new(ResourceStore::new(Arc::clone(&kernel)));
        let annotations = Arc::new(AnnotationStore::new(Arc::clone(&kernel)));
        let collections = Arc::new(CollectionStore::new(Arc::clone(&kernel)));
        let taxonomy = Arc::new(TaxonomyStore::new(Arc::clone(&kernel)));
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&kernel),
            Arc::new(KeywordClassifier::default()),
        ));
        let active_learning = Arc::new(ActiveLearning::new(
            Arc::clone(&kernel),
            Arc::clone(&classifier),
        ));
        let quality = Arc::new(QualityEngine::new(Arc::clone(&kernel)));
        let outliers = Arc::new(OutlierDetector::new(Arc::clone(&kernel)));
        let quality_monitor = Arc::new(QualityMonitor::new(Arc::clone(&kernel)));

        let lexical = Arc::new(LexicalIndex::new(Arc::clone(&store)));
        let dense = Arc::new(DenseIndex::new(kernel.settings.embedding_dimensions));
        let sparse = Arc::new(SparseIndex::new());

        // Warm the in-memory indices from the store
        dense.warm(store.with_read(crate::resource::all_dense)?);
        sparse.warm(store.with_read(crate::resource::all_sparse)?);

        let graph = Arc::new(KnowledgeGraph::new(
            Arc::clone(&kernel),
            Arc::clone(&resources),
            Arc::clone(&dense),
        ));
        let citations = Arc::new(CitationGraph::new(Arc::clone(&kernel)));
        let profiles = Arc::new(ProfileStore::new(Arc::clone(&kernel)));
        let collaborative: Arc<dyn CollaborativeModel> =
            Arc::new(CooccurrenceCollaborative::new(Arc::clone(&kernel)));
        let recommender = Arc::new(Recommender::new(
            Arc::clone(&kernel),
            Arc::clone(&resources),
            Arc::clone(&dense),
            Arc::clone(&profiles),
            collaborative,
        ));
        let search = Arc::new(HybridSearchEngine::new(
            Arc::clone(&kernel),
            Arc::clone(&resources),
            Arc::clone(&lexical),
            Arc::clone(&dense),
            Arc::clone(&sparse),
        ));
        let ingest = Arc::new(IngestOrchestrator::new(
            Arc::clone(&kernel),
            Arc::clone(&resources),
            Arc::clone(&dense),
            Arc::clone(&sparse),
            fetcher,
        ));

        let handlers = Arc::new(build_handlers(&Wiring {
            kernel: Arc::clone(&kernel),
            resources: Arc::clone(&resources),
            lexical: Arc::clone(&lexical),
            dense: Arc::clone(&dense),
            sparse: Arc::clone(&sparse),
            graph: Arc::clone(&graph),
            citations: Arc::clone(&citations),
            classifier: Arc::clone(&classifier),
            active_learning: Arc::clone(&active_learning),
            taxonomy: Arc::clone(&taxonomy),
            quality: Arc::clone(&quality),
            profiles: Arc::clone(&profiles),
            ingest: Arc::clone(&ingest),
            trainer,
        }));

        wire_subscriptions(&kernel, &dense, &sparse, &profiles);

        Ok(Arc::new(Engine {
            kernel,
            resources,
            annotations,
            collections,
            taxonomy,
            classifier,
            active_learning,
            quality,
            outliers,
            quality_monitor,
            graph,
            citations,
            recommender,
            profiles,
            search,
            ingest,
            lexical,
            dense,
            sparse,
            handlers,
            workers: Mutex::new(None),
        }))
    }

    // ------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------

    /// Start the background worker pool.
    pub fn start_workers(&self) {
        let mut workers = self.workers.lock().expect("worker lock poisoned");
        if workers.is_none() {
            *workers = Some(WorkerPool::start(
                Arc::clone(&self.kernel.queue),
                Arc::clone(&self.handlers),
                self.kernel.settings.worker_count,
            ));
        }
    }

    /// Stop the worker pool, joining the threads.
    pub fn stop_workers(&self) {
        let pool = self.workers.lock().expect("worker lock poisoned").take();
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }

    /// Drain runnable tasks synchronously on the calling thread. The
    /// deterministic alternative to the worker pool for tests and
    /// single-threaded embedding; returns the number processed.
    pub fn run_pending_tasks(&self, max_steps: usize) -> Result<usize> {
        self.kernel.queue.run_until_quiet(&self.handlers, max_steps)
    }

    /// Point-in-time monitoring counters.
    pub fn monitoring(&self) -> Result<MonitoringSnapshot> {
        let (resources_total, resources_completed) = self.kernel.store.with_read(|conn| {
            let total: i64 =
                conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?;
            let completed: i64 = conn.query_row(
                "SELECT COUNT(*) FROM resources WHERE ingestion_status = ?1",
                params!["completed"],
                |row| row.get(0),
            )?;
            Ok((total as u64, completed as u64))
        })?;

        Ok(MonitoringSnapshot {
            events: self.kernel.bus.metrics(),
            tasks: self.kernel.queue.stats()?,
            cache: self.kernel.cache.stats(),
            resources_total,
            resources_completed,
            lexical_documents: self.lexical.len()? as u64,
            dense_vectors: self.dense.len() as u64,
            sparse_documents: self.sparse.len() as u64,
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let pool = self
            .workers
            .lock()
            .ok()
            .and_then(|mut workers| workers.take());
        if let Some(pool) = pool {
            pool.shutdown();
        }
    }
}

// ----------------------------------------------------------------------
// EVENT WIRING
// ----------------------------------------------------------------------

fn wire_subscriptions(
    kernel: &Arc<Kernel>,
    dense: &Arc<DenseIndex>,
    sparse: &Arc<SparseIndex>,
    profiles: &Arc<ProfileStore>,
) {
    let bus = Arc::clone(&kernel.bus);

    // Cache + index convergence on metadata updates
    {
        let kernel = Arc::clone(kernel);
        bus.subscribe(topics::RESOURCE_UPDATED, "cache-and-reindex", move |event| {
            let Some(id) = event.field("resource_id") else {
                return;
            };
            kernel
                .cache
                .invalidate_pattern(&format!("resource:{id}:*"));
            kernel.cache.invalidate_pattern("search_query:*");

            let content_changed = event
                .payload
                .get("content_changed")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if content_changed {
                let _ = kernel.queue.enqueue(TaskRequest::lexical_update_index(id));
                let _ = kernel.queue.enqueue(TaskRequest::embedding_regenerate(id));
                let _ = kernel.queue.enqueue(TaskRequest::graph_update_edges(id));
            }
        });
    }

    // Archive content changed: caches are stale
    {
        let kernel = Arc::clone(kernel);
        bus.subscribe(
            topics::RESOURCE_CONTENT_CHANGED,
            "cache-invalidate",
            move |event| {
                if let Some(id) = event.field("resource_id") {
                    kernel
                        .cache
                        .invalidate_pattern(&format!("resource:{id}:*"));
                    kernel.cache.invalidate_pattern("search_query:*");
                }
            },
        );
    }

    // Deletion: drop in-memory index entries synchronously, converge the
    // lexical index through the urgent queue, clear caches.
    {
        let kernel = Arc::clone(kernel);
        let dense = Arc::clone(dense);
        let sparse = Arc::clone(sparse);
        bus.subscribe(topics::RESOURCE_DELETED, "index-removal", move |event| {
            let Some(id) = event.field("resource_id") else {
                return;
            };
            dense.remove(id);
            sparse.remove(id);
            kernel
                .cache
                .invalidate_pattern(&format!("resource:{id}:*"));
            kernel.cache.invalidate_pattern("search_query:*");
            kernel.cache.invalidate_pattern("graph:*");
            let _ = kernel.queue.enqueue(TaskRequest::lexical_update_index(id));
        });
    }

    // Classification landed: classification caches are stale
    {
        let kernel = Arc::clone(kernel);
        bus.subscribe(
            topics::RESOURCE_CLASSIFIED,
            "classification-cache",
            move |event| {
                if let Some(id) = event.field("resource_id") {
                    kernel
                        .cache
                        .invalidate_pattern(&format!("classification:{id}*"));
                }
            },
        );
    }

    // Quality landed: quality + resource caches are stale
    {
        let kernel = Arc::clone(kernel);
        bus.subscribe(
            topics::RESOURCE_QUALITY_COMPUTED,
            "quality-cache",
            move |event| {
                if let Some(id) = event.field("resource_id") {
                    kernel.cache.invalidate_pattern(&format!("quality:{id}*"));
                    kernel
                        .cache
                        .invalidate_pattern(&format!("resource:{id}:*"));
                }
            },
        );
    }

    // Annotations feed the interaction log and invalidate user caches
    {
        let kernel = Arc::clone(kernel);
        let profiles = Arc::clone(profiles);
        bus.subscribe(
            topics::ANNOTATION_CREATED,
            "interaction-logger",
            move |event| {
                let (Some(user), Some(resource_id)) =
                    (event.field("user_id"), event.field("resource_id"))
                else {
                    return;
                };
                kernel.cache.invalidate_pattern(&format!("user:{user}:*"));
                if let Err(e) = profiles.record_interaction(
                    user,
                    resource_id,
                    InteractionKind::Annotation,
                    0.8,
                ) {
                    tracing::warn!(error = %e, "failed to log annotation interaction");
                }
            },
        );
    }
}

// ----------------------------------------------------------------------
// TASK HANDLERS
// ----------------------------------------------------------------------

struct Wiring {
    kernel: Arc<Kernel>,
    resources: Arc<ResourceStore>,
    lexical: Arc<LexicalIndex>,
    dense: Arc<DenseIndex>,
    sparse: Arc<SparseIndex>,
    graph: Arc<KnowledgeGraph>,
    citations: Arc<CitationGraph>,
    classifier: Arc<Classifier>,
    active_learning: Arc<ActiveLearning>,
    taxonomy: Arc<TaxonomyStore>,
    quality: Arc<QualityEngine>,
    profiles: Arc<ProfileStore>,
    ingest: Arc<IngestOrchestrator>,
    trainer: Arc<dyn Trainer>,
}

fn build_handlers(wiring: &Wiring) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    // ingest.process
    {
        let ingest = Arc::clone(&wiring.ingest);
        handlers.register(
            kinds::INGEST_PROCESS,
            Arc::new(move |task: &Task| {
                let (Some(id), Some(url)) = (task.field("resource_id"), task.field("url")) else {
                    return Err(CoreError::Validation("malformed ingest payload".to_string()));
                };
                ingest.process(id, url, task.attempts >= task.max_attempts)
            }),
        );
    }

    // lexical.update_index: converge the FTS document with the store
    {
        let resources = Arc::clone(&wiring.resources);
        let lexical = Arc::clone(&wiring.lexical);
        handlers.register(
            kinds::LEXICAL_UPDATE_INDEX,
            Arc::new(move |task: &Task| {
                let Some(id) = task.field("resource_id") else {
                    return Err(CoreError::Validation("missing resource_id".to_string()));
                };
                match resources.get(id) {
                    Ok(resource) => {
                        let body = resources.archive(id)?.unwrap_or_default();
                        lexical.upsert(
                            id,
                            &LexicalDocument {
                                title: resource.title,
                                description: resource.description,
                                body,
                            },
                        )
                    }
                    Err(CoreError::NotFound(_)) => lexical.delete(id),
                    Err(e) => Err(e),
                }
            }),
        );
    }

    // embedding.regenerate: dense + sparse vectors and index entries
    {
        let kernel = Arc::clone(&wiring.kernel);
        let resources = Arc::clone(&wiring.resources);
        let dense = Arc::clone(&wiring.dense);
        let sparse = Arc::clone(&wiring.sparse);
        handlers.register(
            kinds::EMBEDDING_REGENERATE,
            Arc::new(move |task: &Task| {
                let Some(id) = task.field("resource_id") else {
                    return Err(CoreError::Validation("missing resource_id".to_string()));
                };
                let resource = match resources.get(id) {
                    Ok(resource) => resource,
                    Err(CoreError::NotFound(_)) => return Ok(()),
                    Err(e) => return Err(e),
                };
                let body = resources.archive(id)?.unwrap_or_default();
                let prefix: String = body.chars().take(2000).collect();
                let text = format!("{}\n{}\n{prefix}", resource.title, resource.description);
                let deadline = Deadline::from_millis(10_000);

                let dense_vector = kernel
                    .embedder
                    .embed(&[text.as_str()], deadline)
                    .map_err(|e| CoreError::from_gateway("embedding", e))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| {
                        CoreError::Internal("embedder returned no vector".to_string())
                    })?;
                let sparse_vector = kernel
                    .sparse_encoder
                    .encode(&text, deadline)
                    .map_err(|e| CoreError::from_gateway("sparse_encoder", e))?;

                let embed_model = kernel.embedder.model_version().to_string();
                let sparse_model = kernel.sparse_encoder.model_version().to_string();
                resources.save_dense_vector(id, &dense_vector, &embed_model)?;
                resources.save_sparse_vector(id, &sparse_vector, &sparse_model)?;
                dense.upsert(id, dense_vector)?;
                sparse.upsert(id, sparse_vector, &sparse_model);
                kernel.cache.invalidate_pattern(&format!("embedding:{id}*"));
                Ok(())
            }),
        );
    }

    // quality.recompute
    {
        let quality = Arc::clone(&wiring.quality);
        handlers.register(
            kinds::QUALITY_RECOMPUTE,
            Arc::new(move |task: &Task| {
                let Some(id) = task.field("resource_id") else {
                    return Err(CoreError::Validation("missing resource_id".to_string()));
                };
                match quality.compute_quality(id, None) {
                    Ok(_) => Ok(()),
                    Err(CoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }),
        );
    }

    // graph.update_edges: the edge list is derived lazily, refreshing means
    // dropping the cached neighborhood
    {
        let graph = Arc::clone(&wiring.graph);
        handlers.register(
            kinds::GRAPH_UPDATE_EDGES,
            Arc::new(move |task: &Task| {
                if let Some(id) = task.field("resource_id") {
                    graph.invalidate_neighbors(id);
                }
                Ok(())
            }),
        );
    }

    // citation.extract → resolve follows
    {
        let kernel = Arc::clone(&wiring.kernel);
        let citations = Arc::clone(&wiring.citations);
        handlers.register(
            kinds::CITATION_EXTRACT,
            Arc::new(move |task: &Task| {
                let Some(id) = task.field("resource_id") else {
                    return Err(CoreError::Validation("missing resource_id".to_string()));
                };
                match citations.extract(id) {
                    Ok(_) => {
                        kernel.queue.enqueue(TaskRequest::citation_resolve())?;
                        Ok(())
                    }
                    Err(CoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }),
        );
    }

    // citation.resolve
    {
        let citations = Arc::clone(&wiring.citations);
        handlers.register(
            kinds::CITATION_RESOLVE,
            Arc::new(move |_task: &Task| {
                citations.resolve()?;
                Ok(())
            }),
        );
    }

    // citation.pagerank
    {
        let citations = Arc::clone(&wiring.citations);
        handlers.register(
            kinds::CITATION_PAGERANK,
            Arc::new(move |_task: &Task| {
                citations.compute_importance()?;
                Ok(())
            }),
        );
    }

    // classify.resource
    {
        let classifier = Arc::clone(&wiring.classifier);
        let taxonomy = Arc::clone(&wiring.taxonomy);
        handlers.register(
            kinds::CLASSIFY_RESOURCE,
            Arc::new(move |task: &Task| {
                let Some(id) = task.field("resource_id") else {
                    return Err(CoreError::Validation("missing resource_id".to_string()));
                };
                let labels = taxonomy.labels()?;
                if labels.is_empty() {
                    return Ok(());
                }
                match classifier.classify_resource(id, &labels, 5) {
                    Ok(_) => Ok(()),
                    Err(CoreError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }),
        );
    }

    // cache.invalidate
    {
        let kernel = Arc::clone(&wiring.kernel);
        handlers.register(
            kinds::CACHE_INVALIDATE,
            Arc::new(move |task: &Task| {
                let Some(pattern) = task.field("pattern") else {
                    return Err(CoreError::Validation("missing pattern".to_string()));
                };
                kernel.cache.invalidate_pattern(pattern);
                Ok(())
            }),
        );
    }

    // recommendation.refresh_profile
    {
        let profiles = Arc::clone(&wiring.profiles);
        handlers.register(
            kinds::RECOMMENDATION_REFRESH_PROFILE,
            Arc::new(move |task: &Task| {
                let Some(user) = task.field("user_id") else {
                    return Err(CoreError::Validation("missing user_id".to_string()));
                };
                profiles.refresh_profile(user)?;
                Ok(())
            }),
        );
    }

    // classifier.retrain
    {
        let active_learning = Arc::clone(&wiring.active_learning);
        let trainer = Arc::clone(&wiring.trainer);
        handlers.register(
            kinds::CLASSIFIER_RETRAIN,
            Arc::new(move |_task: &Task| {
                active_learning.retrain(trainer.as_ref())?;
                Ok(())
            }),
        );
    }

    handlers
}
