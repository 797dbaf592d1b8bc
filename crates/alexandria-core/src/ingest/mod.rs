//! Ingestion Orchestrator
//!
//! `ingest(url, overrides)` creates a pending resource and returns its id
//! immediately; the pipeline runs as a queued task: fetch → extract →
//! archive → embed → complete, emitting `resource.created`,
//! `resource.content_changed`, and `ingestion.completed`/`failed` in causal
//! order, and enqueuing the downstream enrichment tasks (classification,
//! quality, citations, lexical index, graph edges).
//!
//! Transient fetch/model failures ride the queue's exponential backoff;
//! once the retry budget is spent (or the failure is permanent) the
//! resource is marked failed with the error recorded. The pipeline is
//! idempotent: re-delivery after success is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, GatewayError, Result};
use crate::index::{DenseIndex, SparseIndex};
use crate::kernel::bus::{topics, Event};
use crate::kernel::{Deadline, Kernel, TaskRequest};
use crate::resource::{IngestionStatus, Resource, ResourceOverrides, ResourceStore};
use crate::storage::format_ts;

/// Fetch budget per attempt, milliseconds.
const FETCH_BUDGET_MS: u64 = 10_000;
/// Archive prefix used for embeddings, characters.
const EMBED_PREFIX_CHARS: usize = 2000;

/// Content type of a fetched document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Extracted from HTML
    Html,
    /// Extracted from PDF
    Pdf,
    /// Markdown source
    Markdown,
    /// Plain text
    #[default]
    Text,
}

impl ContentKind {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Html => "html",
            ContentKind::Pdf => "pdf",
            ContentKind::Markdown => "markdown",
            ContentKind::Text => "text",
        }
    }
}

/// A fetched, text-extracted document. Fetching and extraction mechanics
/// live outside the engine; this is the declared boundary shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchedDocument {
    /// URL after redirects
    pub final_url: String,
    /// Source content type
    pub content_kind: ContentKind,
    /// Extracted title, when the source declares one
    pub title: Option<String>,
    /// Extracted description/abstract
    pub description: Option<String>,
    /// Extracted plain text
    pub text: String,
    /// Declared language
    pub language: Option<String>,
    /// Named authors
    pub creator: Option<String>,
    /// Publishing entity
    pub publisher: Option<String>,
    /// Academic identifier (DOI, arXiv id)
    pub identifier: Option<String>,
    /// Publication date
    pub published_at: Option<DateTime<Utc>>,
}

/// The fetch boundary.
pub trait ContentFetcher: Send + Sync {
    /// Fetch and extract a URL within the deadline.
    fn fetch(&self, url: &str, deadline: Deadline)
        -> std::result::Result<FetchedDocument, GatewayError>;
}

/// Canned-document fetcher for tests and offline development.
#[derive(Default)]
pub struct StaticFetcher {
    documents: Mutex<HashMap<String, FetchedDocument>>,
}

impl StaticFetcher {
    /// Empty fetcher; every fetch fails until documents are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the document served for a URL.
    pub fn register(&self, url: &str, document: FetchedDocument) {
        self.documents
            .lock()
            .expect("fetcher lock poisoned")
            .insert(url.to_string(), document);
    }
}

impl ContentFetcher for StaticFetcher {
    fn fetch(
        &self,
        url: &str,
        _deadline: Deadline,
    ) -> std::result::Result<FetchedDocument, GatewayError> {
        self.documents
            .lock()
            .expect("fetcher lock poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| GatewayError::permanent(format!("no document registered for {url}")))
    }
}

/// The ingestion orchestrator.
pub struct IngestOrchestrator {
    kernel: Arc<Kernel>,
    resources: Arc<ResourceStore>,
    dense: Arc<DenseIndex>,
    sparse: Arc<SparseIndex>,
    fetcher: Arc<dyn ContentFetcher>,
}

impl IngestOrchestrator {
    /// Wire the orchestrator.
    pub fn new(
        kernel: Arc<Kernel>,
        resources: Arc<ResourceStore>,
        dense: Arc<DenseIndex>,
        sparse: Arc<SparseIndex>,
        fetcher: Arc<dyn ContentFetcher>,
    ) -> Self {
        Self {
            kernel,
            resources,
            dense,
            sparse,
            fetcher,
        }
    }

    /// Accept a URL for ingestion. The resource row exists (status pending)
    /// when this returns; processing is asynchronous.
    pub fn ingest(&self, url: &str, overrides: &ResourceOverrides) -> Result<Resource> {
        self.resources.create_pending(url, overrides)
    }

    /// The `ingest.process` task body. `final_attempt` controls whether a
    /// transient failure propagates for retry or terminally fails the
    /// resource.
    pub fn process(&self, resource_id: &str, url: &str, final_attempt: bool) -> Result<()> {
        let resource = match self.resources.get(resource_id) {
            Ok(resource) => resource,
            // Deleted while queued: nothing to do
            Err(CoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match resource.ingestion_status {
            IngestionStatus::Completed | IngestionStatus::Failed => return Ok(()),
            IngestionStatus::Pending => {
                let now = self.kernel.now();
                let id = resource_id.to_string();
                self.kernel.commit(move |tx, _fx| {
                    crate::resource::transition_status(
                        tx,
                        &id,
                        IngestionStatus::Processing,
                        None,
                        now,
                    )
                })?;
            }
            // Crash recovery: resume an in-flight pipeline
            IngestionStatus::Processing => {}
        }

        match self.run_pipeline(&resource, url) {
            Ok(()) => Ok(()),
            Err(e) => {
                let retry = e.is_transient() && !final_attempt;
                if retry {
                    return Err(e);
                }
                self.mark_failed(resource_id, &e.to_string())?;
                Ok(())
            }
        }
    }

    fn run_pipeline(&self, resource: &Resource, url: &str) -> Result<()> {
        let document = self
            .fetcher
            .fetch(url, Deadline::from_millis(FETCH_BUDGET_MS))
            .map_err(|e| CoreError::from_gateway("fetcher", e))?;

        let resource_id = resource.id.clone();
        let now = self.kernel.now();

        // Persist the archive and any metadata the caller left blank;
        // overrides given at ingest time always win.
        let merged_title = if resource.title.is_empty() {
            document.title.clone().unwrap_or_default()
        } else {
            resource.title.clone()
        };
        let merged_description = if resource.description.is_empty() {
            document.description.clone().unwrap_or_default()
        } else {
            resource.description.clone()
        };

        {
            let document = document.clone();
            let resource = resource.clone();
            let merged_title = merged_title.clone();
            let merged_description = merged_description.clone();
            self.kernel.commit(move |tx, fx| {
                crate::resource::store_archive(
                    tx,
                    &resource.id,
                    &document.text,
                    document.content_kind.as_str(),
                    now,
                )?;
                tx.execute(
                    "UPDATE resources SET title = ?2, description = ?3,
                            creator = COALESCE(creator, ?4),
                            publisher = COALESCE(publisher, ?5),
                            language = COALESCE(language, ?6),
                            identifier = COALESCE(identifier, ?7),
                            published_at = COALESCE(published_at, ?8),
                            updated_at = ?9
                     WHERE id = ?1",
                    rusqlite::params![
                        resource.id,
                        merged_title,
                        merged_description,
                        document.creator,
                        document.publisher,
                        document.language,
                        document.identifier,
                        document.published_at.map(format_ts),
                        format_ts(now),
                    ],
                )?;
                fx.emit(Event::for_resource(
                    topics::RESOURCE_CONTENT_CHANGED,
                    &resource.id,
                ));
                Ok(())
            })?;
        }

        // Embeddings must exist before the resource can complete
        let body_prefix: String = document.text.chars().take(EMBED_PREFIX_CHARS).collect();
        let embed_text = format!("{merged_title}\n{merged_description}\n{body_prefix}");
        let deadline = Deadline::from_millis(FETCH_BUDGET_MS);

        let dense_vector = self
            .kernel
            .embedder
            .embed(&[embed_text.as_str()], deadline)
            .map_err(|e| CoreError::from_gateway("embedding", e))?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Internal("embedder returned no vector".to_string()))?;
        let sparse_vector = self
            .kernel
            .sparse_encoder
            .encode(&embed_text, deadline)
            .map_err(|e| CoreError::from_gateway("sparse_encoder", e))?;

        let embedding_model = self.kernel.embedder.model_version().to_string();
        let sparse_model = self.kernel.sparse_encoder.model_version().to_string();
        self.resources
            .save_dense_vector(&resource_id, &dense_vector, &embedding_model)?;
        self.resources
            .save_sparse_vector(&resource_id, &sparse_vector, &sparse_model)?;
        self.dense.upsert(&resource_id, dense_vector)?;
        self.sparse.upsert(&resource_id, sparse_vector, &sparse_model);

        // Complete and fan out the enrichment tasks
        let completed_at = self.kernel.now();
        let id = resource_id.clone();
        self.kernel.commit(move |tx, fx| {
            crate::resource::transition_status(
                tx,
                &id,
                IngestionStatus::Completed,
                None,
                completed_at,
            )?;
            fx.emit(Event::for_resource(topics::INGESTION_COMPLETED, &id));
            fx.enqueue(TaskRequest::lexical_update_index(&id));
            fx.enqueue(TaskRequest::classify_resource(&id));
            fx.enqueue(TaskRequest::quality_recompute(&id));
            fx.enqueue(TaskRequest::citation_extract(&id));
            fx.enqueue(TaskRequest::graph_update_edges(&id));
            Ok(())
        })?;
        Ok(())
    }

    fn mark_failed(&self, resource_id: &str, error: &str) -> Result<()> {
        tracing::warn!(resource_id, error, "ingestion failed terminally");
        let now = self.kernel.now();
        let id = resource_id.to_string();
        let error = error.to_string();
        self.kernel.commit(move |tx, fx| {
            crate::resource::transition_status(
                tx,
                &id,
                IngestionStatus::Failed,
                Some(&error),
                now,
            )?;
            fx.emit(Event::new(
                topics::INGESTION_FAILED,
                serde_json::json!({ "resource_id": id, "error": error }),
            ));
            Ok(())
        })
    }
}
