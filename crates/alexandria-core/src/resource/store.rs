//! Resource Store
//!
//! Row-level helpers (transaction-scoped, shared with the ingestion
//! orchestrator and task handlers) plus the public service over the kernel.
//! Deletion cascades through foreign keys (archives, vectors, annotations,
//! collection membership, assignments; citations keep their row but lose the
//! resolved target) and the post-commit events fan the cleanup out to the
//! in-memory indices and the graph.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kernel::bus::{topics, Event};
use crate::kernel::gateway::SparseVector;
use crate::kernel::{Kernel, TaskRequest};
use crate::storage::{format_ts, parse_ts};
use crate::vector::l2_norm;

use super::{
    IngestionStatus, QualityDimensions, ReadStatus, Resource, ResourceFilters, ResourceOverrides,
    ResourceUpdate, SortDir, SortField,
};

// ============================================================================
// BLOB ENCODING
// ============================================================================

/// Encode a dense vector as a little-endian f32 blob.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn opt_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    Ok(raw.and_then(|s| parse_ts(&s).ok()))
}

pub(crate) fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    let subjects: String = row.get("subjects")?;
    let status: String = row.get("ingestion_status")?;
    let read_status: String = row.get("read_status")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;

    let quality_overall: Option<f64> = row.get("quality_overall")?;
    let quality = match quality_overall {
        Some(_) => Some(QualityDimensions {
            accuracy: row.get::<_, Option<f64>>("quality_accuracy")?.unwrap_or(0.0),
            completeness: row
                .get::<_, Option<f64>>("quality_completeness")?
                .unwrap_or(0.0),
            consistency: row
                .get::<_, Option<f64>>("quality_consistency")?
                .unwrap_or(0.0),
            timeliness: row
                .get::<_, Option<f64>>("quality_timeliness")?
                .unwrap_or(0.0),
            relevance: row.get::<_, Option<f64>>("quality_relevance")?.unwrap_or(0.0),
        }),
        None => None,
    };

    Ok(Resource {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        creator: row.get("creator")?,
        publisher: row.get("publisher")?,
        source_url: row.get("source_url")?,
        normalized_url: row.get("normalized_url")?,
        language: row.get("language")?,
        resource_type: row.get("resource_type")?,
        subjects: serde_json::from_str(&subjects).unwrap_or_default(),
        classification_code: row.get("classification_code")?,
        identifier: row.get("identifier")?,
        read_status: ReadStatus::parse(&read_status),
        ingestion_status: IngestionStatus::parse(&status),
        ingestion_error: row.get("ingestion_error")?,
        quality,
        quality_overall,
        needs_quality_review: row.get::<_, i64>("needs_quality_review")? != 0,
        needs_classification_review: row.get::<_, i64>("needs_classification_review")? != 0,
        embedding_model: row.get("embedding_model")?,
        sparse_model: row.get("sparse_model")?,
        classifier_model: row.get("classifier_model")?,
        published_at: opt_ts(row, "published_at")?,
        created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_ts(&updated).unwrap_or_else(|_| Utc::now()),
        ingestion_started_at: opt_ts(row, "ingestion_started_at")?,
        ingestion_completed_at: opt_ts(row, "ingestion_completed_at")?,
    })
}

// ============================================================================
// TRANSACTION-SCOPED HELPERS
// ============================================================================

/// Insert a fresh pending resource row.
pub(crate) fn insert_pending(tx: &Transaction<'_>, resource: &Resource) -> Result<()> {
    tx.execute(
        "INSERT INTO resources (id, title, description, creator, publisher, source_url,
                                normalized_url, language, resource_type, subjects,
                                identifier, read_status, ingestion_status, published_at,
                                created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
        params![
            resource.id,
            resource.title,
            resource.description,
            resource.creator,
            resource.publisher,
            resource.source_url,
            resource.normalized_url,
            resource.language,
            resource.resource_type,
            serde_json::to_string(&resource.subjects)?,
            resource.identifier,
            resource.read_status.as_str(),
            resource.ingestion_status.as_str(),
            resource.published_at.map(format_ts),
            format_ts(resource.created_at),
        ],
    )?;
    Ok(())
}

/// Read a resource inside a connection (reader or transaction).
pub(crate) fn read_resource(conn: &Connection, id: &str) -> Result<Option<Resource>> {
    Ok(conn
        .query_row(
            "SELECT * FROM resources WHERE id = ?1",
            params![id],
            resource_from_row,
        )
        .optional()?)
}

/// Enforce the lifecycle and move a resource to `next`. Timestamps for
/// processing/terminal states are maintained here.
pub(crate) fn transition_status(
    tx: &Transaction<'_>,
    id: &str,
    next: IngestionStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let current = read_resource(tx, id)?
        .ok_or_else(|| CoreError::NotFound(format!("resource {id}")))?
        .ingestion_status;

    if !current.can_transition_to(next) {
        return Err(CoreError::Conflict(format!(
            "ingestion status cannot move {current:?} -> {next:?} for resource {id}"
        )));
    }

    match next {
        IngestionStatus::Processing => {
            tx.execute(
                "UPDATE resources SET ingestion_status = ?2, ingestion_started_at = ?3,
                                      updated_at = ?3 WHERE id = ?1",
                params![id, next.as_str(), format_ts(now)],
            )?;
        }
        IngestionStatus::Completed => {
            tx.execute(
                "UPDATE resources SET ingestion_status = ?2, ingestion_completed_at = ?3,
                                      ingestion_error = NULL, updated_at = ?3 WHERE id = ?1",
                params![id, next.as_str(), format_ts(now)],
            )?;
        }
        IngestionStatus::Failed => {
            tx.execute(
                "UPDATE resources SET ingestion_status = ?2, ingestion_error = ?3,
                                      ingestion_completed_at = ?4, updated_at = ?4 WHERE id = ?1",
                params![id, next.as_str(), error.unwrap_or("unknown failure"), format_ts(now)],
            )?;
        }
        IngestionStatus::Pending => {
            return Err(CoreError::Conflict(
                "resources never return to pending".to_string(),
            ));
        }
    }
    Ok(())
}

/// Store (or replace) the archived plain text.
pub(crate) fn store_archive(
    tx: &Transaction<'_>,
    id: &str,
    content: &str,
    content_type: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO archives (resource_id, content, content_type, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(resource_id) DO UPDATE SET content = ?2, content_type = ?3, created_at = ?4",
        params![id, content, content_type, format_ts(now)],
    )?;
    Ok(())
}

/// Read the archived text and its content type.
pub(crate) fn read_archive(conn: &Connection, id: &str) -> Result<Option<(String, String)>> {
    Ok(conn
        .query_row(
            "SELECT content, content_type FROM archives WHERE resource_id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Store the dense vector sidecar and stamp the model version. The vector
/// must be unit-norm within 1e-6.
pub(crate) fn store_dense(
    tx: &Transaction<'_>,
    id: &str,
    vector: &[f32],
    model: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let norm = l2_norm(vector);
    if (norm - 1.0).abs() > 1e-6 {
        return Err(CoreError::Internal(format!(
            "dense vector for {id} is not unit-norm (|v| = {norm})"
        )));
    }
    tx.execute(
        "INSERT INTO dense_vectors (resource_id, vector, dimensions, model, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(resource_id) DO UPDATE SET vector = ?2, dimensions = ?3, model = ?4,
                                                created_at = ?5",
        params![id, vec_to_blob(vector), vector.len() as i64, model, format_ts(now)],
    )?;
    tx.execute(
        "UPDATE resources SET embedding_model = ?2 WHERE id = ?1",
        params![id, model],
    )?;
    Ok(())
}

/// Read the dense vector sidecar.
pub(crate) fn read_dense(conn: &Connection, id: &str) -> Result<Option<(Vec<f32>, String)>> {
    Ok(conn
        .query_row(
            "SELECT vector, model FROM dense_vectors WHERE resource_id = ?1",
            params![id],
            |row| {
                let blob: Vec<u8> = row.get(0)?;
                let model: String = row.get(1)?;
                Ok((blob_to_vec(&blob), model))
            },
        )
        .optional()?)
}

/// All dense vectors, for index warm-up.
pub(crate) fn all_dense(conn: &Connection) -> Result<Vec<(String, Vec<f32>)>> {
    let mut stmt = conn.prepare("SELECT resource_id, vector FROM dense_vectors")?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        Ok((id, blob_to_vec(&blob)))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Store the sparse vector sidecar and stamp the model version.
pub(crate) fn store_sparse(
    tx: &Transaction<'_>,
    id: &str,
    sparse: &SparseVector,
    model: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO sparse_vectors (resource_id, weights, model, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(resource_id) DO UPDATE SET weights = ?2, model = ?3, created_at = ?4",
        params![id, serde_json::to_string(sparse)?, model, format_ts(now)],
    )?;
    tx.execute(
        "UPDATE resources SET sparse_model = ?2 WHERE id = ?1",
        params![id, model],
    )?;
    Ok(())
}

/// All sparse vectors with model tags, for index warm-up.
pub(crate) fn all_sparse(conn: &Connection) -> Result<Vec<(String, SparseVector, String)>> {
    let mut stmt = conn.prepare("SELECT resource_id, weights, model FROM sparse_vectors")?;
    let rows = stmt.query_map([], |row| {
        let id: String = row.get(0)?;
        let weights: String = row.get(1)?;
        let model: String = row.get(2)?;
        Ok((id, weights, model))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, weights, model) = row?;
        let sparse: SparseVector = serde_json::from_str(&weights).unwrap_or_default();
        out.push((id, sparse, model));
    }
    Ok(out)
}

// ============================================================================
// SERVICE
// ============================================================================

/// Ingestion-status view returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStatusView {
    /// Resource id
    pub id: String,
    /// Lifecycle state
    pub ingestion_status: IngestionStatus,
    /// Terminal error, when failed
    pub ingestion_error: Option<String>,
    /// Pipeline start time
    pub started_at: Option<DateTime<Utc>>,
    /// Pipeline finish time
    pub completed_at: Option<DateTime<Utc>>,
}

/// The resource store service.
pub struct ResourceStore {
    kernel: Arc<Kernel>,
}

impl ResourceStore {
    /// Create the service over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Create a pending resource for a validated URL, applying overrides.
    /// Emits `resource.created` and enqueues the ingestion pipeline task.
    pub fn create_pending(&self, url: &str, overrides: &ResourceOverrides) -> Result<Resource> {
        super::validate_url(url)?;
        let now = self.kernel.now();
        let resource = Resource {
            id: Uuid::new_v4().to_string(),
            title: overrides.title.clone().unwrap_or_default(),
            description: overrides.description.clone().unwrap_or_default(),
            creator: overrides.creator.clone(),
            publisher: overrides.publisher.clone(),
            source_url: url.to_string(),
            normalized_url: super::normalize_url(url),
            language: overrides.language.clone(),
            resource_type: overrides.resource_type.clone(),
            subjects: overrides.subjects.clone(),
            classification_code: None,
            identifier: overrides.identifier.clone(),
            read_status: ReadStatus::Unread,
            ingestion_status: IngestionStatus::Pending,
            ingestion_error: None,
            quality: None,
            quality_overall: None,
            needs_quality_review: false,
            needs_classification_review: false,
            embedding_model: None,
            sparse_model: None,
            classifier_model: None,
            published_at: overrides.published_at,
            created_at: now,
            updated_at: now,
            ingestion_started_at: None,
            ingestion_completed_at: None,
        };

        let stored = resource.clone();
        self.kernel.commit(move |tx, fx| {
            insert_pending(tx, &stored)?;
            fx.emit(Event::for_resource(topics::RESOURCE_CREATED, &stored.id));
            fx.enqueue(TaskRequest::ingest_process(&stored.id, &stored.source_url));
            Ok(())
        })?;
        Ok(resource)
    }

    /// Fetch a resource or fail with NotFound.
    pub fn get(&self, id: &str) -> Result<Resource> {
        self.kernel
            .store
            .with_read(|conn| read_resource(conn, id))?
            .ok_or_else(|| CoreError::NotFound(format!("resource {id}")))
    }

    /// Fetch many resources; missing ids are silently skipped.
    pub fn get_many(&self, ids: &[String]) -> Result<Vec<Resource>> {
        self.kernel.store.with_read(|conn| {
            let mut out = Vec::with_capacity(ids.len());
            let mut stmt = conn.prepare("SELECT * FROM resources WHERE id = ?1")?;
            for id in ids {
                if let Some(resource) = stmt
                    .query_row(params![id], resource_from_row)
                    .optional()?
                {
                    out.push(resource);
                }
            }
            Ok(out)
        })
    }

    /// Ingestion-status view for the async contract.
    pub fn status(&self, id: &str) -> Result<IngestionStatusView> {
        let resource = self.get(id)?;
        Ok(IngestionStatusView {
            id: resource.id,
            ingestion_status: resource.ingestion_status,
            ingestion_error: resource.ingestion_error,
            started_at: resource.ingestion_started_at,
            completed_at: resource.ingestion_completed_at,
        })
    }

    /// The archived plain text for a resource, when present.
    pub fn archive(&self, id: &str) -> Result<Option<String>> {
        self.kernel
            .store
            .with_read(|conn| read_archive(conn, id))
            .map(|found| found.map(|(content, _)| content))
    }

    /// Dense vector sidecar, when present.
    pub fn dense_vector(&self, id: &str) -> Result<Option<Vec<f32>>> {
        self.kernel
            .store
            .with_read(|conn| read_dense(conn, id))
            .map(|found| found.map(|(vector, _)| vector))
    }

    /// Partial update. Emits `resource.updated` with a `content_changed`
    /// flag so the runtime can reindex and re-embed when the lexical
    /// document actually changed.
    pub fn update(&self, id: &str, update: &ResourceUpdate) -> Result<Resource> {
        let now = self.kernel.now();
        let content_changed = update.changes_content();
        let update = update.clone();
        let id_owned = id.to_string();

        let resource = self.kernel.commit(move |tx, fx| {
            let mut resource = read_resource(tx, &id_owned)?
                .ok_or_else(|| CoreError::NotFound(format!("resource {id_owned}")))?;

            if let Some(title) = update.title {
                resource.title = title;
            }
            if let Some(description) = update.description {
                resource.description = description;
            }
            if let Some(creator) = update.creator {
                resource.creator = Some(creator);
            }
            if let Some(publisher) = update.publisher {
                resource.publisher = Some(publisher);
            }
            if let Some(language) = update.language {
                resource.language = Some(language);
            }
            if let Some(resource_type) = update.resource_type {
                resource.resource_type = Some(resource_type);
            }
            if let Some(subjects) = update.subjects {
                resource.subjects = subjects;
            }
            if let Some(code) = update.classification_code {
                resource.classification_code = Some(code);
            }
            if let Some(read_status) = update.read_status {
                resource.read_status = read_status;
            }
            if let Some(published_at) = update.published_at {
                resource.published_at = Some(published_at);
            }
            resource.updated_at = now;

            tx.execute(
                "UPDATE resources SET title = ?2, description = ?3, creator = ?4,
                        publisher = ?5, language = ?6, resource_type = ?7, subjects = ?8,
                        classification_code = ?9, read_status = ?10, published_at = ?11,
                        updated_at = ?12
                 WHERE id = ?1",
                params![
                    resource.id,
                    resource.title,
                    resource.description,
                    resource.creator,
                    resource.publisher,
                    resource.language,
                    resource.resource_type,
                    serde_json::to_string(&resource.subjects)?,
                    resource.classification_code,
                    resource.read_status.as_str(),
                    resource.published_at.map(format_ts),
                    format_ts(now),
                ],
            )?;

            fx.emit(Event::new(
                topics::RESOURCE_UPDATED,
                serde_json::json!({
                    "resource_id": resource.id,
                    "content_changed": content_changed,
                }),
            ));
            Ok(resource)
        })?;
        Ok(resource)
    }

    /// Delete a resource. Foreign keys cascade the row-level cleanup;
    /// aggregate embeddings of affected collections are recomputed in the
    /// same transaction; post-commit events fan out to the indices and graph.
    pub fn delete(&self, id: &str) -> Result<()> {
        let id_owned = id.to_string();
        self.kernel.commit(move |tx, fx| {
            if read_resource(tx, &id_owned)?.is_none() {
                return Err(CoreError::NotFound(format!("resource {id_owned}")));
            }

            let mut affected_collections: Vec<String> = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT collection_id FROM collection_members WHERE resource_id = ?1",
                )?;
                let rows = stmt.query_map(params![id_owned], |row| row.get::<_, String>(0))?;
                for row in rows {
                    affected_collections.push(row?);
                }
            }

            tx.execute("DELETE FROM resources WHERE id = ?1", params![id_owned])?;
            tx.execute("DELETE FROM lexical_fts WHERE resource_id = ?1", params![id_owned])?;

            for collection_id in &affected_collections {
                crate::collection::recompute_aggregate(tx, collection_id)?;
                fx.emit(Event::new(
                    topics::COLLECTION_UPDATED,
                    serde_json::json!({ "collection_id": collection_id }),
                ));
            }

            fx.emit(Event::for_resource(topics::RESOURCE_DELETED, &id_owned));
            Ok(())
        })
    }

    /// Store a freshly generated dense vector (validated unit-norm).
    pub fn save_dense_vector(&self, id: &str, vector: &[f32], model: &str) -> Result<()> {
        let now = self.kernel.now();
        let id = id.to_string();
        let model = model.to_string();
        let vector = vector.to_vec();
        self.kernel.commit(move |tx, _fx| {
            store_dense(tx, &id, &vector, &model, now)
        })
    }

    /// Store a freshly generated sparse vector.
    pub fn save_sparse_vector(&self, id: &str, sparse: &SparseVector, model: &str) -> Result<()> {
        let now = self.kernel.now();
        let id = id.to_string();
        let model = model.to_string();
        let sparse = sparse.clone();
        self.kernel.commit(move |tx, _fx| {
            store_sparse(tx, &id, &sparse, &model, now)
        })
    }

    /// List resources with filters, pagination, and whitelisted sorting.
    /// Returns the page and the filtered total.
    pub fn list(
        &self,
        filters: &ResourceFilters,
        limit: usize,
        offset: usize,
        sort_by: SortField,
        sort_dir: SortDir,
    ) -> Result<(Vec<Resource>, u64)> {
        let limit = limit.clamp(1, 100);
        let (where_clause, params) = filters.to_sql();
        let order = format!("ORDER BY {} {}", sort_by.column(), sort_dir.keyword());

        self.kernel.store.with_read(|conn| {
            if filters.has_subject_filters() {
                // Subject terms live in a JSON column; pull the scalar-filtered
                // set and finish in memory.
                let sql = format!("SELECT * FROM resources {where_clause} {order}");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(params.iter()),
                    resource_from_row,
                )?;
                let mut matching = Vec::new();
                for row in rows {
                    let resource = row?;
                    if filters.matches(&resource) {
                        matching.push(resource);
                    }
                }
                let total = matching.len() as u64;
                let page = matching.into_iter().skip(offset).take(limit).collect();
                Ok((page, total))
            } else {
                let count_sql = format!("SELECT COUNT(*) FROM resources {where_clause}");
                let total: u64 = conn.query_row(
                    &count_sql,
                    rusqlite::params_from_iter(params.iter()),
                    |row| row.get::<_, i64>(0).map(|n| n as u64),
                )?;

                let sql = format!(
                    "SELECT * FROM resources {where_clause} {order} LIMIT {limit} OFFSET {offset}"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params_from_iter(params.iter()),
                    resource_from_row,
                )?;
                let mut page = Vec::new();
                for row in rows {
                    page.push(row?);
                }
                Ok((page, total))
            }
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let vector = vec![0.25f32, -1.5, 3.75, 0.0];
        let blob = vec_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vec(&blob), vector);
    }

    #[test]
    fn test_blob_ignores_trailing_garbage() {
        let mut blob = vec_to_blob(&[1.0f32]);
        blob.push(0xFF);
        assert_eq!(blob_to_vec(&blob), vec![1.0f32]);
    }
}
