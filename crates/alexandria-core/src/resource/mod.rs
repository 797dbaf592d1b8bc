//! Resource Aggregate
//!
//! The canonical entity: one row per ingested URL, carrying metadata, the
//! ingestion lifecycle, quality dimensions, and model-version stamps. Dense
//! and sparse vectors and the archived text live in sidecar tables owned by
//! the same store.

mod filters;
mod store;

pub use filters::{ResourceFilters, SortDir, SortField};
pub use store::{blob_to_vec, vec_to_blob, IngestionStatusView, ResourceStore};

pub(crate) use store::{
    all_dense, all_sparse, insert_pending, read_archive, read_dense, read_resource,
    resource_from_row, store_archive, store_dense, store_sparse, transition_status,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Ingestion lifecycle. Transitions only move forward:
/// pending → processing → (completed | failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionStatus {
    /// Row created, pipeline not started
    #[default]
    Pending,
    /// Pipeline running
    Processing,
    /// Fully enriched
    Completed,
    /// Pipeline failed terminally
    Failed,
}

impl IngestionStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Processing => "processing",
            IngestionStatus::Completed => "completed",
            IngestionStatus::Failed => "failed",
        }
    }

    /// Parse a column value; unknown strings read as pending.
    pub fn parse(s: &str) -> IngestionStatus {
        match s {
            "processing" => IngestionStatus::Processing,
            "completed" => IngestionStatus::Completed,
            "failed" => IngestionStatus::Failed,
            _ => IngestionStatus::Pending,
        }
    }

    /// Whether the lifecycle permits moving to `next`.
    pub fn can_transition_to(&self, next: IngestionStatus) -> bool {
        matches!(
            (self, next),
            (IngestionStatus::Pending, IngestionStatus::Processing)
                | (IngestionStatus::Processing, IngestionStatus::Completed)
                | (IngestionStatus::Processing, IngestionStatus::Failed)
                // A pending resource may fail before processing starts
                | (IngestionStatus::Pending, IngestionStatus::Failed)
        )
    }
}

/// Reading state, user-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    /// Never opened
    #[default]
    Unread,
    /// Opened, not finished
    InProgress,
    /// Finished
    Completed,
}

impl ReadStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadStatus::Unread => "unread",
            ReadStatus::InProgress => "in_progress",
            ReadStatus::Completed => "completed",
        }
    }

    /// Parse a column value; unknown strings read as unread.
    pub fn parse(s: &str) -> ReadStatus {
        match s {
            "in_progress" => ReadStatus::InProgress,
            "completed" => ReadStatus::Completed,
            _ => ReadStatus::Unread,
        }
    }
}

// ============================================================================
// QUALITY
// ============================================================================

/// The five quality dimensions, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityDimensions {
    /// Citation validity, source credibility, identifiers
    pub accuracy: f64,
    /// Metadata field coverage
    pub completeness: f64,
    /// Title/description semantic agreement
    pub consistency: f64,
    /// Publication age and ingestion recency
    pub timeliness: f64,
    /// Classification confidence and inbound citations
    pub relevance: f64,
}

impl QualityDimensions {
    /// Dimensions as an ordered feature array (outlier detector input).
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.accuracy,
            self.completeness,
            self.consistency,
            self.timeliness,
            self.relevance,
        ]
    }
}

// ============================================================================
// RESOURCE
// ============================================================================

/// The canonical resource record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Opaque id (UUID v4)
    pub id: String,
    /// Display title
    pub title: String,
    /// Short description or abstract
    pub description: String,
    /// Author(s), freeform
    pub creator: Option<String>,
    /// Publishing entity
    pub publisher: Option<String>,
    /// Origin URL as submitted
    pub source_url: String,
    /// Canonical URL used for citation resolution
    pub normalized_url: String,
    /// BCP-47-ish language tag
    pub language: Option<String>,
    /// Resource type (article, paper, dataset, ...)
    pub resource_type: Option<String>,
    /// Declared subject terms
    pub subjects: Vec<String>,
    /// Authority-controlled classification code
    pub classification_code: Option<String>,
    /// Academic identifier (DOI, arXiv id) when known
    pub identifier: Option<String>,
    /// Reading state
    pub read_status: ReadStatus,
    /// Ingestion lifecycle state
    pub ingestion_status: IngestionStatus,
    /// Terminal pipeline error, when failed
    pub ingestion_error: Option<String>,
    /// Quality dimensions, once computed
    pub quality: Option<QualityDimensions>,
    /// Weighted overall quality, once computed
    pub quality_overall: Option<f64>,
    /// Flagged by the outlier detector
    pub needs_quality_review: bool,
    /// Flagged by mid-confidence classification
    pub needs_classification_review: bool,
    /// Dense embedding model version stamp
    pub embedding_model: Option<String>,
    /// Sparse encoder model version stamp
    pub sparse_model: Option<String>,
    /// Classifier model version stamp
    pub classifier_model: Option<String>,
    /// Publication date, when known
    pub published_at: Option<DateTime<Utc>>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// When the pipeline claimed the resource
    pub ingestion_started_at: Option<DateTime<Utc>>,
    /// When the pipeline finished
    pub ingestion_completed_at: Option<DateTime<Utc>>,
}

/// Metadata overrides accepted at ingestion time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceOverrides {
    /// Title override
    pub title: Option<String>,
    /// Description override
    pub description: Option<String>,
    /// Creator override
    pub creator: Option<String>,
    /// Publisher override
    pub publisher: Option<String>,
    /// Language override
    pub language: Option<String>,
    /// Type override
    pub resource_type: Option<String>,
    /// Subject terms override
    #[serde(default)]
    pub subjects: Vec<String>,
    /// Academic identifier override
    pub identifier: Option<String>,
    /// Publication date override
    pub published_at: Option<DateTime<Utc>>,
}

/// Partial update for an existing resource. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceUpdate {
    /// New title
    pub title: Option<String>,
    /// New description
    pub description: Option<String>,
    /// New creator
    pub creator: Option<String>,
    /// New publisher
    pub publisher: Option<String>,
    /// New language
    pub language: Option<String>,
    /// New type
    pub resource_type: Option<String>,
    /// New subject list
    pub subjects: Option<Vec<String>>,
    /// New classification code
    pub classification_code: Option<String>,
    /// New read status
    pub read_status: Option<ReadStatus>,
    /// New publication date
    pub published_at: Option<DateTime<Utc>>,
}

impl ResourceUpdate {
    /// Whether this update touches the lexical document (title, description,
    /// subjects) and therefore requires reindexing and re-embedding.
    pub fn changes_content(&self) -> bool {
        self.title.is_some() || self.description.is_some() || self.subjects.is_some()
    }
}

/// Normalize a URL for duplicate detection and citation resolution:
/// lowercase scheme and host, strip the fragment and common tracking
/// parameters, drop a trailing slash on the path.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    // Split off the fragment first
    let without_fragment = url.split('#').next().unwrap_or(url);

    let (scheme, rest) = match without_fragment.split_once("://") {
        Some((scheme, rest)) => (scheme.to_lowercase(), rest),
        None => return without_fragment.trim_end_matches('/').to_string(),
    };

    let (host_and_path, query) = match rest.split_once('?') {
        Some((hp, q)) => (hp, Some(q)),
        None => (rest, None),
    };

    let (host, path) = match host_and_path.split_once('/') {
        Some((host, path)) => (host.to_lowercase(), format!("/{path}")),
        None => (host_and_path.to_lowercase(), String::new()),
    };
    let path = path.trim_end_matches('/').to_string();

    let kept_query: Vec<&str> = query
        .unwrap_or("")
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            !key.is_empty()
                && !key.starts_with("utm_")
                && !matches!(key, "fbclid" | "gclid" | "ref" | "source")
        })
        .collect();

    if kept_query.is_empty() {
        format!("{scheme}://{host}{path}")
    } else {
        format!("{scheme}://{host}{path}?{}", kept_query.join("&"))
    }
}

/// Validate that a submitted URL is well-formed enough to ingest.
pub fn validate_url(url: &str) -> Result<()> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation("url must not be empty".to_string()));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(CoreError::Validation(format!(
            "url must be http(s), got {trimmed:?}"
        )));
    }
    let host = trimmed
        .split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("");
    if host.is_empty() {
        return Err(CoreError::Validation("url has no host".to_string()));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use IngestionStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Paper/?utm_source=x&id=3#section"),
            "https://example.com/Paper?id=3"
        );
        assert_eq!(
            normalize_url("http://example.com/a/b/"),
            "http://example.com/a/b"
        );
        assert_eq!(normalize_url("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/x").is_ok());
        assert!(validate_url("").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("https:///nohost").is_err());
    }

    #[test]
    fn test_update_content_detection() {
        let update = ResourceUpdate {
            title: Some("new".to_string()),
            ..Default::default()
        };
        assert!(update.changes_content());

        let update = ResourceUpdate {
            read_status: Some(ReadStatus::Completed),
            ..Default::default()
        };
        assert!(!update.changes_content());
    }
}
