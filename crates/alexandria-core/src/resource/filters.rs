//! Resource Filters
//!
//! One filter struct serves both surfaces: compiled into SQL for listing,
//! applied in memory to post-filter hybrid-search candidates (filters run
//! after retrieval so they never perturb ranking).

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use super::{ReadStatus, Resource};

/// Whitelisted sort columns for resource listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    /// Row creation time
    #[default]
    CreatedAt,
    /// Last modification time
    UpdatedAt,
    /// Title, lexicographic
    Title,
    /// Overall quality score
    QualityOverall,
}

impl SortField {
    /// Column name; whitelist keeps user input out of SQL.
    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Title => "title",
            SortField::QualityOverall => "quality_overall",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    /// Ascending
    Asc,
    /// Descending
    #[default]
    Desc,
}

impl SortDir {
    /// SQL keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// Filters over the resource catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceFilters {
    /// Substring match on title/description
    pub q: Option<String>,
    /// Exact classification code
    pub classification_code: Option<String>,
    /// Exact resource type
    pub resource_type: Option<String>,
    /// Exact language tag
    pub language: Option<String>,
    /// Exact read status
    pub read_status: Option<ReadStatus>,
    /// Minimum overall quality (inclusive)
    pub min_quality: Option<f64>,
    /// Created on or after
    pub created_from: Option<DateTime<Utc>>,
    /// Created on or before
    pub created_to: Option<DateTime<Utc>>,
    /// Updated on or after
    pub updated_from: Option<DateTime<Utc>>,
    /// Updated on or before
    pub updated_to: Option<DateTime<Utc>>,
    /// At least one of these subjects present
    #[serde(default)]
    pub subject_any: Vec<String>,
    /// All of these subjects present
    #[serde(default)]
    pub subject_all: Vec<String>,
}

impl ResourceFilters {
    /// True when no filter is set.
    pub fn is_empty(&self) -> bool {
        self.q.is_none()
            && self.classification_code.is_none()
            && self.resource_type.is_none()
            && self.language.is_none()
            && self.read_status.is_none()
            && self.min_quality.is_none()
            && self.created_from.is_none()
            && self.created_to.is_none()
            && self.updated_from.is_none()
            && self.updated_to.is_none()
            && self.subject_any.is_empty()
            && self.subject_all.is_empty()
    }

    /// Whether subject filters are present (these are applied in memory; the
    /// subject list is stored as a JSON array).
    pub fn has_subject_filters(&self) -> bool {
        !self.subject_any.is_empty() || !self.subject_all.is_empty()
    }

    /// Compile the scalar filters into a SQL WHERE fragment plus parameters.
    /// Subject filters are excluded; apply [`ResourceFilters::matches`] after.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();

        if let Some(q) = &self.q {
            clauses.push("(title LIKE ?1 OR description LIKE ?1)".replace("?1", &placeholder(params.len() + 1)));
            params.push(SqlValue::Text(format!("%{q}%")));
        }
        if let Some(code) = &self.classification_code {
            clauses.push(format!("classification_code = {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(code.clone()));
        }
        if let Some(rt) = &self.resource_type {
            clauses.push(format!("resource_type = {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(rt.clone()));
        }
        if let Some(lang) = &self.language {
            clauses.push(format!("language = {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(lang.clone()));
        }
        if let Some(rs) = &self.read_status {
            clauses.push(format!("read_status = {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(rs.as_str().to_string()));
        }
        if let Some(min_q) = self.min_quality {
            clauses.push(format!("quality_overall >= {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Real(min_q));
        }
        if let Some(from) = self.created_from {
            clauses.push(format!("created_at >= {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(crate::storage::format_ts(from)));
        }
        if let Some(to) = self.created_to {
            clauses.push(format!("created_at <= {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(crate::storage::format_ts(to)));
        }
        if let Some(from) = self.updated_from {
            clauses.push(format!("updated_at >= {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(crate::storage::format_ts(from)));
        }
        if let Some(to) = self.updated_to {
            clauses.push(format!("updated_at <= {}", placeholder(params.len() + 1)));
            params.push(SqlValue::Text(crate::storage::format_ts(to)));
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!("WHERE {}", clauses.join(" AND ")), params)
        }
    }

    /// Full in-memory check, including subject filters. Used by the search
    /// engine on retrieval candidates.
    pub fn matches(&self, resource: &Resource) -> bool {
        if let Some(q) = &self.q {
            let q = q.to_lowercase();
            if !resource.title.to_lowercase().contains(&q)
                && !resource.description.to_lowercase().contains(&q)
            {
                return false;
            }
        }
        if let Some(code) = &self.classification_code {
            if resource.classification_code.as_deref() != Some(code.as_str()) {
                return false;
            }
        }
        if let Some(rt) = &self.resource_type {
            if resource.resource_type.as_deref() != Some(rt.as_str()) {
                return false;
            }
        }
        if let Some(lang) = &self.language {
            if resource.language.as_deref() != Some(lang.as_str()) {
                return false;
            }
        }
        if let Some(rs) = self.read_status {
            if resource.read_status != rs {
                return false;
            }
        }
        if let Some(min_q) = self.min_quality {
            match resource.quality_overall {
                Some(q) if q >= min_q => {}
                _ => return false,
            }
        }
        if let Some(from) = self.created_from {
            if resource.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.created_to {
            if resource.created_at > to {
                return false;
            }
        }
        if let Some(from) = self.updated_from {
            if resource.updated_at < from {
                return false;
            }
        }
        if let Some(to) = self.updated_to {
            if resource.updated_at > to {
                return false;
            }
        }
        if !self.subject_any.is_empty()
            && !self
                .subject_any
                .iter()
                .any(|s| resource.subjects.iter().any(|rs| rs.eq_ignore_ascii_case(s)))
        {
            return false;
        }
        if !self.subject_all.is_empty()
            && !self
                .subject_all
                .iter()
                .all(|s| resource.subjects.iter().any(|rs| rs.eq_ignore_ascii_case(s)))
        {
            return false;
        }
        true
    }
}

fn placeholder(n: usize) -> String {
    format!("?{n}")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::IngestionStatus;

    fn sample_resource() -> Resource {
        let now = Utc::now();
        Resource {
            id: "r1".to_string(),
            title: "Deep Learning Survey".to_string(),
            description: "A survey of neural methods".to_string(),
            creator: None,
            publisher: None,
            source_url: "https://example.com/dl".to_string(),
            normalized_url: "https://example.com/dl".to_string(),
            language: Some("en".to_string()),
            resource_type: Some("article".to_string()),
            subjects: vec!["machine learning".to_string(), "surveys".to_string()],
            classification_code: Some("006".to_string()),
            identifier: None,
            read_status: ReadStatus::Unread,
            ingestion_status: IngestionStatus::Completed,
            ingestion_error: None,
            quality: None,
            quality_overall: Some(0.7),
            needs_quality_review: false,
            needs_classification_review: false,
            embedding_model: None,
            sparse_model: None,
            classifier_model: None,
            published_at: None,
            created_at: now,
            updated_at: now,
            ingestion_started_at: None,
            ingestion_completed_at: None,
        }
    }

    #[test]
    fn test_empty_filters_match_everything() {
        let filters = ResourceFilters::default();
        assert!(filters.is_empty());
        assert!(filters.matches(&sample_resource()));
        let (where_clause, params) = filters.to_sql();
        assert!(where_clause.is_empty());
        assert!(params.is_empty());
    }

    #[test]
    fn test_scalar_filters() {
        let resource = sample_resource();

        let filters = ResourceFilters {
            language: Some("en".to_string()),
            min_quality: Some(0.5),
            ..Default::default()
        };
        assert!(filters.matches(&resource));

        let filters = ResourceFilters {
            min_quality: Some(0.9),
            ..Default::default()
        };
        assert!(!filters.matches(&resource));
    }

    #[test]
    fn test_subject_filters() {
        let resource = sample_resource();

        let any = ResourceFilters {
            subject_any: vec!["surveys".to_string(), "chemistry".to_string()],
            ..Default::default()
        };
        assert!(any.matches(&resource));

        let all = ResourceFilters {
            subject_all: vec!["surveys".to_string(), "chemistry".to_string()],
            ..Default::default()
        };
        assert!(!all.matches(&resource));
    }

    #[test]
    fn test_sql_placeholders_line_up() {
        let filters = ResourceFilters {
            q: Some("neural".to_string()),
            classification_code: Some("006".to_string()),
            min_quality: Some(0.5),
            ..Default::default()
        };
        let (where_clause, params) = filters.to_sql();
        assert!(where_clause.starts_with("WHERE "));
        assert_eq!(params.len(), 3);
        assert!(where_clause.contains("?1"));
        assert!(where_clause.contains("?2"));
        assert!(where_clause.contains("?3"));
    }
}
