//! Facet Counts
//!
//! Counts over the filtered, fused candidate set (not the whole corpus),
//! capped at the top 1000 candidates. The subject facet is the flattened
//! multiset of subject terms.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resource::Resource;

/// Facet families returned with search results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Facets {
    /// Classification code counts
    pub classification_code: BTreeMap<String, u64>,
    /// Resource type counts
    pub resource_type: BTreeMap<String, u64>,
    /// Language counts
    pub language: BTreeMap<String, u64>,
    /// Read status counts
    pub read_status: BTreeMap<String, u64>,
    /// Flattened subject-term counts
    pub subject: BTreeMap<String, u64>,
}

impl Facets {
    /// True when every family is empty.
    pub fn is_empty(&self) -> bool {
        self.classification_code.is_empty()
            && self.resource_type.is_empty()
            && self.language.is_empty()
            && self.read_status.is_empty()
            && self.subject.is_empty()
    }
}

/// Facet computation cap: only the top-N candidates contribute.
pub const FACET_CAP: usize = 1000;

/// Compute facets over the leading candidates.
pub fn compute_facets<'a>(resources: impl Iterator<Item = &'a Resource>) -> Facets {
    let mut facets = Facets::default();

    for resource in resources.take(FACET_CAP) {
        if let Some(code) = &resource.classification_code {
            *facets.classification_code.entry(code.clone()).or_default() += 1;
        }
        if let Some(rt) = &resource.resource_type {
            *facets.resource_type.entry(rt.clone()).or_default() += 1;
        }
        if let Some(lang) = &resource.language {
            *facets.language.entry(lang.clone()).or_default() += 1;
        }
        *facets
            .read_status
            .entry(resource.read_status.as_str().to_string())
            .or_default() += 1;
        for subject in &resource.subjects {
            *facets.subject.entry(subject.clone()).or_default() += 1;
        }
    }
    facets
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{IngestionStatus, ReadStatus};
    use chrono::Utc;

    fn resource(id: &str, lang: &str, subjects: &[&str]) -> Resource {
        let now = Utc::now();
        Resource {
            id: id.to_string(),
            title: String::new(),
            description: String::new(),
            creator: None,
            publisher: None,
            source_url: String::new(),
            normalized_url: String::new(),
            language: Some(lang.to_string()),
            resource_type: Some("article".to_string()),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            classification_code: Some("006".to_string()),
            identifier: None,
            read_status: ReadStatus::Unread,
            ingestion_status: IngestionStatus::Completed,
            ingestion_error: None,
            quality: None,
            quality_overall: None,
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
    fn test_counts_and_subject_multiset() {
        let resources = vec![
            resource("a", "en", &["ml", "ai"]),
            resource("b", "en", &["ml"]),
            resource("c", "de", &[]),
        ];
        let facets = compute_facets(resources.iter());

        assert_eq!(facets.language["en"], 2);
        assert_eq!(facets.language["de"], 1);
        assert_eq!(facets.subject["ml"], 2);
        assert_eq!(facets.subject["ai"], 1);
        assert_eq!(facets.classification_code["006"], 3);
        assert_eq!(facets.read_status["unread"], 3);
    }

    #[test]
    fn test_empty_input_empty_facets() {
        let facets = compute_facets(std::iter::empty());
        assert!(facets.is_empty());
    }
}
