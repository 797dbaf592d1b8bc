//! Quality Engine
//!
//! Five-dimensional quality scoring with a weighted overall, an
//! Isolation-Forest outlier detector, and a degradation monitor. Dimension
//! policies are fixed numeric formulas so recomputation is idempotent for
//! unchanged inputs.

mod monitor;
mod outlier;

pub use monitor::{DegradationReport, QualityMonitor, DEGRADATION_DROP, DEGRADATION_WINDOW_DAYS};
pub use outlier::{percentile, IsolationForest, OutlierDetector, OutlierReport};

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::kernel::bus::{topics, Event};
use crate::kernel::{Deadline, Kernel};
use crate::resource::{QualityDimensions, Resource};
use crate::storage::format_ts;
use crate::vector::cosine_similarity;

/// Domains treated as credible for the accuracy dimension.
const CREDIBLE_DOMAINS: &[&str] = &[
    "arxiv.org",
    "doi.org",
    "acm.org",
    "ieee.org",
    "nature.com",
    "science.org",
    "wikipedia.org",
];

/// Weights for the overall score. Must sum to 1 ± 1e-6.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityWeights {
    /// Accuracy share
    pub accuracy: f64,
    /// Completeness share
    pub completeness: f64,
    /// Consistency share
    pub consistency: f64,
    /// Timeliness share
    pub timeliness: f64,
    /// Relevance share
    pub relevance: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            accuracy: 0.30,
            completeness: 0.25,
            consistency: 0.20,
            timeliness: 0.15,
            relevance: 0.10,
        }
    }
}

impl QualityWeights {
    /// Validate the unit-sum constraint.
    pub fn validate(&self) -> Result<()> {
        let sum = self.accuracy + self.completeness + self.consistency + self.timeliness
            + self.relevance;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(CoreError::Validation(format!(
                "quality weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }

    /// Weighted overall from the dimensions.
    pub fn overall(&self, d: &QualityDimensions) -> f64 {
        self.accuracy * d.accuracy
            + self.completeness * d.completeness
            + self.consistency * d.consistency
            + self.timeliness * d.timeliness
            + self.relevance * d.relevance
    }
}

/// A computed quality score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScore {
    /// Resource scored
    pub resource_id: String,
    /// Per-dimension values in [0, 1]
    pub dimensions: QualityDimensions,
    /// Weighted overall in [0, 1]
    pub overall: f64,
    /// When it was computed
    pub computed_at: DateTime<Utc>,
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// The quality engine.
pub struct QualityEngine {
    kernel: Arc<Kernel>,
}

struct QualityInputs {
    resource: Resource,
    archive: String,
    total_citations: usize,
    valid_citations: usize,
    inbound_citations: usize,
    max_classification_confidence: f64,
}

impl QualityEngine {
    /// Create the engine over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    fn load_inputs(&self, resource_id: &str) -> Result<QualityInputs> {
        self.kernel.store.with_read(|conn| {
            let resource = crate::resource::read_resource(conn, resource_id)?
                .ok_or_else(|| CoreError::NotFound(format!("resource {resource_id}")))?;
            let archive = crate::resource::read_archive(conn, resource_id)?
                .map(|(content, _)| content)
                .unwrap_or_default();

            let (total_citations, valid_citations): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COUNT(target_resource_id) FROM citations
                 WHERE source_resource_id = ?1",
                params![resource_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let inbound_citations: i64 = conn.query_row(
                "SELECT COUNT(*) FROM citations WHERE target_resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )?;
            let max_confidence: Option<f64> = conn.query_row(
                "SELECT MAX(confidence) FROM taxonomy_assignments WHERE resource_id = ?1",
                params![resource_id],
                |row| row.get(0),
            )?;

            Ok(QualityInputs {
                resource,
                archive,
                total_citations: total_citations as usize,
                valid_citations: valid_citations as usize,
                inbound_citations: inbound_citations as usize,
                max_classification_confidence: max_confidence.unwrap_or(0.0),
            })
        })
    }

    /// Accuracy: 0.5 baseline + citation validity + credible domain +
    /// academic identifier + named authors.
    fn accuracy(inputs: &QualityInputs) -> f64 {
        let citation_ratio = if inputs.total_citations > 0 {
            inputs.valid_citations as f64 / inputs.total_citations as f64
        } else {
            0.0
        };
        let host = inputs
            .resource
            .normalized_url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("");
        let credible = host.ends_with(".edu")
            || host.ends_with(".gov")
            || CREDIBLE_DOMAINS
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")));
        let has_identifier = inputs.resource.identifier.is_some();
        let has_authors = inputs
            .resource
            .creator
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());

        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        clamp01(
            0.5 + 0.20 * citation_ratio
                + 0.15 * flag(credible)
                + 0.15 * flag(has_identifier)
                + 0.10 * flag(has_authors),
        )
    }

    /// Completeness: weighted fraction of filled fields across required /
    /// important / scholarly / multimodal groups.
    fn completeness(inputs: &QualityInputs) -> f64 {
        let r = &inputs.resource;

        let required = [
            !r.title.trim().is_empty(),
            !r.description.trim().is_empty(),
            !r.subjects.is_empty(),
        ];
        let important = [
            r.creator.is_some(),
            r.publisher.is_some(),
            r.language.is_some(),
            r.resource_type.is_some(),
        ];
        let scholarly = [
            r.identifier.is_some(),
            r.description.len() >= 100,
            r.creator.is_some(),
            r.published_at.is_some(),
        ];
        let text = &inputs.archive;
        let multimodal = [
            text.contains("$$") || text.contains("\\begin{equation"),
            text.contains('|') && text.contains("---"),
            text.to_lowercase().contains("figure"),
        ];

        let fraction = |flags: &[bool]| {
            flags.iter().filter(|f| **f).count() as f64 / flags.len() as f64
        };

        clamp01(
            0.30 * fraction(&required)
                + 0.30 * fraction(&important)
                + 0.20 * fraction(&scholarly)
                + 0.20 * fraction(&multimodal),
        )
    }

    /// Consistency: title/description embedding cosine renormalized to
    /// [0, 1], with a penalty when the classification path shares no term
    /// with the declared subjects. A missing description or an embedder
    /// failure reads as a neutral 0.5.
    fn consistency(&self, inputs: &QualityInputs) -> f64 {
        let r = &inputs.resource;
        let mut score = 0.5;

        if !r.title.trim().is_empty() && !r.description.trim().is_empty() {
            let deadline = Deadline::from_millis(self.kernel.settings.retrieval_budget_ms);
            match self
                .kernel
                .embedder
                .embed(&[r.title.as_str(), r.description.as_str()], deadline)
            {
                Ok(vectors) if vectors.len() == 2 => {
                    let cosine = cosine_similarity(&vectors[0], &vectors[1]);
                    score = (f64::from(cosine) + 1.0) / 2.0;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "consistency embedding unavailable, using neutral");
                }
            }
        }

        if let Some(code) = &r.classification_code {
            if !r.subjects.is_empty() {
                let code_lower = code.to_lowercase();
                let overlaps = r.subjects.iter().any(|s| {
                    crate::kernel::gateway::tokenize(s)
                        .iter()
                        .any(|t| code_lower.contains(t.as_str()))
                });
                if !overlaps {
                    score -= 0.2;
                }
            }
        }
        clamp01(score)
    }

    /// Timeliness: linear decay over 20 years from the publication date,
    /// plus a freshness bump for recently ingested resources. Unknown
    /// publication dates read as a neutral 0.5.
    fn timeliness(&self, inputs: &QualityInputs) -> f64 {
        let now = self.kernel.now();
        let r = &inputs.resource;

        let mut score = match r.published_at {
            Some(published) => {
                let age_years = (now.year() - published.year()) as f64
                    + (now.ordinal() as f64 - published.ordinal() as f64) / 365.25;
                (1.0 - age_years.max(0.0) / 20.0).max(0.0)
            }
            None => 0.5,
        };
        if (now - r.created_at).num_days() <= 30 {
            score += 0.10;
        }
        clamp01(score)
    }

    /// Relevance: classification confidence dominates, inbound citations
    /// (log-normalized) round it out.
    fn relevance(inputs: &QualityInputs) -> f64 {
        let citation_signal =
            ((1.0 + inputs.inbound_citations as f64).ln() / (1.0 + 10.0f64).ln()).min(1.0);
        clamp01(inputs.max_classification_confidence * 0.7 + citation_signal * 0.3)
    }

    /// Compute and persist the quality score for a resource. Emits
    /// `resource.quality_computed` and appends to the history used by the
    /// degradation monitor.
    pub fn compute_quality(
        &self,
        resource_id: &str,
        weights: Option<QualityWeights>,
    ) -> Result<QualityScore> {
        let weights = weights.unwrap_or_default();
        weights.validate()?;

        let inputs = self.load_inputs(resource_id)?;
        let dimensions = QualityDimensions {
            accuracy: Self::accuracy(&inputs),
            completeness: Self::completeness(&inputs),
            consistency: self.consistency(&inputs),
            timeliness: self.timeliness(&inputs),
            relevance: Self::relevance(&inputs),
        };
        let overall = clamp01(weights.overall(&dimensions));
        let now = self.kernel.now();

        let resource_id_owned = resource_id.to_string();
        self.kernel.commit(move |tx, fx| {
            tx.execute(
                "UPDATE resources SET quality_accuracy = ?2, quality_completeness = ?3,
                        quality_consistency = ?4, quality_timeliness = ?5,
                        quality_relevance = ?6, quality_overall = ?7, updated_at = ?8
                 WHERE id = ?1",
                params![
                    resource_id_owned,
                    dimensions.accuracy,
                    dimensions.completeness,
                    dimensions.consistency,
                    dimensions.timeliness,
                    dimensions.relevance,
                    overall,
                    format_ts(now),
                ],
            )?;
            tx.execute(
                "INSERT INTO quality_history (resource_id, overall, computed_at)
                 VALUES (?1, ?2, ?3)",
                params![resource_id_owned, overall, format_ts(now)],
            )?;
            fx.emit(Event::new(
                topics::RESOURCE_QUALITY_COMPUTED,
                serde_json::json!({
                    "resource_id": resource_id_owned,
                    "overall": overall,
                }),
            ));
            Ok(())
        })?;

        Ok(QualityScore {
            resource_id: resource_id.to_string(),
            dimensions,
            overall,
            computed_at: now,
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
    fn test_default_weights_sum_to_one() {
        assert!(QualityWeights::default().validate().is_ok());
    }

    #[test]
    fn test_bad_weights_rejected() {
        let weights = QualityWeights {
            accuracy: 0.9,
            ..Default::default()
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_overall_is_weighted_sum() {
        let weights = QualityWeights::default();
        let dims = QualityDimensions {
            accuracy: 1.0,
            completeness: 0.0,
            consistency: 0.0,
            timeliness: 0.0,
            relevance: 0.0,
        };
        assert!((weights.overall(&dims) - 0.30).abs() < 1e-12);

        let all_ones = QualityDimensions {
            accuracy: 1.0,
            completeness: 1.0,
            consistency: 1.0,
            timeliness: 1.0,
            relevance: 1.0,
        };
        assert!((weights.overall(&all_ones) - 1.0).abs() < 1e-9);
    }
}
