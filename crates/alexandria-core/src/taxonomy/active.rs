//! Active Learning
//!
//! Human-in-the-loop refinement: resources are ranked for review by a
//! composite uncertainty score, feedback overwrites predictions as manual
//! ground truth and feeds the training log, and once enough manual examples
//! accumulate a fine-tuning task launches. The trainer is a black box that
//! returns a new model version plus metrics; the swap only happens when F1
//! holds up.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, GatewayError, Result};
use crate::kernel::{Kernel, TaskRequest};
use crate::storage::{format_ts, parse_ts};

use super::classifier::{Classifier, ClassifierModel, KeywordClassifier};

/// Composite uncertainty of a prediction set:
///
/// ```text
/// U = (entropy_norm + (1 − max_prob) + (1 − margin_top2)) / 3
/// ```
///
/// Entropy is normalized by log(n) so U stays in [0, 1]. A single
/// prediction has zero entropy and zero margin deficit only when fully
/// confident.
pub fn uncertainty(confidences: &[f64]) -> f64 {
    if confidences.is_empty() {
        return 1.0;
    }
    let mut sorted: Vec<f64> = confidences.iter().map(|c| c.clamp(0.0, 1.0)).collect();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let max_prob = sorted[0];
    let margin = if sorted.len() > 1 {
        sorted[0] - sorted[1]
    } else {
        sorted[0]
    };

    let total: f64 = sorted.iter().sum();
    let entropy_norm = if sorted.len() > 1 && total > f64::EPSILON {
        let entropy: f64 = sorted
            .iter()
            .map(|c| c / total)
            .filter(|p| *p > f64::EPSILON)
            .map(|p| -p * p.ln())
            .sum();
        entropy / (sorted.len() as f64).ln()
    } else {
        0.0
    };

    ((entropy_norm + (1.0 - max_prob) + (1.0 - margin)) / 3.0).clamp(0.0, 1.0)
}

/// A resource queued for human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UncertainResource {
    /// Resource id
    pub resource_id: String,
    /// Composite uncertainty in [0, 1]
    pub uncertainty: f64,
    /// Predicted node ids with confidences
    pub predictions: Vec<(String, f64)>,
}

/// A logged manual-labeling example.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingExample {
    /// Example id
    pub id: String,
    /// Labeled resource
    pub resource_id: String,
    /// Ground-truth node ids
    pub node_ids: Vec<String>,
    /// When the feedback was given
    pub created_at: DateTime<Utc>,
}

/// Metrics reported by a training run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingMetrics {
    /// Validation F1
    pub f1: f64,
    /// Examples used
    pub examples: usize,
}

/// A trained model plus its metrics.
pub struct TrainedClassifier {
    /// The new model
    pub model: Arc<dyn ClassifierModel>,
    /// Validation metrics
    pub metrics: TrainingMetrics,
}

/// Black-box fine-tuning boundary.
pub trait Trainer: Send + Sync {
    /// Fine-tune on the accumulated manual examples.
    fn fine_tune(&self, examples: &[TrainingExample]) -> std::result::Result<TrainedClassifier, GatewayError>;
}

/// Trainer stub returning a keyword model with a fixed F1. Deployments
/// without a training backend keep the deterministic model; tests steer the
/// validation gate through the configured score.
pub struct StaticTrainer {
    f1: f64,
    version_counter: std::sync::atomic::AtomicU64,
}

impl StaticTrainer {
    /// Trainer reporting the given F1.
    pub fn with_f1(f1: f64) -> Self {
        Self {
            f1,
            version_counter: std::sync::atomic::AtomicU64::new(2),
        }
    }
}

impl Trainer for StaticTrainer {
    fn fine_tune(&self, examples: &[TrainingExample]) -> std::result::Result<TrainedClassifier, GatewayError> {
        let version = self
            .version_counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(TrainedClassifier {
            model: Arc::new(KeywordClassifier::with_version(format!(
                "keyword-classifier/v{version}"
            ))),
            metrics: TrainingMetrics {
                f1: self.f1,
                examples: examples.len(),
            },
        })
    }
}

/// The active-learning service.
pub struct ActiveLearning {
    kernel: Arc<Kernel>,
    classifier: Arc<Classifier>,
}

impl ActiveLearning {
    /// Wire the service.
    pub fn new(kernel: Arc<Kernel>, classifier: Arc<Classifier>) -> Self {
        Self { kernel, classifier }
    }

    /// Resources ranked most-uncertain-first, from predicted assignments.
    pub fn uncertain_resources(&self, limit: usize) -> Result<Vec<UncertainResource>> {
        let rows: Vec<(String, String, f64)> = self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_id, node_id, confidence FROM taxonomy_assignments
                 WHERE source = 'predicted' ORDER BY resource_id ASC, confidence DESC",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let mut out = Vec::new();
            for row in mapped {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut grouped: Vec<UncertainResource> = Vec::new();
        for (resource_id, node_id, confidence) in rows {
            match grouped.last_mut() {
                Some(last) if last.resource_id == resource_id => {
                    last.predictions.push((node_id, confidence));
                }
                _ => grouped.push(UncertainResource {
                    resource_id,
                    uncertainty: 0.0,
                    predictions: vec![(node_id, confidence)],
                }),
            }
        }
        for entry in &mut grouped {
            let confidences: Vec<f64> = entry.predictions.iter().map(|(_, c)| *c).collect();
            entry.uncertainty = uncertainty(&confidences);
        }
        grouped.sort_by(|a, b| {
            b.uncertainty
                .partial_cmp(&a.uncertainty)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
        });
        grouped.truncate(limit);
        Ok(grouped)
    }

    /// Record human ground truth: predicted assignments are replaced by
    /// manual ones, the example joins the training log, and a retrain task
    /// launches once the threshold is met.
    pub fn submit_feedback(&self, resource_id: &str, correct_node_ids: &[String]) -> Result<()> {
        if correct_node_ids.is_empty() {
            return Err(CoreError::Validation(
                "feedback must name at least one node".to_string(),
            ));
        }
        let now = self.kernel.now();
        let resource_id = resource_id.to_string();
        let node_ids = correct_node_ids.to_vec();
        let retrain_threshold = self.kernel.settings.retrain_threshold;

        self.kernel.commit(move |tx, fx| {
            if crate::resource::read_resource(tx, &resource_id)?.is_none() {
                return Err(CoreError::NotFound(format!("resource {resource_id}")));
            }
            for node_id in &node_ids {
                let known: Option<String> = tx
                    .query_row(
                        "SELECT id FROM taxonomy_nodes WHERE id = ?1",
                        params![node_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if known.is_none() {
                    return Err(CoreError::NotFound(format!("taxonomy node {node_id}")));
                }
            }

            tx.execute(
                "DELETE FROM taxonomy_assignments WHERE resource_id = ?1",
                params![resource_id],
            )?;
            for node_id in &node_ids {
                tx.execute(
                    "INSERT INTO taxonomy_assignments
                        (resource_id, node_id, confidence, source, model_version, created_at)
                     VALUES (?1, ?2, 1.0, 'manual', NULL, ?3)",
                    params![resource_id, node_id, format_ts(now)],
                )?;
            }
            tx.execute(
                "UPDATE resources SET needs_classification_review = 0, updated_at = ?2
                 WHERE id = ?1",
                params![resource_id, format_ts(now)],
            )?;
            tx.execute(
                "INSERT INTO training_examples (id, resource_id, node_ids, created_at, consumed)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![
                    Uuid::new_v4().to_string(),
                    resource_id,
                    serde_json::to_string(&node_ids)?,
                    format_ts(now),
                ],
            )?;

            let pending: i64 = tx.query_row(
                "SELECT COUNT(*) FROM training_examples WHERE consumed = 0",
                [],
                |row| row.get(0),
            )?;
            if pending as usize >= retrain_threshold {
                fx.enqueue(TaskRequest::classifier_retrain());
            }
            Ok(())
        })
    }

    /// Unconsumed training examples, oldest first.
    pub fn pending_examples(&self) -> Result<Vec<TrainingExample>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, resource_id, node_ids, created_at FROM training_examples
                 WHERE consumed = 0 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let node_ids: String = row.get(2)?;
                let created: String = row.get(3)?;
                Ok(TrainingExample {
                    id: row.get(0)?,
                    resource_id: row.get(1)?,
                    node_ids: serde_json::from_str(&node_ids).unwrap_or_default(),
                    created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Run a fine-tuning pass: the trainer returns a new model + metrics,
    /// the classifier swaps only if validation passes, and consumed examples
    /// are marked off. Returns whether the new model was installed.
    pub fn retrain(&self, trainer: &dyn Trainer) -> Result<bool> {
        let examples = self.pending_examples()?;
        if examples.is_empty() {
            return Ok(false);
        }

        let trained = trainer
            .fine_tune(&examples)
            .map_err(|e| CoreError::from_gateway("trainer", e))?;
        let installed = self
            .classifier
            .install_model(trained.model, trained.metrics.f1)?;

        let ids: Vec<String> = examples.iter().map(|e| e.id.clone()).collect();
        self.kernel.commit(move |tx, _fx| {
            for id in &ids {
                tx.execute(
                    "UPDATE training_examples SET consumed = 1 WHERE id = ?1",
                    params![id],
                )?;
            }
            Ok(())
        })?;
        Ok(installed)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncertainty_bounds() {
        assert_eq!(uncertainty(&[]), 1.0);
        for set in [&[0.9][..], &[0.5, 0.5], &[0.34, 0.33, 0.33], &[1.0]] {
            let u = uncertainty(set);
            assert!((0.0..=1.0).contains(&u), "U out of range for {set:?}");
        }
    }

    #[test]
    fn test_confident_prediction_is_less_uncertain() {
        let confident = uncertainty(&[0.95, 0.10]);
        let torn = uncertainty(&[0.52, 0.50]);
        assert!(torn > confident);
    }

    #[test]
    fn test_single_full_confidence_is_certain() {
        let u = uncertainty(&[1.0]);
        assert!(u < 1e-9);
    }

    #[test]
    fn test_flat_distribution_is_most_uncertain() {
        let flat = uncertainty(&[0.4, 0.4, 0.4]);
        let peaked = uncertainty(&[0.9, 0.2, 0.1]);
        assert!(flat > peaked);
    }
}
