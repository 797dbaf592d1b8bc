//! Multi-Label Classifier
//!
//! Assigns taxonomy nodes to resources with calibrated confidences in
//! [0, 1]. The model itself sits behind [`ClassifierModel`] so production
//! can plug a fine-tuned network while the default stays deterministic
//! keyword scoring. Predictions below 0.30 are dropped; anything in
//! [0.30, 0.70) flags the resource for human review. The active model can
//! be hot-swapped after a retrain passes validation.

use std::sync::{Arc, RwLock};

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::kernel::bus::{topics, Event};
use crate::kernel::gateway::tokenize;
use crate::kernel::Kernel;
use crate::storage::format_ts;

/// Hard floor: predictions under this are discarded.
pub const CONFIDENCE_FLOOR: f64 = 0.30;
/// Predictions under this (and at or above the floor) flag review.
pub const REVIEW_THRESHOLD: f64 = 0.70;

/// A label the classifier can emit: an assignable taxonomy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelInfo {
    /// Node id
    pub node_id: String,
    /// Display name
    pub name: String,
    /// Materialized path (doubles as the classification code)
    pub path: String,
    /// Keywords describing the node
    pub keywords: Vec<String>,
}

/// One prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    /// Predicted node
    pub node_id: String,
    /// Calibrated confidence in [0, 1]
    pub confidence: f64,
}

/// The classification model boundary. Implementations must be deterministic
/// for a fixed version: confidences are calibrated sigmoid outputs.
pub trait ClassifierModel: Send + Sync {
    /// Model version stamped on every prediction.
    fn version(&self) -> &str;

    /// Score the text against every label, best first, at most `top_k`.
    fn predict(&self, text: &str, labels: &[LabelInfo], top_k: usize) -> Vec<Prediction>;
}

/// Deterministic keyword-overlap model: the fraction of a label's keywords
/// (plus its name tokens) found in the text goes through a logistic
/// calibration. Full keyword coverage lands near 0.88, nothing near 0.12.
pub struct KeywordClassifier {
    version: String,
}

impl KeywordClassifier {
    /// Model with an explicit version tag.
    pub fn with_version(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    fn raw_overlap(text_tokens: &[String], label: &LabelInfo) -> f64 {
        let mut vocabulary: Vec<String> = label
            .keywords
            .iter()
            .flat_map(|k| tokenize(k))
            .collect();
        vocabulary.extend(tokenize(&label.name));
        vocabulary.sort();
        vocabulary.dedup();
        if vocabulary.is_empty() {
            return 0.0;
        }
        let hits = vocabulary
            .iter()
            .filter(|term| text_tokens.contains(term))
            .count();
        hits as f64 / vocabulary.len() as f64
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::with_version("keyword-classifier/v1")
    }
}

impl ClassifierModel for KeywordClassifier {
    fn version(&self) -> &str {
        &self.version
    }

    fn predict(&self, text: &str, labels: &[LabelInfo], top_k: usize) -> Vec<Prediction> {
        let text_tokens = tokenize(text);
        let mut predictions: Vec<Prediction> = labels
            .iter()
            .map(|label| {
                let raw = Self::raw_overlap(&text_tokens, label);
                // Logistic calibration centered at half coverage
                let confidence = 1.0 / (1.0 + (-(4.0 * raw - 2.0)).exp());
                Prediction {
                    node_id: label.node_id.clone(),
                    confidence,
                }
            })
            .collect();
        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        predictions.truncate(top_k);
        predictions
    }
}

/// A stored assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Resource
    pub resource_id: String,
    /// Taxonomy node
    pub node_id: String,
    /// Confidence at assignment time (1.0 for manual)
    pub confidence: f64,
    /// `predicted` or `manual`
    pub source: String,
    /// Model version, absent for manual assignments
    pub model_version: Option<String>,
}

/// The classifier service: holds the hot-swappable model and owns the
/// assignment table.
pub struct Classifier {
    kernel: Arc<Kernel>,
    model: RwLock<Arc<dyn ClassifierModel>>,
    validated_f1: RwLock<Option<f64>>,
}

impl Classifier {
    /// Wire the service with an initial model.
    pub fn new(kernel: Arc<Kernel>, model: Arc<dyn ClassifierModel>) -> Self {
        Self {
            kernel,
            model: RwLock::new(model),
            validated_f1: RwLock::new(None),
        }
    }

    /// Version of the active model.
    pub fn model_version(&self) -> String {
        self.model
            .read()
            .expect("classifier lock poisoned")
            .version()
            .to_string()
    }

    /// Raw predictions for arbitrary text (no thresholding).
    pub fn predict(&self, text: &str, labels: &[LabelInfo], top_k: usize) -> Vec<Prediction> {
        self.model
            .read()
            .expect("classifier lock poisoned")
            .predict(text, labels, top_k)
    }

    /// Classify a resource: build its text view, predict, drop sub-floor
    /// predictions, store the survivors as `predicted` assignments (manual
    /// ones are never touched), flag review for mid-band confidence, and
    /// stamp the top path as the classification code.
    pub fn classify_resource(
        &self,
        resource_id: &str,
        labels: &[LabelInfo],
        top_k: usize,
    ) -> Result<Vec<Prediction>> {
        let resource = self
            .kernel
            .store
            .with_read(|conn| crate::resource::read_resource(conn, resource_id))?
            .ok_or_else(|| CoreError::NotFound(format!("resource {resource_id}")))?;
        let archive = self
            .kernel
            .store
            .with_read(|conn| crate::resource::read_archive(conn, resource_id))?
            .map(|(content, _)| content)
            .unwrap_or_default();

        let body_prefix: String = archive.chars().take(2000).collect();
        let text = format!(
            "{}\n{}\n{}\n{body_prefix}",
            resource.title,
            resource.description,
            resource.subjects.join(" "),
        );

        let version = self.model_version();
        let predictions: Vec<Prediction> = self
            .predict(&text, labels, top_k)
            .into_iter()
            .filter(|p| p.confidence >= CONFIDENCE_FLOOR)
            .collect();

        let needs_review = predictions
            .iter()
            .any(|p| p.confidence < REVIEW_THRESHOLD);
        let top_path = predictions.first().and_then(|p| {
            labels
                .iter()
                .find(|l| l.node_id == p.node_id)
                .map(|l| l.path.clone())
        });

        let now = self.kernel.now();
        let stored = predictions.clone();
        let resource_id_owned = resource_id.to_string();
        self.kernel.commit(move |tx, fx| {
            tx.execute(
                "DELETE FROM taxonomy_assignments
                 WHERE resource_id = ?1 AND source = 'predicted'",
                params![resource_id_owned],
            )?;
            for prediction in &stored {
                tx.execute(
                    "INSERT OR REPLACE INTO taxonomy_assignments
                        (resource_id, node_id, confidence, source, model_version, created_at)
                     SELECT ?1, ?2, ?3, 'predicted', ?4, ?5
                     WHERE NOT EXISTS (
                        SELECT 1 FROM taxonomy_assignments
                        WHERE resource_id = ?1 AND node_id = ?2 AND source = 'manual'
                     )",
                    params![
                        resource_id_owned,
                        prediction.node_id,
                        prediction.confidence,
                        version,
                        format_ts(now),
                    ],
                )?;
            }
            tx.execute(
                "UPDATE resources SET classifier_model = ?2,
                        needs_classification_review = ?3,
                        classification_code = COALESCE(?4, classification_code),
                        updated_at = ?5
                 WHERE id = ?1",
                params![
                    resource_id_owned,
                    version,
                    needs_review as i64,
                    top_path,
                    format_ts(now),
                ],
            )?;
            fx.emit(Event::new(
                topics::RESOURCE_CLASSIFIED,
                serde_json::json!({
                    "resource_id": resource_id_owned,
                    "predictions": stored.len(),
                    "needs_review": needs_review,
                }),
            ));
            Ok(())
        })?;

        Ok(predictions)
    }

    /// Current assignments for a resource, highest confidence first.
    pub fn assignments(&self, resource_id: &str) -> Result<Vec<Assignment>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_id, node_id, confidence, source, model_version
                 FROM taxonomy_assignments WHERE resource_id = ?1
                 ORDER BY confidence DESC, node_id ASC",
            )?;
            let rows = stmt.query_map(params![resource_id], |row| {
                Ok(Assignment {
                    resource_id: row.get(0)?,
                    node_id: row.get(1)?,
                    confidence: row.get(2)?,
                    source: row.get(3)?,
                    model_version: row.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Swap in a retrained model if its F1 is no worse than the last
    /// validated score minus 0.02. Returns whether the swap happened.
    pub fn install_model(&self, model: Arc<dyn ClassifierModel>, f1: f64) -> Result<bool> {
        let mut validated = self
            .validated_f1
            .write()
            .expect("classifier lock poisoned");
        if let Some(previous) = *validated {
            if f1 < previous - 0.02 {
                tracing::warn!(
                    candidate_f1 = f1,
                    previous_f1 = previous,
                    "retrained model failed validation; keeping current model"
                );
                return Ok(false);
            }
        }
        let version = model.version().to_string();
        *self.model.write().expect("classifier lock poisoned") = model;
        *validated = Some(f1);
        tracing::info!(version = %version, f1, "classifier model hot-swapped");
        Ok(true)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn label(id: &str, name: &str, keywords: &[&str]) -> LabelInfo {
        LabelInfo {
            node_id: id.to_string(),
            name: name.to_string(),
            path: format!("/{id}"),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_keyword_model_ranks_matching_label_first() {
        let model = KeywordClassifier::default();
        let labels = vec![
            label("ml", "Machine Learning", &["neural", "training", "models"]),
            label("cooking", "Cooking", &["recipe", "oven", "flour"]),
        ];
        let predictions = model.predict(
            "training neural models for machine learning",
            &labels,
            10,
        );
        assert_eq!(predictions[0].node_id, "ml");
        assert!(predictions[0].confidence >= CONFIDENCE_FLOOR);
        assert!(predictions[1].confidence < CONFIDENCE_FLOOR);
    }

    #[test]
    fn test_confidences_are_probabilities() {
        let model = KeywordClassifier::default();
        let labels = vec![label("x", "Topic", &["alpha", "beta"])];
        for text in ["", "alpha", "alpha beta", "unrelated words"] {
            for p in model.predict(text, &labels, 5) {
                assert!((0.0..=1.0).contains(&p.confidence), "bad confidence for {text:?}");
            }
        }
    }

    #[test]
    fn test_top_k_and_determinism() {
        let model = KeywordClassifier::default();
        let labels: Vec<LabelInfo> = (0..10)
            .map(|i| label(&format!("n{i}"), "same name", &["same", "words"]))
            .collect();
        let a = model.predict("same words", &labels, 3);
        let b = model.predict("same words", &labels, 3);
        assert_eq!(a.len(), 3);
        assert_eq!(
            a.iter().map(|p| &p.node_id).collect::<Vec<_>>(),
            b.iter().map(|p| &p.node_id).collect::<Vec<_>>()
        );
    }
}
