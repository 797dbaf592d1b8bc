//! Recommendation Scoring
//!
//! Strategy scorers plus the hybrid combinator:
//!
//! ```text
//! hybrid = 0.35·collaborative + 0.30·content + 0.20·graph
//!        + 0.10·quality + 0.05·recency
//! ```
//!
//! Disabled strategies drop out and the weights renormalize; users under 5
//! positive interactions get the cold-start blend 0.60·content + 0.30·graph
//! + 0.10·quality. Post-ranking MMR diversifies the list and near-ties
//! resolve toward the less popular candidate.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::DenseIndex;
use crate::kernel::Kernel;
use crate::resource::{IngestionStatus, Resource, ResourceFilters, ResourceStore, SortDir, SortField};
use crate::vector::dot;

use super::profile::ProfileStore;
use super::{CollaborativeModel, Strategy};

/// Candidate pool cap per request.
const CANDIDATE_POOL: usize = 1000;
/// Positive-interaction count below which cold-start weights apply.
const COLD_START_THRESHOLD: usize = 5;
/// Score-tie tolerance for the novelty preference.
const TIE_EPSILON: f64 = 1e-6;
/// Default diversity preference (λ = 1 − diversity = 0.7).
const DEFAULT_DIVERSITY: f64 = 0.3;

/// One recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    /// Recommended resource
    pub resource_id: String,
    /// Its title
    pub title: String,
    /// Final (post-MMR) rank score
    pub score: f64,
    /// Per-strategy raw scores that fed the blend
    pub strategy_scores: BTreeMap<String, f64>,
    /// Inverse-popularity novelty in [0, 1]
    pub novelty_score: f64,
}

struct Candidate {
    resource: Resource,
    vector: Option<Vec<f32>>,
    content: Option<f64>,
    graph: f64,
    collaborative: Option<f64>,
    quality: f64,
    recency: f64,
    novelty: f64,
    score: f64,
}

/// The recommendation engine.
pub struct Recommender {
    kernel: Arc<Kernel>,
    resources: Arc<ResourceStore>,
    dense: Arc<DenseIndex>,
    profiles: Arc<ProfileStore>,
    collaborative: Arc<dyn CollaborativeModel>,
}

impl Recommender {
    /// Wire the engine.
    pub fn new(
        kernel: Arc<Kernel>,
        resources: Arc<ResourceStore>,
        dense: Arc<DenseIndex>,
        profiles: Arc<ProfileStore>,
        collaborative: Arc<dyn CollaborativeModel>,
    ) -> Self {
        Self {
            kernel,
            resources,
            dense,
            profiles,
            collaborative,
        }
    }

    /// Produce up to `limit` recommendations for a user.
    pub fn recommend(
        &self,
        user_id: &str,
        limit: usize,
        strategy: Option<Strategy>,
        diversity: Option<f64>,
        min_quality: Option<f64>,
    ) -> Result<Vec<Recommendation>> {
        let strategy = strategy.unwrap_or_default();
        let limit = limit.clamp(1, 100);
        let now = self.kernel.now();

        let profile = self.profiles.profile(user_id)?;
        let positives = self.profiles.positive_interactions(user_id)?;
        let positive_ids: HashSet<&str> = positives.iter().map(|(id, _, _)| id.as_str()).collect();
        let cold_start = positives.len() < COLD_START_THRESHOLD;

        // Candidate pool: completed resources the user has not positively
        // interacted with, newest first, above the quality floor.
        let (pool, _) = self.resources.list(
            &ResourceFilters {
                min_quality,
                ..Default::default()
            },
            100,
            0,
            SortField::UpdatedAt,
            SortDir::Desc,
        )?;
        let mut candidates: Vec<Candidate> = pool
            .into_iter()
            .chain(self.extra_pool(min_quality)?)
            .filter(|r| r.ingestion_status == IngestionStatus::Completed)
            .filter(|r| !positive_ids.contains(r.id.as_str()))
            .take(CANDIDATE_POOL)
            .map(|resource| {
                let vector = self.dense.get(&resource.id);
                Candidate {
                    vector,
                    resource,
                    content: None,
                    graph: 0.0,
                    collaborative: None,
                    quality: 0.0,
                    recency: 0.0,
                    novelty: 0.0,
                    score: 0.0,
                }
            })
            .collect();
        // Deduplicate (list page and extra pool may overlap)
        let mut seen: HashSet<String> = HashSet::new();
        candidates.retain(|c| seen.insert(c.resource.id.clone()));

        // Positive-history vectors with age discounts, for the graph scorer
        let history: Vec<(Vec<f32>, f64)> = positives
            .iter()
            .filter_map(|(id, strength, when)| {
                self.dense.get(id).map(|v| {
                    let age_days = (now - *when).num_days().max(0) as f64;
                    (v, strength * 0.5f64.powf(age_days / 30.0))
                })
            })
            .collect();

        let candidate_ids: Vec<String> =
            candidates.iter().map(|c| c.resource.id.clone()).collect();
        let collaborative_scores = if cold_start {
            None
        } else {
            self.collaborative.score(user_id, &candidate_ids)?
        };

        for candidate in &mut candidates {
            candidate.content = match (&profile.interest_vector, &candidate.vector) {
                (Some(interest), Some(vector)) if interest.len() == vector.len() => {
                    Some(f64::from(dot(interest, vector)).clamp(-1.0, 1.0).max(0.0))
                }
                _ => None,
            };
            candidate.graph = candidate
                .vector
                .as_ref()
                .map(|vector| {
                    history
                        .iter()
                        .map(|(hv, weight)| weight * f64::from(dot(hv, vector)).max(0.0))
                        .sum::<f64>()
                        / history.len().max(1) as f64
                })
                .unwrap_or(0.0);
            candidate.collaborative = collaborative_scores
                .as_ref()
                .and_then(|scores| scores.get(&candidate.resource.id).copied());
            candidate.quality = candidate.resource.quality_overall.unwrap_or(0.0);
            let age_days = (now - candidate.resource.created_at).num_days().max(0) as f64;
            candidate.recency = (1.0 - age_days / 365.0).max(0.0);
            candidate.novelty = novelty_score(self.profiles.popularity(&candidate.resource.id)?);

            candidate.score = match strategy {
                Strategy::Content => candidate.content.unwrap_or(0.0),
                Strategy::Graph => candidate.graph,
                Strategy::Collaborative => candidate.collaborative.unwrap_or(0.0),
                Strategy::Hybrid => {
                    hybrid_score(candidate, cold_start, collaborative_scores.is_some())
                }
            };
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.resource.id.cmp(&b.resource.id))
        });

        // Novelty tie-break: within epsilon, the less popular candidate wins
        for i in 1..candidates.len() {
            if (candidates[i - 1].score - candidates[i].score).abs() < TIE_EPSILON
                && candidates[i].novelty > candidates[i - 1].novelty
            {
                candidates.swap(i - 1, i);
            }
        }

        let lambda = 1.0 - diversity.unwrap_or(DEFAULT_DIVERSITY).clamp(0.0, 1.0);
        let selected = mmr_select(candidates, lambda, limit);

        Ok(selected
            .into_iter()
            .map(|(candidate, mmr)| {
                let mut strategy_scores = BTreeMap::new();
                if let Some(content) = candidate.content {
                    strategy_scores.insert("content".to_string(), content);
                }
                strategy_scores.insert("graph".to_string(), candidate.graph);
                if let Some(coll) = candidate.collaborative {
                    strategy_scores.insert("collaborative".to_string(), coll);
                }
                strategy_scores.insert("quality".to_string(), candidate.quality);
                strategy_scores.insert("recency".to_string(), candidate.recency);
                Recommendation {
                    resource_id: candidate.resource.id,
                    title: candidate.resource.title,
                    score: mmr,
                    strategy_scores,
                    novelty_score: candidate.novelty,
                }
            })
            .collect())
    }

    /// A second, older page so the pool is not just the newest 100.
    fn extra_pool(&self, min_quality: Option<f64>) -> Result<Vec<Resource>> {
        let (page, _) = self.resources.list(
            &ResourceFilters {
                min_quality,
                ..Default::default()
            },
            100,
            100,
            SortField::UpdatedAt,
            SortDir::Desc,
        )?;
        Ok(page)
    }
}

/// Inverse-log popularity in (0, 1].
fn novelty_score(views: u64) -> f64 {
    1.0 / (1.0 + (1.0 + views as f64).ln())
}

/// Blend strategy outputs, renormalizing over the strategies that actually
/// produced a signal.
fn hybrid_score(candidate: &Candidate, cold_start: bool, collaborative_enabled: bool) -> f64 {
    let mut total = 0.0;
    let mut weight_sum = 0.0;

    if cold_start {
        if let Some(content) = candidate.content {
            total += 0.60 * content;
            weight_sum += 0.60;
        }
        total += 0.30 * candidate.graph;
        weight_sum += 0.30;
        total += 0.10 * candidate.quality;
        weight_sum += 0.10;
    } else {
        if collaborative_enabled {
            total += 0.35 * candidate.collaborative.unwrap_or(0.0);
            weight_sum += 0.35;
        }
        if let Some(content) = candidate.content {
            total += 0.30 * content;
            weight_sum += 0.30;
        }
        total += 0.20 * candidate.graph;
        weight_sum += 0.20;
        total += 0.10 * candidate.quality;
        weight_sum += 0.10;
        total += 0.05 * candidate.recency;
        weight_sum += 0.05;
    }

    if weight_sum <= f64::EPSILON {
        0.0
    } else {
        total / weight_sum
    }
}

/// Maximal Marginal Relevance selection:
/// `MMR = λ·score − (1−λ)·max_{s∈selected} cosine(candidate, s)`.
fn mmr_select(mut candidates: Vec<Candidate>, lambda: f64, limit: usize) -> Vec<(Candidate, f64)> {
    let mut selected: Vec<(Candidate, f64)> = Vec::with_capacity(limit);

    while selected.len() < limit && !candidates.is_empty() {
        let mut best_idx = 0;
        let mut best_mmr = f64::MIN;
        for (idx, candidate) in candidates.iter().enumerate() {
            let max_sim = selected
                .iter()
                .filter_map(|(s, _)| match (&s.vector, &candidate.vector) {
                    (Some(a), Some(b)) if a.len() == b.len() => Some(f64::from(dot(a, b))),
                    _ => None,
                })
                .fold(0.0f64, f64::max);
            let mmr = lambda * candidate.score - (1.0 - lambda) * max_sim;
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = idx;
            }
        }
        let candidate = candidates.remove(best_idx);
        selected.push((candidate, best_mmr));
    }
    selected
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_novelty_decreases_with_popularity() {
        assert!(novelty_score(0) > novelty_score(10));
        assert!(novelty_score(10) > novelty_score(1000));
        assert!((0.0..=1.0).contains(&novelty_score(0)));
        assert!((novelty_score(0) - 1.0).abs() < 1e-9);
    }

    fn bare_candidate(id: &str, score: f64, vector: Option<Vec<f32>>) -> Candidate {
        use crate::resource::ReadStatus;
        let now = chrono::Utc::now();
        Candidate {
            resource: Resource {
                id: id.to_string(),
                title: id.to_string(),
                description: String::new(),
                creator: None,
                publisher: None,
                source_url: String::new(),
                normalized_url: String::new(),
                language: None,
                resource_type: None,
                subjects: Vec::new(),
                classification_code: None,
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
            },
            vector,
            content: None,
            graph: 0.0,
            collaborative: None,
            quality: 0.0,
            recency: 0.0,
            novelty: 0.0,
            score,
        }
    }

    #[test]
    fn test_mmr_penalizes_redundancy() {
        let shared = vec![1.0f32, 0.0];
        let distinct = vec![0.0f32, 1.0];

        let candidates = vec![
            bare_candidate("top", 1.0, Some(shared.clone())),
            bare_candidate("twin", 0.95, Some(shared)),
            bare_candidate("other", 0.90, Some(distinct)),
        ];
        let selected = mmr_select(candidates, 0.7, 2);
        assert_eq!(selected[0].0.resource.id, "top");
        // The near-duplicate loses to the diverse candidate
        assert_eq!(selected[1].0.resource.id, "other");
    }

    #[test]
    fn test_mmr_lambda_one_is_pure_relevance() {
        let shared = vec![1.0f32, 0.0];
        let candidates = vec![
            bare_candidate("a", 1.0, Some(shared.clone())),
            bare_candidate("b", 0.9, Some(shared)),
        ];
        let selected = mmr_select(candidates, 1.0, 2);
        assert_eq!(selected[0].0.resource.id, "a");
        assert_eq!(selected[1].0.resource.id, "b");
    }

    #[test]
    fn test_hybrid_renormalizes_without_collaborative() {
        let mut candidate = bare_candidate("x", 0.0, None);
        candidate.content = Some(1.0);
        candidate.graph = 1.0;
        candidate.quality = 1.0;
        candidate.recency = 1.0;

        // All enabled signals at 1.0 must blend to 1.0 after renormalization
        let score = hybrid_score(&candidate, false, false);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cold_start_blend() {
        let mut candidate = bare_candidate("x", 0.0, None);
        candidate.content = Some(0.5);
        candidate.graph = 0.0;
        candidate.quality = 0.0;
        let score = hybrid_score(&candidate, true, false);
        assert!((score - 0.30).abs() < 1e-9);
    }
}
