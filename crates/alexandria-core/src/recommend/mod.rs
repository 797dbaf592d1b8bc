//! Recommendation Engine
//!
//! Content, graph, and collaborative strategies with a hybrid fusion
//! default, MMR diversification, and a novelty tie-break. Strategies are
//! flat values dispatched by the engine; the hybrid combinator is a
//! function over strategy outputs, not a hierarchy.

mod engine;
mod profile;

pub use engine::{Recommendation, Recommender};
pub use profile::{ProfileStore, UserProfile, POSITIVE_STRENGTH};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kernel::Kernel;

/// Kinds of logged user interactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// Opened the resource
    View,
    /// Annotated it
    Annotation,
    /// Added it to a collection
    CollectionAdd,
    /// Exported it
    Export,
    /// Rated it
    Rating,
}

impl InteractionKind {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionKind::View => "view",
            InteractionKind::Annotation => "annotation",
            InteractionKind::CollectionAdd => "collection_add",
            InteractionKind::Export => "export",
            InteractionKind::Rating => "rating",
        }
    }

    /// Parse a column value.
    pub fn parse(s: &str) -> InteractionKind {
        match s {
            "annotation" => InteractionKind::Annotation,
            "collection_add" => InteractionKind::CollectionAdd,
            "export" => InteractionKind::Export,
            "rating" => InteractionKind::Rating,
            _ => InteractionKind::View,
        }
    }
}

/// One append-only interaction record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInteraction {
    /// Record id
    pub id: String,
    /// Acting user
    pub user_id: String,
    /// Target resource
    pub resource_id: String,
    /// Interaction kind
    pub kind: InteractionKind,
    /// Signal strength in [0, 1]
    pub strength: f64,
    /// When it happened
    pub created_at: DateTime<Utc>,
}

/// Recommendation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Profile-vector similarity
    Content,
    /// Edge mass from positively interacted resources
    Graph,
    /// Collaborative filtering (requires ≥5 positive interactions)
    Collaborative,
    /// Weighted fusion of the above plus quality and recency
    #[default]
    Hybrid,
}

/// Collaborative-filtering boundary. The engine only relies on the declared
/// shape: scores for candidate resources the user has not interacted with,
/// or `None` while the model considers the user cold.
pub trait CollaborativeModel: Send + Sync {
    /// Score candidates for a user; `None` disables the strategy.
    fn score(
        &self,
        user_id: &str,
        candidate_ids: &[String],
    ) -> Result<Option<HashMap<String, f64>>>;
}

/// Item-item co-occurrence scorer: candidates that frequently share users
/// with the target user's positive history score higher. Stands in for an
/// NCF-style model with the same cold-start contract (5 positive
/// interactions).
pub struct CooccurrenceCollaborative {
    kernel: Arc<Kernel>,
}

impl CooccurrenceCollaborative {
    /// Minimum positive interactions before the strategy activates.
    pub const MIN_INTERACTIONS: usize = 5;

    /// Create the scorer over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }
}

impl CollaborativeModel for CooccurrenceCollaborative {
    fn score(
        &self,
        user_id: &str,
        candidate_ids: &[String],
    ) -> Result<Option<HashMap<String, f64>>> {
        let history: Vec<String> = self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT resource_id FROM interactions
                 WHERE user_id = ?1 AND strength >= ?2",
            )?;
            let rows = stmt.query_map(params![user_id, profile::POSITIVE_STRENGTH], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        if history.len() < Self::MIN_INTERACTIONS {
            return Ok(None);
        }

        // Co-occurrence: other users who touched the history items, counted
        // per candidate they also touched.
        let mut scores: HashMap<String, f64> = HashMap::new();
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT i2.resource_id, COUNT(DISTINCT i2.user_id) AS weight
                 FROM interactions i1
                 JOIN interactions i2
                   ON i2.user_id = i1.user_id AND i2.user_id != ?1
                 WHERE i1.resource_id = ?2 AND i2.resource_id != i1.resource_id
                 GROUP BY i2.resource_id",
            )?;
            for item in &history {
                let rows = stmt.query_map(params![user_id, item], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (resource_id, weight) = row?;
                    *scores.entry(resource_id).or_default() += weight as f64;
                }
            }
            Ok(())
        })?;

        let max = scores.values().cloned().fold(0.0f64, f64::max).max(1.0);
        let scored: HashMap<String, f64> = candidate_ids
            .iter()
            .filter_map(|id| scores.get(id).map(|s| (id.clone(), s / max)))
            .collect();
        Ok(Some(scored))
    }
}
