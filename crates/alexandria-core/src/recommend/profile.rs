//! User Profiles
//!
//! Append-only interaction log plus the derived interest profile: an
//! age-discounted, strength-weighted mean of the dense vectors of
//! positively interacted resources (L2-normalized), and per-subject topic
//! weights. Profiles refresh through the batch queue and serve from the
//! cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kernel::{Kernel, TaskRequest};
use crate::resource::{blob_to_vec, vec_to_blob};
use crate::storage::{format_ts, parse_ts};
use crate::vector::l2_normalize;

use super::{InteractionKind, UserInteraction};

/// Interactions at or above this strength count as positive signal.
pub const POSITIVE_STRENGTH: f64 = 0.5;

/// Age-discount half-life for interest weighting, days.
const DISCOUNT_HALF_LIFE_DAYS: f64 = 90.0;

/// A derived user profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// Profile owner
    pub user_id: String,
    /// Interest vector (unit norm) or `None` before any positive signal
    pub interest_vector: Option<Vec<f32>>,
    /// Subject term → accumulated weight
    pub topic_weights: BTreeMap<String, f64>,
    /// Total interactions logged
    pub interaction_count: u64,
    /// Last recompute time
    pub updated_at: DateTime<Utc>,
}

/// The interaction log and profile store.
pub struct ProfileStore {
    kernel: Arc<Kernel>,
}

impl ProfileStore {
    /// Create the service over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Append an interaction and schedule a profile refresh.
    pub fn record_interaction(
        &self,
        user_id: &str,
        resource_id: &str,
        kind: InteractionKind,
        strength: f64,
    ) -> Result<UserInteraction> {
        if !(0.0..=1.0).contains(&strength) {
            return Err(CoreError::Validation(
                "interaction strength must be in [0, 1]".to_string(),
            ));
        }
        let now = self.kernel.now();
        let interaction = UserInteraction {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            resource_id: resource_id.to_string(),
            kind,
            strength,
            created_at: now,
        };

        let stored = interaction.clone();
        self.kernel.commit(move |tx, fx| {
            tx.execute(
                "INSERT INTO interactions (id, user_id, resource_id, kind, strength, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    stored.id,
                    stored.user_id,
                    stored.resource_id,
                    stored.kind.as_str(),
                    stored.strength,
                    format_ts(stored.created_at),
                ],
            )?;
            fx.enqueue(TaskRequest::refresh_profile(&stored.user_id));
            Ok(())
        })?;
        Ok(interaction)
    }

    /// All interactions for a user, newest first.
    pub fn interactions(&self, user_id: &str) -> Result<Vec<UserInteraction>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, resource_id, kind, strength, created_at
                 FROM interactions WHERE user_id = ?1 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![user_id], |row| {
                let kind: String = row.get(3)?;
                let created: String = row.get(5)?;
                Ok(UserInteraction {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    resource_id: row.get(2)?,
                    kind: InteractionKind::parse(&kind),
                    strength: row.get(4)?,
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

    /// Positively interacted resource ids with their best strength and most
    /// recent timestamp.
    pub fn positive_interactions(&self, user_id: &str) -> Result<Vec<(String, f64, DateTime<Utc>)>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_id, MAX(strength), MAX(created_at) FROM interactions
                 WHERE user_id = ?1 AND strength >= ?2
                 GROUP BY resource_id",
            )?;
            let rows = stmt.query_map(params![user_id, POSITIVE_STRENGTH], |row| {
                let created: String = row.get(2)?;
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    parse_ts(&created).unwrap_or_else(|_| Utc::now()),
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Recompute and persist the profile from the interaction log.
    pub fn refresh_profile(&self, user_id: &str) -> Result<UserProfile> {
        let now = self.kernel.now();
        let positives = self.positive_interactions(user_id)?;
        let interaction_count: u64 = self.kernel.store.with_read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interactions WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })?;

        let mut weighted_sum: Option<Vec<f32>> = None;
        let mut topic_weights: BTreeMap<String, f64> = BTreeMap::new();

        for (resource_id, strength, when) in &positives {
            let age_days = (now - *when).num_days().max(0) as f64;
            let discount = 0.5f64.powf(age_days / DISCOUNT_HALF_LIFE_DAYS);
            let weight = strength * discount;

            let loaded = self.kernel.store.with_read(|conn| {
                let resource = crate::resource::read_resource(conn, resource_id)?;
                let dense = crate::resource::read_dense(conn, resource_id)?;
                Ok((resource, dense))
            })?;
            let (resource, dense) = loaded;

            if let Some((vector, _)) = dense {
                let sum = weighted_sum.get_or_insert_with(|| vec![0.0f32; vector.len()]);
                if sum.len() == vector.len() {
                    for (s, v) in sum.iter_mut().zip(vector.iter()) {
                        *s += v * weight as f32;
                    }
                }
            }
            if let Some(resource) = resource {
                for subject in &resource.subjects {
                    *topic_weights.entry(subject.clone()).or_default() += weight;
                }
            }
        }

        let interest_vector = weighted_sum.map(l2_normalize).filter(|v| {
            v.iter().any(|x| x.abs() > f32::EPSILON)
        });

        let profile = UserProfile {
            user_id: user_id.to_string(),
            interest_vector,
            topic_weights,
            interaction_count,
            updated_at: now,
        };

        let stored = profile.clone();
        self.kernel.commit(move |tx, _fx| {
            tx.execute(
                "INSERT INTO user_profiles (user_id, interest_vector, topic_weights,
                                            interaction_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET interest_vector = ?2, topic_weights = ?3,
                        interaction_count = ?4, updated_at = ?5",
                params![
                    stored.user_id,
                    stored.interest_vector.as_ref().map(|v| vec_to_blob(v)),
                    serde_json::to_string(&stored.topic_weights)?,
                    stored.interaction_count as i64,
                    format_ts(now),
                ],
            )?;
            Ok(())
        })?;

        self.kernel
            .cache
            .invalidate_pattern(&format!("user:{user_id}:*"));
        Ok(profile)
    }

    /// Fetch the stored profile, cache-first. Users with no profile row get
    /// an empty profile.
    pub fn profile(&self, user_id: &str) -> Result<UserProfile> {
        let cache_key = format!("user:{user_id}:profile");
        if let Some(cached) = self.kernel.cache.get::<UserProfile>(&cache_key) {
            return Ok(cached);
        }

        let found = self.kernel.store.with_read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT user_id, interest_vector, topic_weights, interaction_count, updated_at
                     FROM user_profiles WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        let vector: Option<Vec<u8>> = row.get(1)?;
                        let topics: String = row.get(2)?;
                        let updated: String = row.get(4)?;
                        Ok(UserProfile {
                            user_id: row.get(0)?,
                            interest_vector: vector.map(|blob| blob_to_vec(&blob)),
                            topic_weights: serde_json::from_str(&topics).unwrap_or_default(),
                            interaction_count: row.get::<_, i64>(3)? as u64,
                            updated_at: parse_ts(&updated).unwrap_or_else(|_| Utc::now()),
                        })
                    },
                )
                .optional()?)
        })?;

        let profile = found.unwrap_or_else(|| UserProfile {
            user_id: user_id.to_string(),
            interest_vector: None,
            topic_weights: BTreeMap::new(),
            interaction_count: 0,
            updated_at: self.kernel.now(),
        });
        self.kernel.cache.put(&cache_key, &profile);
        Ok(profile)
    }

    /// Global view-count popularity for a resource (novelty signal).
    pub fn popularity(&self, resource_id: &str) -> Result<u64> {
        self.kernel.store.with_read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM interactions WHERE resource_id = ?1 AND kind = 'view'",
                params![resource_id],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}
