//! Collections
//!
//! Named groups of resources with an optional parent hierarchy (cycles
//! rejected) and a derived aggregate embedding: the L2-normalized mean of
//! the members' dense vectors, or null while empty. The aggregate is
//! recomputed inside every membership-changing transaction, including
//! resource deletion, so the invariant holds at every commit point.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kernel::bus::{topics, Event};
use crate::kernel::Kernel;
use crate::resource::{blob_to_vec, vec_to_blob};
use crate::storage::{format_ts, parse_ts};
use crate::vector::normalized_mean;

/// Collection visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Owner only
    #[default]
    Private,
    /// Explicitly shared
    Shared,
    /// World readable
    Public,
}

impl Visibility {
    fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
            Visibility::Public => "public",
        }
    }

    fn parse(s: &str) -> Visibility {
        match s {
            "shared" => Visibility::Shared,
            "public" => Visibility::Public,
            _ => Visibility::Private,
        }
    }
}

/// A stored collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    /// Collection id
    pub id: String,
    /// Display name
    pub name: String,
    /// Description
    pub description: String,
    /// Visibility
    pub visibility: Visibility,
    /// Optional parent collection
    pub parent_id: Option<String>,
    /// Owning user
    pub owner: String,
    /// L2-normalized mean of member dense vectors; null when empty
    pub aggregate_embedding: Option<Vec<f32>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<Collection> {
    let visibility: String = row.get("visibility")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    let aggregate: Option<Vec<u8>> = row.get("aggregate_embedding")?;
    Ok(Collection {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        visibility: Visibility::parse(&visibility),
        parent_id: row.get("parent_id")?,
        owner: row.get("owner")?,
        aggregate_embedding: aggregate.map(|blob| blob_to_vec(&blob)),
        created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_ts(&updated).unwrap_or_else(|_| Utc::now()),
    })
}

/// Recompute a collection's aggregate embedding from current member dense
/// vectors. Transaction-scoped: callers invoke this inside any write that
/// changes membership or member vectors.
pub(crate) fn recompute_aggregate(tx: &Transaction<'_>, collection_id: &str) -> Result<()> {
    let mut vectors: Vec<Vec<f32>> = Vec::new();
    {
        let mut stmt = tx.prepare(
            "SELECT dv.vector FROM collection_members cm
             JOIN dense_vectors dv ON dv.resource_id = cm.resource_id
             WHERE cm.collection_id = ?1",
        )?;
        let rows = stmt.query_map(params![collection_id], |row| row.get::<_, Vec<u8>>(0))?;
        for row in rows {
            vectors.push(blob_to_vec(&row?));
        }
    }

    let aggregate = normalized_mean(&vectors).map(|mean| vec_to_blob(&mean));
    tx.execute(
        "UPDATE collections SET aggregate_embedding = ?2 WHERE id = ?1",
        params![collection_id, aggregate],
    )?;
    Ok(())
}

/// Walk the parent chain from `start`; error if it reaches `forbidden`.
fn ensure_no_cycle(tx: &Transaction<'_>, start: &str, forbidden: &str) -> Result<()> {
    let mut current = Some(start.to_string());
    let mut hops = 0;
    while let Some(id) = current {
        if id == forbidden {
            return Err(CoreError::Conflict(
                "collection hierarchy would form a cycle".to_string(),
            ));
        }
        hops += 1;
        if hops > 1000 {
            return Err(CoreError::Internal(
                "collection hierarchy too deep".to_string(),
            ));
        }
        current = tx
            .query_row(
                "SELECT parent_id FROM collections WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
    }
    Ok(())
}

/// The collection store service.
pub struct CollectionStore {
    kernel: Arc<Kernel>,
}

impl CollectionStore {
    /// Create the service over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Create a collection under an optional (existing) parent.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        visibility: Visibility,
        parent_id: Option<&str>,
        owner: &str,
    ) -> Result<Collection> {
        if name.trim().is_empty() {
            return Err(CoreError::Validation("collection name must not be empty".to_string()));
        }
        let now = self.kernel.now();
        let collection = Collection {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            visibility,
            parent_id: parent_id.map(str::to_string),
            owner: owner.to_string(),
            aggregate_embedding: None,
            created_at: now,
            updated_at: now,
        };

        let stored = collection.clone();
        self.kernel.commit(move |tx, _fx| {
            if let Some(parent) = &stored.parent_id {
                let exists: Option<String> = tx
                    .query_row(
                        "SELECT id FROM collections WHERE id = ?1",
                        params![parent],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_none() {
                    return Err(CoreError::NotFound(format!("parent collection {parent}")));
                }
            }
            tx.execute(
                "INSERT INTO collections (id, name, description, visibility, parent_id, owner,
                                          created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    stored.id,
                    stored.name,
                    stored.description,
                    stored.visibility.as_str(),
                    stored.parent_id,
                    stored.owner,
                    format_ts(now),
                ],
            )?;
            Ok(())
        })?;
        Ok(collection)
    }

    /// Fetch a collection or fail with NotFound.
    pub fn get(&self, id: &str) -> Result<Collection> {
        self.kernel
            .store
            .with_read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT * FROM collections WHERE id = ?1",
                        params![id],
                        collection_from_row,
                    )
                    .optional()?)
            })?
            .ok_or_else(|| CoreError::NotFound(format!("collection {id}")))
    }

    /// Member resource ids, insertion order.
    pub fn members(&self, id: &str) -> Result<Vec<String>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_id FROM collection_members
                 WHERE collection_id = ?1 ORDER BY added_at ASC, resource_id ASC",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Move a collection under a new parent (or to the root with `None`).
    /// Rejects cycles.
    pub fn set_parent(&self, id: &str, new_parent: Option<&str>) -> Result<()> {
        let now = self.kernel.now();
        let id_owned = id.to_string();
        let new_parent = new_parent.map(str::to_string);

        self.kernel.commit(move |tx, _fx| {
            if let Some(parent) = &new_parent {
                ensure_no_cycle(tx, parent, &id_owned)?;
            }
            let affected = tx.execute(
                "UPDATE collections SET parent_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id_owned, new_parent, format_ts(now)],
            )?;
            if affected == 0 {
                return Err(CoreError::NotFound(format!("collection {id_owned}")));
            }
            Ok(())
        })
    }

    /// Add a resource to a collection; members are unique, re-adding is a
    /// no-op. Recomputes the aggregate and emits `collection.updated`.
    pub fn add_resource(&self, collection_id: &str, resource_id: &str) -> Result<()> {
        let now = self.kernel.now();
        let collection_id = collection_id.to_string();
        let resource_id = resource_id.to_string();

        self.kernel.commit(move |tx, fx| {
            if crate::resource::read_resource(tx, &resource_id)?.is_none() {
                return Err(CoreError::NotFound(format!("resource {resource_id}")));
            }
            tx.execute(
                "INSERT OR IGNORE INTO collection_members (collection_id, resource_id, added_at)
                 VALUES (?1, ?2, ?3)",
                params![collection_id, resource_id, format_ts(now)],
            )?;
            recompute_aggregate(tx, &collection_id)?;
            tx.execute(
                "UPDATE collections SET updated_at = ?2 WHERE id = ?1",
                params![collection_id, format_ts(now)],
            )?;
            fx.emit(Event::new(
                topics::COLLECTION_UPDATED,
                serde_json::json!({
                    "collection_id": collection_id,
                    "resource_id": resource_id,
                }),
            ));
            Ok(())
        })
    }

    /// Remove a resource from a collection.
    pub fn remove_resource(&self, collection_id: &str, resource_id: &str) -> Result<()> {
        let now = self.kernel.now();
        let collection_id = collection_id.to_string();
        let resource_id = resource_id.to_string();

        self.kernel.commit(move |tx, fx| {
            tx.execute(
                "DELETE FROM collection_members WHERE collection_id = ?1 AND resource_id = ?2",
                params![collection_id, resource_id],
            )?;
            recompute_aggregate(tx, &collection_id)?;
            tx.execute(
                "UPDATE collections SET updated_at = ?2 WHERE id = ?1",
                params![collection_id, format_ts(now)],
            )?;
            fx.emit(Event::new(
                topics::COLLECTION_UPDATED,
                serde_json::json!({
                    "collection_id": collection_id,
                    "resource_id": resource_id,
                }),
            ));
            Ok(())
        })
    }

    /// Delete a collection; children are reparented to its parent, members
    /// drop via the foreign key.
    pub fn delete(&self, id: &str) -> Result<()> {
        let now = self.kernel.now();
        let id_owned = id.to_string();
        self.kernel.commit(move |tx, _fx| {
            let parent: Option<String> = tx
                .query_row(
                    "SELECT parent_id FROM collections WHERE id = ?1",
                    params![id_owned],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| CoreError::NotFound(format!("collection {id_owned}")))?;

            tx.execute(
                "UPDATE collections SET parent_id = ?2, updated_at = ?3 WHERE parent_id = ?1",
                params![id_owned, parent, format_ts(now)],
            )?;
            tx.execute("DELETE FROM collections WHERE id = ?1", params![id_owned])?;
            Ok(())
        })
    }
}
