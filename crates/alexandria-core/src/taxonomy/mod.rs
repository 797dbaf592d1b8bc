//! Taxonomy Tree
//!
//! Materialized-path hierarchy: every node stores its full slug path
//! (`/cs/ml/dl`) and level (segments − 1), so ancestor queries are an
//! O(depth) path split and descendant queries a single prefix lookup.
//! Moves rewrite the whole subtree's paths in one transaction; deletes
//! either reparent children to the grandparent or cascade, and both refuse
//! while any node in the affected subtree still has resource assignments.

mod active;
mod classifier;

pub use active::{
    uncertainty, ActiveLearning, StaticTrainer, TrainedClassifier, Trainer, TrainingExample,
    TrainingMetrics, UncertainResource,
};
pub use classifier::{
    Assignment, Classifier, ClassifierModel, KeywordClassifier, LabelInfo, Prediction,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kernel::Kernel;
use crate::storage::{format_ts, parse_ts};

/// A taxonomy node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyNode {
    /// Node id
    pub id: String,
    /// Display name
    pub name: String,
    /// URL-safe segment, unique among siblings
    pub slug: String,
    /// Parent node, `None` for roots
    pub parent_id: Option<String>,
    /// Depth: path segment count − 1 (roots are 0)
    pub level: u32,
    /// Materialized slug path, e.g. `/cs/ml/dl`
    pub path: String,
    /// Keywords feeding the classifier
    pub keywords: Vec<String>,
    /// Whether resources may be assigned here
    pub allow_resources: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<TaxonomyNode> {
    let keywords: String = row.get("keywords")?;
    let created: String = row.get("created_at")?;
    let updated: String = row.get("updated_at")?;
    Ok(TaxonomyNode {
        id: row.get("id")?,
        name: row.get("name")?,
        slug: row.get("slug")?,
        parent_id: row.get("parent_id")?,
        level: row.get::<_, i64>("level")? as u32,
        path: row.get("path")?,
        keywords: serde_json::from_str(&keywords).unwrap_or_default(),
        allow_resources: row.get::<_, i64>("allow_resources")? != 0,
        created_at: parse_ts(&created).unwrap_or_else(|_| Utc::now()),
        updated_at: parse_ts(&updated).unwrap_or_else(|_| Utc::now()),
    })
}

/// Derive a slug from a display name: lowercase, alphanumeric runs joined
/// by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

fn read_node(conn: &Connection, id: &str) -> Result<Option<TaxonomyNode>> {
    Ok(conn
        .query_row(
            "SELECT * FROM taxonomy_nodes WHERE id = ?1",
            params![id],
            node_from_row,
        )
        .optional()?)
}

fn require_node(conn: &Connection, id: &str) -> Result<TaxonomyNode> {
    read_node(conn, id)?.ok_or_else(|| CoreError::NotFound(format!("taxonomy node {id}")))
}

/// Slug collision among siblings. The UNIQUE constraint misses NULL-parent
/// roots, so both cases are checked here.
fn sibling_slug_taken(
    conn: &Connection,
    parent_id: Option<&str>,
    slug: &str,
    excluding: Option<&str>,
) -> Result<bool> {
    let existing: Option<String> = match parent_id {
        Some(parent) => conn
            .query_row(
                "SELECT id FROM taxonomy_nodes WHERE parent_id = ?1 AND slug = ?2",
                params![parent, slug],
                |row| row.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT id FROM taxonomy_nodes WHERE parent_id IS NULL AND slug = ?1",
                params![slug],
                |row| row.get(0),
            )
            .optional()?,
    };
    Ok(match existing {
        Some(id) => excluding != Some(id.as_str()),
        None => false,
    })
}

/// Whether any node in the subtree rooted at `node` has assignments.
fn subtree_has_resources(tx: &Transaction<'_>, node: &TaxonomyNode) -> Result<bool> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM taxonomy_assignments ta
         JOIN taxonomy_nodes tn ON tn.id = ta.node_id
         WHERE tn.path = ?1 OR tn.path LIKE ?1 || '/%'",
        params![node.path],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Rewrite paths and levels for a node and all descendants after a move.
fn rewrite_subtree_paths(
    tx: &Transaction<'_>,
    old_path: &str,
    new_path: &str,
    level_delta: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "UPDATE taxonomy_nodes
         SET path = ?2 || substr(path, length(?1) + 1),
             level = level + ?3,
             updated_at = ?4
         WHERE path = ?1 OR path LIKE ?1 || '/%'",
        params![old_path, new_path, level_delta, format_ts(now)],
    )?;
    Ok(())
}

/// The taxonomy store service.
pub struct TaxonomyStore {
    kernel: Arc<Kernel>,
}

impl TaxonomyStore {
    /// Create the service over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Create a node. The slug derives from the name unless given; it must
    /// be unique among siblings.
    pub fn create(
        &self,
        name: &str,
        slug: Option<&str>,
        parent_id: Option<&str>,
        keywords: Vec<String>,
        allow_resources: bool,
    ) -> Result<TaxonomyNode> {
        let slug = match slug {
            Some(s) => slugify(s),
            None => slugify(name),
        };
        if slug.is_empty() {
            return Err(CoreError::Validation(
                "taxonomy slug must contain alphanumeric characters".to_string(),
            ));
        }
        let now = self.kernel.now();
        let name = name.to_string();
        let parent_id = parent_id.map(str::to_string);

        self.kernel.commit(move |tx, _fx| {
            let (path, level, parent_ref) = match &parent_id {
                Some(parent) => {
                    let parent_node = require_node(tx, parent)?;
                    (
                        format!("{}/{slug}", parent_node.path),
                        parent_node.level + 1,
                        Some(parent.clone()),
                    )
                }
                None => (format!("/{slug}"), 0, None),
            };

            if sibling_slug_taken(tx, parent_ref.as_deref(), &slug, None)? {
                return Err(CoreError::Conflict(format!(
                    "slug {slug:?} already exists under this parent"
                )));
            }

            let node = TaxonomyNode {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                slug: slug.clone(),
                parent_id: parent_ref,
                level,
                path,
                keywords: keywords.clone(),
                allow_resources,
                created_at: now,
                updated_at: now,
            };

            tx.execute(
                "INSERT INTO taxonomy_nodes (id, name, slug, parent_id, level, path, keywords,
                                             allow_resources, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    node.id,
                    node.name,
                    node.slug,
                    node.parent_id,
                    node.level as i64,
                    node.path,
                    serde_json::to_string(&node.keywords)?,
                    node.allow_resources as i64,
                    format_ts(now),
                ],
            )?;
            Ok(node)
        })
    }

    /// Fetch a node or fail with NotFound.
    pub fn get(&self, id: &str) -> Result<TaxonomyNode> {
        self.kernel.store.with_read(|conn| require_node(conn, id))
    }

    /// Every node, path order (parents before children).
    pub fn tree(&self) -> Result<Vec<TaxonomyNode>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM taxonomy_nodes ORDER BY path ASC")?;
            let rows = stmt.query_map([], node_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Direct children of a node, slug order.
    pub fn children(&self, id: &str) -> Result<Vec<TaxonomyNode>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM taxonomy_nodes WHERE parent_id = ?1 ORDER BY slug ASC",
            )?;
            let rows = stmt.query_map(params![id], node_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Ancestors from root to parent: an O(depth) path split plus one
    /// lookup per prefix.
    pub fn ancestors(&self, id: &str) -> Result<Vec<TaxonomyNode>> {
        self.kernel.store.with_read(|conn| {
            let node = require_node(conn, id)?;
            let segments: Vec<&str> = node.path.split('/').filter(|s| !s.is_empty()).collect();

            let mut out = Vec::new();
            let mut prefix = String::new();
            for segment in &segments[..segments.len().saturating_sub(1)] {
                prefix.push('/');
                prefix.push_str(segment);
                let found = conn
                    .query_row(
                        "SELECT * FROM taxonomy_nodes WHERE path = ?1",
                        params![prefix],
                        node_from_row,
                    )
                    .optional()?;
                if let Some(ancestor) = found {
                    out.push(ancestor);
                }
            }
            Ok(out)
        })
    }

    /// All descendants via one prefix lookup, path order.
    pub fn descendants(&self, id: &str) -> Result<Vec<TaxonomyNode>> {
        self.kernel.store.with_read(|conn| {
            let node = require_node(conn, id)?;
            let mut stmt = conn.prepare(
                "SELECT * FROM taxonomy_nodes WHERE path LIKE ?1 || '/%' ORDER BY path ASC",
            )?;
            let rows = stmt.query_map(params![node.path], node_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Rename a node or adjust its keywords / assignability. The slug and
    /// position are immutable here; use [`TaxonomyStore::move_node`].
    pub fn update(
        &self,
        id: &str,
        name: Option<&str>,
        keywords: Option<Vec<String>>,
        allow_resources: Option<bool>,
    ) -> Result<TaxonomyNode> {
        let now = self.kernel.now();
        let id_owned = id.to_string();
        let name = name.map(str::to_string);

        self.kernel.commit(move |tx, _fx| {
            let mut node = require_node(tx, &id_owned)?;
            if let Some(name) = name {
                node.name = name;
            }
            if let Some(keywords) = keywords {
                node.keywords = keywords;
            }
            if let Some(allow) = allow_resources {
                node.allow_resources = allow;
            }
            node.updated_at = now;

            tx.execute(
                "UPDATE taxonomy_nodes SET name = ?2, keywords = ?3, allow_resources = ?4,
                        updated_at = ?5 WHERE id = ?1",
                params![
                    node.id,
                    node.name,
                    serde_json::to_string(&node.keywords)?,
                    node.allow_resources as i64,
                    format_ts(now),
                ],
            )?;
            Ok(node)
        })
    }

    /// Move a node (and its whole subtree) under a new parent, or to the
    /// root with `None`. Rejects cycles and sibling slug collisions;
    /// descendant paths and levels are rewritten atomically.
    pub fn move_node(&self, id: &str, new_parent_id: Option<&str>) -> Result<TaxonomyNode> {
        let now = self.kernel.now();
        let id_owned = id.to_string();
        let new_parent_id = new_parent_id.map(str::to_string);

        self.kernel.commit(move |tx, _fx| {
            let node = require_node(tx, &id_owned)?;

            let (new_parent_path, new_level) = match &new_parent_id {
                Some(parent) => {
                    if *parent == id_owned {
                        return Err(CoreError::Conflict(
                            "a node cannot be its own parent".to_string(),
                        ));
                    }
                    let parent_node = require_node(tx, parent)?;
                    if parent_node.path == node.path
                        || parent_node.path.starts_with(&format!("{}/", node.path))
                    {
                        return Err(CoreError::Conflict(
                            "cannot move a node under its own descendant".to_string(),
                        ));
                    }
                    (parent_node.path.clone(), parent_node.level + 1)
                }
                None => (String::new(), 0),
            };

            if sibling_slug_taken(tx, new_parent_id.as_deref(), &node.slug, Some(&id_owned))? {
                return Err(CoreError::Conflict(format!(
                    "slug {:?} already exists under the target parent",
                    node.slug
                )));
            }

            let new_path = format!("{new_parent_path}/{}", node.slug);
            let level_delta = new_level as i64 - node.level as i64;
            rewrite_subtree_paths(tx, &node.path, &new_path, level_delta, now)?;
            tx.execute(
                "UPDATE taxonomy_nodes SET parent_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id_owned, new_parent_id, format_ts(now)],
            )?;

            require_node(tx, &id_owned)
        })
    }

    /// Delete a node. `cascade = false` reparents children to the
    /// grandparent; `cascade = true` removes the whole subtree. Both refuse
    /// while the affected subtree still has resource assignments.
    pub fn delete(&self, id: &str, cascade: bool) -> Result<()> {
        let now = self.kernel.now();
        let id_owned = id.to_string();

        self.kernel.commit(move |tx, _fx| {
            let node = require_node(tx, &id_owned)?;

            if subtree_has_resources(tx, &node)? {
                return Err(CoreError::Conflict(
                    "nodes with assigned resources must be reclassified before deletion"
                        .to_string(),
                ));
            }

            if cascade {
                tx.execute(
                    "DELETE FROM taxonomy_nodes WHERE path LIKE ?1 || '/%'",
                    params![node.path],
                )?;
                tx.execute("DELETE FROM taxonomy_nodes WHERE id = ?1", params![id_owned])?;
                return Ok(());
            }

            // Reparent each child subtree one level up
            let children: Vec<TaxonomyNode> = {
                let mut stmt =
                    tx.prepare("SELECT * FROM taxonomy_nodes WHERE parent_id = ?1")?;
                let rows = stmt.query_map(params![id_owned], node_from_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                out
            };

            let grandparent_path = node
                .parent_id
                .as_deref()
                .map(|p| require_node(tx, p).map(|n| n.path))
                .transpose()?
                .unwrap_or_default();

            for child in children {
                if sibling_slug_taken(tx, node.parent_id.as_deref(), &child.slug, None)? {
                    return Err(CoreError::Conflict(format!(
                        "reparenting would collide on slug {:?}",
                        child.slug
                    )));
                }
                let new_child_path = format!("{grandparent_path}/{}", child.slug);
                rewrite_subtree_paths(tx, &child.path, &new_child_path, -1, now)?;
                tx.execute(
                    "UPDATE taxonomy_nodes SET parent_id = ?2, updated_at = ?3 WHERE id = ?1",
                    params![child.id, node.parent_id, format_ts(now)],
                )?;
            }

            tx.execute("DELETE FROM taxonomy_nodes WHERE id = ?1", params![id_owned])?;
            Ok(())
        })
    }

    /// Labels for the classifier: assignable nodes with their keywords.
    pub fn labels(&self) -> Result<Vec<LabelInfo>> {
        self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, path, keywords FROM taxonomy_nodes
                 WHERE allow_resources = 1 ORDER BY path ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let keywords: String = row.get(3)?;
                Ok(LabelInfo {
                    node_id: row.get(0)?,
                    name: row.get(1)?,
                    path: row.get(2)?,
                    keywords: serde_json::from_str(&keywords).unwrap_or_default(),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
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
    fn test_slugify() {
        assert_eq!(slugify("Machine Learning"), "machine-learning");
        assert_eq!(slugify("C++ & Rust!"), "c-rust");
        assert_eq!(slugify("  spaced  "), "spaced");
        assert_eq!(slugify("---"), "");
    }
}
