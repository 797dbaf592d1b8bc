//! Lexical Index
//!
//! FTS5-backed full-text search keyed by resource id. Field-weighted BM25:
//! title matches dominate, description counts more than body. The index is
//! eventually consistent with the resource store; updates arrive through
//! priority-URGENT `lexical.update_index` tasks with a ≤5 s convergence
//! target.

use std::sync::Arc;

use rusqlite::params;

use crate::error::Result;
use crate::storage::Store;

/// BM25 weight for the title column.
pub const TITLE_WEIGHT: f64 = 3.0;
/// BM25 weight for the description column.
pub const DESCRIPTION_WEIGHT: f64 = 1.5;
/// BM25 weight for the body column.
pub const BODY_WEIGHT: f64 = 1.0;

/// The tokenizable view of a resource.
#[derive(Debug, Clone, Default)]
pub struct LexicalDocument {
    /// Resource title
    pub title: String,
    /// Resource description
    pub description: String,
    /// Archived body text
    pub body: String,
}

/// Escape user text into a safe FTS5 MATCH expression: each alphanumeric
/// token double-quoted, tokens OR-ed together. Returns `None` when nothing
/// searchable remains.
pub fn sanitize_fts5_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// The lexical index over the shared store.
pub struct LexicalIndex {
    store: Arc<Store>,
}

impl LexicalIndex {
    /// Create the index handle.
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Insert or replace the document for a resource.
    pub fn upsert(&self, resource_id: &str, document: &LexicalDocument) -> Result<()> {
        self.store.with_write(|tx, _fx| {
            tx.execute(
                "DELETE FROM lexical_fts WHERE resource_id = ?1",
                params![resource_id],
            )?;
            tx.execute(
                "INSERT INTO lexical_fts (resource_id, title, description, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![resource_id, document.title, document.description, document.body],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Remove a resource from the index. Idempotent.
    pub fn delete(&self, resource_id: &str) -> Result<()> {
        self.store.with_write(|tx, _fx| {
            tx.execute(
                "DELETE FROM lexical_fts WHERE resource_id = ?1",
                params![resource_id],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Ranked search. Scores are negated BM25 (higher is better). An
    /// unsearchable query yields no results rather than an FTS5 error.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(String, f32)>> {
        let Some(match_expr) = sanitize_fts5_query(query) else {
            return Ok(Vec::new());
        };

        self.store.with_read(|conn| {
            let sql = format!(
                "SELECT resource_id,
                        -bm25(lexical_fts, 0.0, {TITLE_WEIGHT}, {DESCRIPTION_WEIGHT}, {BODY_WEIGHT})
                            AS score
                 FROM lexical_fts
                 WHERE lexical_fts MATCH ?1
                 ORDER BY score DESC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![match_expr, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)? as f32))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Number of documents containing the exact term. Feeds the adaptive
    /// weighting rule for single-token queries.
    pub fn doc_count(&self, term: &str) -> Result<usize> {
        let Some(match_expr) = sanitize_fts5_query(term) else {
            return Ok(0);
        };
        self.store.with_read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM lexical_fts WHERE lexical_fts MATCH ?1",
                params![match_expr],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Number of indexed documents.
    pub fn len(&self) -> Result<usize> {
        self.store.with_read(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM lexical_fts", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_index() -> (LexicalIndex, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("lex.db"))).unwrap());
        (LexicalIndex::new(store), dir)
    }

    fn doc(title: &str, description: &str, body: &str) -> LexicalDocument {
        LexicalDocument {
            title: title.to_string(),
            description: description.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_sanitize_query() {
        assert_eq!(
            sanitize_fts5_query("deep learning"),
            Some("\"deep\" OR \"learning\"".to_string())
        );
        assert_eq!(
            sanitize_fts5_query("c++ \"quoted\" (parens)"),
            Some("\"c\" OR \"quoted\" OR \"parens\"".to_string())
        );
        assert_eq!(sanitize_fts5_query("!!! ???"), None);
    }

    #[test]
    fn test_upsert_and_search() {
        let (index, _dir) = test_index();
        index
            .upsert("r1", &doc("Rust systems", "memory safety", "borrow checker details"))
            .unwrap();
        index
            .upsert("r2", &doc("Gardening", "tomatoes", "soil and water"))
            .unwrap();

        let results = index.search("rust", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "r1");
        assert!(results[0].1 > 0.0);
    }

    #[test]
    fn test_title_outweighs_body() {
        let (index, _dir) = test_index();
        index
            .upsert("title-hit", &doc("quixotic ventures", "", "other text entirely"))
            .unwrap();
        index
            .upsert("body-hit", &doc("other text", "", "quixotic appears in the body"))
            .unwrap();

        let results = index.search("quixotic", 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "title-hit");
    }

    #[test]
    fn test_upsert_replaces_and_delete_removes() {
        let (index, _dir) = test_index();
        index.upsert("r1", &doc("alpha", "", "")).unwrap();
        index.upsert("r1", &doc("beta", "", "")).unwrap();

        assert!(index.search("alpha", 10).unwrap().is_empty());
        assert_eq!(index.search("beta", 10).unwrap().len(), 1);
        assert_eq!(index.len().unwrap(), 1);

        index.delete("r1").unwrap();
        assert!(index.search("beta", 10).unwrap().is_empty());
        // Deleting again is a no-op
        index.delete("r1").unwrap();
    }

    #[test]
    fn test_unsearchable_query_is_empty_not_error() {
        let (index, _dir) = test_index();
        index.upsert("r1", &doc("alpha", "", "")).unwrap();
        assert!(index.search("(((", 10).unwrap().is_empty());
    }
}
