//! Database Migrations
//!
//! Versioned schema definitions for the store. Applied in order on the
//! writer connection at startup; `schema_version` tracks progress.

use rusqlite::Connection;

use crate::error::Result;

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Resources, archive blobs, vector sidecars, lexical FTS",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Annotations and collections",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Taxonomy tree, classification assignments, training log",
        up: MIGRATION_V3_UP,
    },
    Migration {
        version: 4,
        description: "Citations, interactions, user profiles, quality history, task queue",
        up: MIGRATION_V4_UP,
    },
];

/// V1: resource aggregate and its derived blobs
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    creator TEXT,
    publisher TEXT,
    source_url TEXT NOT NULL,
    normalized_url TEXT NOT NULL,
    language TEXT,
    resource_type TEXT,
    subjects TEXT NOT NULL DEFAULT '[]',
    classification_code TEXT,
    identifier TEXT,
    read_status TEXT NOT NULL DEFAULT 'unread',
    ingestion_status TEXT NOT NULL DEFAULT 'pending',
    ingestion_error TEXT,

    -- Quality dimensions, written by the quality engine
    quality_accuracy REAL,
    quality_completeness REAL,
    quality_consistency REAL,
    quality_timeliness REAL,
    quality_relevance REAL,
    quality_overall REAL,
    needs_quality_review INTEGER NOT NULL DEFAULT 0,
    needs_classification_review INTEGER NOT NULL DEFAULT 0,

    -- Model versions stamped by enrichment
    embedding_model TEXT,
    sparse_model TEXT,
    classifier_model TEXT,

    published_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    ingestion_started_at TEXT,
    ingestion_completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_resources_status ON resources(ingestion_status);
CREATE INDEX IF NOT EXISTS idx_resources_classification ON resources(classification_code);
CREATE INDEX IF NOT EXISTS idx_resources_normalized_url ON resources(normalized_url);
CREATE INDEX IF NOT EXISTS idx_resources_updated ON resources(updated_at);
CREATE INDEX IF NOT EXISTS idx_resources_quality ON resources(quality_overall);

-- Extracted plain text of the fetched content
CREATE TABLE IF NOT EXISTS archives (
    resource_id TEXT PRIMARY KEY REFERENCES resources(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'text',
    created_at TEXT NOT NULL
);

-- Dense vector sidecar (little-endian f32 blob, unit norm)
CREATE TABLE IF NOT EXISTS dense_vectors (
    resource_id TEXT PRIMARY KEY REFERENCES resources(id) ON DELETE CASCADE,
    vector BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Learned sparse vector sidecar (JSON term-id -> weight)
CREATE TABLE IF NOT EXISTS sparse_vectors (
    resource_id TEXT PRIMARY KEY REFERENCES resources(id) ON DELETE CASCADE,
    weights TEXT NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Full-text index over title/description/body, updated via URGENT tasks
CREATE VIRTUAL TABLE IF NOT EXISTS lexical_fts USING fts5(
    resource_id UNINDEXED,
    title,
    description,
    body,
    tokenize = 'porter unicode61'
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

/// V2: annotations and collections
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS annotations (
    id TEXT PRIMARY KEY,
    resource_id TEXT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    start_offset INTEGER NOT NULL,
    end_offset INTEGER NOT NULL,
    highlighted_text TEXT NOT NULL,
    note TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    color TEXT,
    owner TEXT NOT NULL,
    shared INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_annotations_resource ON annotations(resource_id);
CREATE INDEX IF NOT EXISTS idx_annotations_owner ON annotations(owner);

CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    visibility TEXT NOT NULL DEFAULT 'private',
    parent_id TEXT REFERENCES collections(id),
    owner TEXT NOT NULL,
    aggregate_embedding BLOB,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS collection_members (
    collection_id TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    resource_id TEXT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    added_at TEXT NOT NULL,
    PRIMARY KEY (collection_id, resource_id)
);

CREATE INDEX IF NOT EXISTS idx_collection_members_resource ON collection_members(resource_id);
"#;

/// V3: taxonomy and classification
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS taxonomy_nodes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    slug TEXT NOT NULL,
    parent_id TEXT REFERENCES taxonomy_nodes(id),
    level INTEGER NOT NULL,
    path TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    allow_resources INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (parent_id, slug)
);

CREATE INDEX IF NOT EXISTS idx_taxonomy_path ON taxonomy_nodes(path);

CREATE TABLE IF NOT EXISTS taxonomy_assignments (
    resource_id TEXT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    node_id TEXT NOT NULL REFERENCES taxonomy_nodes(id) ON DELETE CASCADE,
    confidence REAL NOT NULL,
    source TEXT NOT NULL,
    model_version TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (resource_id, node_id)
);

CREATE INDEX IF NOT EXISTS idx_assignments_node ON taxonomy_assignments(node_id);

CREATE TABLE IF NOT EXISTS training_examples (
    id TEXT PRIMARY KEY,
    resource_id TEXT NOT NULL,
    node_ids TEXT NOT NULL,
    created_at TEXT NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0
);
"#;

/// V4: citation network, interactions, profiles, quality history, durable tasks
const MIGRATION_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS citations (
    id TEXT PRIMARY KEY,
    source_resource_id TEXT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    target_url TEXT NOT NULL,
    normalized_url TEXT NOT NULL,
    target_resource_id TEXT REFERENCES resources(id) ON DELETE SET NULL,
    cite_type TEXT NOT NULL DEFAULT 'general',
    context TEXT NOT NULL DEFAULT '',
    position INTEGER NOT NULL DEFAULT 0,
    importance REAL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_citations_source ON citations(source_resource_id);
CREATE INDEX IF NOT EXISTS idx_citations_target ON citations(target_resource_id);
CREATE INDEX IF NOT EXISTS idx_citations_normalized ON citations(normalized_url);

-- Append-only interaction log; intentionally no FK so history survives deletes
CREATE TABLE IF NOT EXISTS interactions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    strength REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interactions_user ON interactions(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_interactions_resource ON interactions(resource_id);

CREATE TABLE IF NOT EXISTS user_profiles (
    user_id TEXT PRIMARY KEY,
    interest_vector BLOB,
    topic_weights TEXT NOT NULL DEFAULT '{}',
    interaction_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quality_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_id TEXT NOT NULL REFERENCES resources(id) ON DELETE CASCADE,
    overall REAL NOT NULL,
    computed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_quality_history_resource ON quality_history(resource_id, computed_at);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    queue TEXT NOT NULL DEFAULT 'default',
    priority INTEGER NOT NULL DEFAULT 5,
    earliest_run_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    status TEXT NOT NULL DEFAULT 'queued',
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority, earliest_run_at);
"#;

/// Apply all pending migrations on the given connection.
pub fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, chrono::Utc::now().to_rfc3339()],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly_and_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());

        // Core tables exist
        for table in ["resources", "archives", "tasks", "taxonomy_nodes", "citations"] {
            let count: u32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}
