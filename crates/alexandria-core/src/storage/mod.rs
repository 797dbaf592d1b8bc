//! Store Handle
//!
//! Writer + reader SQLite connections behind mutexes, so every module takes
//! `&Store` and the engine stays `Send + Sync`. All writes run inside a
//! transaction through [`Store::with_write`], which also collects the
//! *post-commit effects* (events to emit, tasks to enqueue): if the commit
//! fails, nothing is emitted or enqueued. The kernel flushes the effects.

pub mod migrations;

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, Transaction};

use crate::error::{CoreError, Result};
use crate::kernel::bus::Event;
use crate::kernel::queue::TaskRequest;

/// Canonical timestamp format for TEXT columns: fixed-width RFC3339 UTC so
/// lexicographic comparison in SQL matches chronological order.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a TEXT column written by [`format_ts`].
pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Internal(format!("bad timestamp {s:?}: {e}")))
}

/// Deferred side effects of a committed transaction.
#[derive(Debug, Default)]
pub struct Effects {
    /// Events to emit after commit, in causal order.
    pub events: Vec<Event>,
    /// Tasks to enqueue after commit.
    pub tasks: Vec<TaskRequest>,
}

impl Effects {
    /// Record an event for post-commit emission.
    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Record a task for post-commit enqueue.
    pub fn enqueue(&mut self, task: TaskRequest) {
        self.tasks.push(task);
    }
}

/// The shared store handle.
pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Store {
    /// Apply PRAGMAs to a connection.
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at the given path; `None` resolves to the
    /// platform data directory.
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => {
                if let Some(dir) = p.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                p
            }
            None => {
                let proj_dirs = ProjectDirs::from("org", "neo-alexandria", "core").ok_or_else(
                    || CoreError::Internal("could not determine project directories".to_string()),
                )?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("alexandria.db")
            }
        };

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;
        migrations::apply_migrations(&writer)?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    /// Run a read-only closure on the reader connection.
    pub fn with_read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .reader
            .lock()
            .map_err(|_| CoreError::Internal("reader lock poisoned".to_string()))?;
        f(&conn)
    }

    /// Run a closure inside a write transaction. On success the transaction
    /// commits and the collected [`Effects`] are returned to the caller for
    /// flushing; on error the transaction rolls back and no effects escape.
    pub fn with_write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &mut Effects) -> Result<T>,
    ) -> Result<(T, Effects)> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| CoreError::Internal("writer lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let mut effects = Effects::default();
        let value = f(&tx, &mut effects)?;
        tx.commit()?;
        Ok((value, effects))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(Some(dir.path().join("test.db"))).unwrap();
        (store, dir)
    }

    #[test]
    fn test_open_applies_migrations() {
        let (store, _dir) = open_store();
        let count: u32 = store
            .with_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_failed_write_rolls_back_and_drops_effects() {
        let (store, _dir) = open_store();

        let result: Result<((), Effects)> = store.with_write(|tx, fx| {
            tx.execute(
                "INSERT INTO resources (id, source_url, normalized_url, created_at, updated_at)
                 VALUES ('r1', 'http://a', 'http://a', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )?;
            fx.emit(Event::for_resource("resource.created", "r1"));
            Err(CoreError::Validation("forced failure".to_string()))
        });
        assert!(result.is_err());

        let count: u32 = store
            .with_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_successful_write_returns_effects() {
        let (store, _dir) = open_store();

        let ((), fx) = store
            .with_write(|tx, fx| {
                tx.execute(
                    "INSERT INTO resources (id, source_url, normalized_url, created_at, updated_at)
                     VALUES ('r1', 'http://a', 'http://a', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                fx.emit(Event::for_resource("resource.created", "r1"));
                Ok(())
            })
            .unwrap();

        assert_eq!(fx.events.len(), 1);
        assert_eq!(fx.events[0].event_type, "resource.created");
    }
}
