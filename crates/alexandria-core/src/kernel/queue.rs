//! Durable Task Queue
//!
//! SQLite-backed background work: tasks carry a routing type, a JSON payload,
//! a priority (0-9, higher first), an `earliest_run_at` countdown, and a
//! bounded retry budget with exponential backoff (base 10 s, cap 10 min).
//! Workers pull by priority within a queue, FIFO on ties; exhausted tasks
//! move to `dead` with their last error.
//!
//! Handlers MUST be idempotent: the queue retries, it never deduplicates.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::kernel::clock::Clock;
use crate::storage::{format_ts, parse_ts, Store};

// ============================================================================
// TASK KINDS
// ============================================================================

/// Well-known task types with declared payload shapes.
pub mod kinds {
    /// `{resource_id, url}` — run the full ingestion pipeline
    pub const INGEST_PROCESS: &str = "ingest.process";
    /// `{resource_id}` — regenerate dense + sparse vectors
    pub const EMBEDDING_REGENERATE: &str = "embedding.regenerate";
    /// `{resource_id}` — recompute the quality score
    pub const QUALITY_RECOMPUTE: &str = "quality.recompute";
    /// `{resource_id}` — upsert/delete the lexical document
    pub const LEXICAL_UPDATE_INDEX: &str = "lexical.update_index";
    /// `{resource_id}` — refresh graph edges for a node
    pub const GRAPH_UPDATE_EDGES: &str = "graph.update_edges";
    /// `{resource_id}` — extract citation candidates from the archive
    pub const CITATION_EXTRACT: &str = "citation.extract";
    /// `{}` — resolve unresolved citations against known resources
    pub const CITATION_RESOLVE: &str = "citation.resolve";
    /// `{}` — recompute PageRank importance over resolved citations
    pub const CITATION_PAGERANK: &str = "citation.pagerank";
    /// `{resource_id}` — run the classifier and store predictions
    pub const CLASSIFY_RESOURCE: &str = "classify.resource";
    /// `{pattern}` — drop cache entries matching the pattern
    pub const CACHE_INVALIDATE: &str = "cache.invalidate";
    /// `{user_id}` — recompute a user interest profile
    pub const RECOMMENDATION_REFRESH_PROFILE: &str = "recommendation.refresh_profile";
    /// `{}` — fine-tune the classifier from accumulated manual examples
    pub const CLASSIFIER_RETRAIN: &str = "classifier.retrain";
}

/// Named queues with their conventional priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    /// p9 — index convergence, cache invalidation
    Urgent,
    /// p7 — embedding regeneration
    HighPriority,
    /// p5 — general background work
    Default,
    /// p5 — model inference and training
    MlTasks,
    /// p3 — bulk/periodic jobs
    Batch,
}

impl QueueName {
    /// Queue column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Urgent => "urgent",
            QueueName::HighPriority => "high_priority",
            QueueName::Default => "default",
            QueueName::MlTasks => "ml_tasks",
            QueueName::Batch => "batch",
        }
    }

    /// Conventional priority for this queue.
    pub fn priority(&self) -> u8 {
        match self {
            QueueName::Urgent => 9,
            QueueName::HighPriority => 7,
            QueueName::Default | QueueName::MlTasks => 5,
            QueueName::Batch => 3,
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker
    Queued,
    /// Claimed by a worker
    Running,
    /// Finished successfully
    Succeeded,
    /// Failed, awaiting its backoff retry
    Failed,
    /// Retry budget exhausted
    Dead,
}

impl TaskStatus {
    fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }

    fn parse(s: &str) -> TaskStatus {
        match s {
            "running" => TaskStatus::Running,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            "dead" => TaskStatus::Dead,
            _ => TaskStatus::Queued,
        }
    }
}

// ============================================================================
// REQUESTS AND TASKS
// ============================================================================

/// A task to enqueue, produced inside a transaction and flushed post-commit.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Routing key
    pub task_type: String,
    /// JSON payload with the declared shape for the type
    pub payload: Value,
    /// Destination queue
    pub queue: QueueName,
    /// 0-9, higher runs earlier
    pub priority: u8,
    /// Delay before the task becomes runnable
    pub countdown_secs: u64,
    /// Retry budget
    pub max_attempts: u32,
}

impl TaskRequest {
    /// Generic constructor; queue priority and default retry budget applied.
    pub fn new(task_type: &str, payload: Value, queue: QueueName, countdown_secs: u64) -> Self {
        Self {
            task_type: task_type.to_string(),
            payload,
            queue,
            priority: queue.priority(),
            countdown_secs,
            max_attempts: 3,
        }
    }

    /// `ingest.process` — default queue, immediate.
    pub fn ingest_process(resource_id: &str, url: &str) -> Self {
        Self::new(
            kinds::INGEST_PROCESS,
            serde_json::json!({ "resource_id": resource_id, "url": url }),
            QueueName::Default,
            0,
        )
    }

    /// `embedding.regenerate` — priority 7, countdown 5 s.
    pub fn embedding_regenerate(resource_id: &str) -> Self {
        Self::new(
            kinds::EMBEDDING_REGENERATE,
            serde_json::json!({ "resource_id": resource_id }),
            QueueName::HighPriority,
            5,
        )
    }

    /// `quality.recompute` — priority 5, countdown 10 s.
    pub fn quality_recompute(resource_id: &str) -> Self {
        Self::new(
            kinds::QUALITY_RECOMPUTE,
            serde_json::json!({ "resource_id": resource_id }),
            QueueName::Default,
            10,
        )
    }

    /// `lexical.update_index` — priority 9, countdown 1 s.
    pub fn lexical_update_index(resource_id: &str) -> Self {
        Self::new(
            kinds::LEXICAL_UPDATE_INDEX,
            serde_json::json!({ "resource_id": resource_id }),
            QueueName::Urgent,
            1,
        )
    }

    /// `graph.update_edges` — priority 5, countdown 30 s.
    pub fn graph_update_edges(resource_id: &str) -> Self {
        Self::new(
            kinds::GRAPH_UPDATE_EDGES,
            serde_json::json!({ "resource_id": resource_id }),
            QueueName::Default,
            30,
        )
    }

    /// `citation.extract` — priority 5, immediate.
    pub fn citation_extract(resource_id: &str) -> Self {
        Self::new(
            kinds::CITATION_EXTRACT,
            serde_json::json!({ "resource_id": resource_id }),
            QueueName::Default,
            0,
        )
    }

    /// `citation.resolve` — batch queue.
    pub fn citation_resolve() -> Self {
        Self::new(kinds::CITATION_RESOLVE, serde_json::json!({}), QueueName::Batch, 0)
    }

    /// `citation.pagerank` — batch queue.
    pub fn citation_pagerank() -> Self {
        Self::new(kinds::CITATION_PAGERANK, serde_json::json!({}), QueueName::Batch, 0)
    }

    /// `classify.resource` — priority 5, countdown 20 s.
    pub fn classify_resource(resource_id: &str) -> Self {
        Self::new(
            kinds::CLASSIFY_RESOURCE,
            serde_json::json!({ "resource_id": resource_id }),
            QueueName::MlTasks,
            20,
        )
    }

    /// `cache.invalidate` — priority 9, immediate.
    pub fn cache_invalidate(pattern: &str) -> Self {
        Self::new(
            kinds::CACHE_INVALIDATE,
            serde_json::json!({ "pattern": pattern }),
            QueueName::Urgent,
            0,
        )
    }

    /// `recommendation.refresh_profile` — priority 3.
    pub fn refresh_profile(user_id: &str) -> Self {
        Self::new(
            kinds::RECOMMENDATION_REFRESH_PROFILE,
            serde_json::json!({ "user_id": user_id }),
            QueueName::Batch,
            0,
        )
    }

    /// `classifier.retrain` — ml_tasks queue.
    pub fn classifier_retrain() -> Self {
        Self::new(kinds::CLASSIFIER_RETRAIN, serde_json::json!({}), QueueName::MlTasks, 0)
    }
}

/// A stored task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task id
    pub id: String,
    /// Routing key
    pub task_type: String,
    /// JSON payload
    pub payload: Value,
    /// Queue name
    pub queue: String,
    /// 0-9, higher runs earlier
    pub priority: u8,
    /// Not runnable before this instant
    pub earliest_run_at: chrono::DateTime<chrono::Utc>,
    /// Delivery attempts so far
    pub attempts: u32,
    /// Retry budget
    pub max_attempts: u32,
    /// Lifecycle state
    pub status: TaskStatus,
    /// Error from the most recent failed attempt
    pub last_error: Option<String>,
}

impl Task {
    /// String field accessor on the payload.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
        let earliest: String = row.get("earliest_run_at")?;
        let status: String = row.get("status")?;
        let payload: String = row.get("payload")?;
        Ok(Task {
            id: row.get("id")?,
            task_type: row.get("task_type")?,
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            queue: row.get("queue")?,
            priority: row.get::<_, i64>("priority")? as u8,
            earliest_run_at: parse_ts(&earliest).unwrap_or_else(|_| chrono::Utc::now()),
            attempts: row.get::<_, i64>("attempts")? as u32,
            max_attempts: row.get::<_, i64>("max_attempts")? as u32,
            status: TaskStatus::parse(&status),
            last_error: row.get("last_error")?,
        })
    }
}

/// Queue depth snapshot for the monitoring surface.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Tasks waiting
    pub queued: u64,
    /// Tasks claimed by workers
    pub running: u64,
    /// Tasks finished successfully
    pub succeeded: u64,
    /// Tasks dead-lettered
    pub dead: u64,
}

// ============================================================================
// QUEUE
// ============================================================================

/// Backoff base, seconds.
const BACKOFF_BASE_SECS: u64 = 10;
/// Backoff cap, seconds (10 minutes).
const BACKOFF_CAP_SECS: u64 = 600;

/// The durable task queue client.
pub struct TaskQueue {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    /// Create a queue client over the shared store.
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Enqueue a task; returns its id.
    pub fn enqueue(&self, request: TaskRequest) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.now();
        let earliest = now + ChronoDuration::seconds(request.countdown_secs as i64);

        let ((), _fx) = self.store.with_write(|tx, _fx| {
            tx.execute(
                "INSERT INTO tasks (id, task_type, payload, queue, priority, earliest_run_at,
                                    attempts, max_attempts, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, 'queued', ?8, ?8)",
                params![
                    id,
                    request.task_type,
                    request.payload.to_string(),
                    request.queue.as_str(),
                    request.priority as i64,
                    format_ts(earliest),
                    request.max_attempts as i64,
                    format_ts(now),
                ],
            )?;
            Ok(())
        })?;
        Ok(id)
    }

    /// Claim the next runnable task: highest priority first, FIFO on ties.
    /// Returns `None` when nothing is runnable yet.
    pub fn claim_next(&self) -> Result<Option<Task>> {
        let now = format_ts(self.clock.now());
        let (task, _fx) = self.store.with_write(|tx, _fx| {
            let task = tx
                .query_row(
                    "SELECT * FROM tasks
                     WHERE status IN ('queued', 'failed') AND earliest_run_at <= ?1
                     ORDER BY priority DESC, rowid ASC
                     LIMIT 1",
                    params![now],
                    Task::from_row,
                )
                .optional()?;

            if let Some(ref task) = task {
                tx.execute(
                    "UPDATE tasks SET status = 'running', attempts = attempts + 1, updated_at = ?2
                     WHERE id = ?1",
                    params![task.id, now],
                )?;
            }
            Ok(task.map(|mut t| {
                t.status = TaskStatus::Running;
                t.attempts += 1;
                t
            }))
        })?;
        Ok(task)
    }

    /// Mark a task finished.
    pub fn complete(&self, task_id: &str) -> Result<()> {
        let now = format_ts(self.clock.now());
        self.store.with_write(|tx, _fx| {
            tx.execute(
                "UPDATE tasks SET status = 'succeeded', updated_at = ?2 WHERE id = ?1",
                params![task_id, now],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Record a failed attempt: reschedule with exponential backoff while the
    /// retry budget lasts, then dead-letter with the last error.
    pub fn fail(&self, task: &Task, error: &str) -> Result<()> {
        let now = self.clock.now();
        if task.attempts >= task.max_attempts {
            tracing::warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                attempts = task.attempts,
                error,
                "task exhausted retries; dead-lettering"
            );
            self.store.with_write(|tx, _fx| {
                tx.execute(
                    "UPDATE tasks SET status = 'dead', last_error = ?2, updated_at = ?3
                     WHERE id = ?1",
                    params![task.id, error, format_ts(now)],
                )?;
                Ok(())
            })?;
            return Ok(());
        }

        let delay = backoff_secs(task.attempts);
        let earliest = now + ChronoDuration::seconds(delay as i64);
        tracing::debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
            retry_in_secs = delay,
            error,
            "task failed; rescheduling"
        );
        self.store.with_write(|tx, _fx| {
            tx.execute(
                "UPDATE tasks SET status = 'failed', last_error = ?2,
                                  earliest_run_at = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![task.id, error, format_ts(earliest), format_ts(now)],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Mark a task dead without consuming retries (no handler registered).
    pub fn dead_letter(&self, task_id: &str, error: &str) -> Result<()> {
        let now = format_ts(self.clock.now());
        self.store.with_write(|tx, _fx| {
            tx.execute(
                "UPDATE tasks SET status = 'dead', last_error = ?2, updated_at = ?3 WHERE id = ?1",
                params![task_id, error, now],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Fetch a task by id.
    pub fn get(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.with_read(|conn| {
            Ok(conn
                .query_row("SELECT * FROM tasks WHERE id = ?1", params![task_id], Task::from_row)
                .optional()?)
        })
    }

    /// Depth counters by status.
    pub fn stats(&self) -> Result<QueueStats> {
        self.store.with_read(|conn| {
            let mut stats = QueueStats::default();
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM tasks GROUP BY status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                let count = count as u64;
                match status.as_str() {
                    "queued" | "failed" => stats.queued += count,
                    "running" => stats.running += count,
                    "succeeded" => stats.succeeded += count,
                    "dead" => stats.dead += count,
                    _ => {}
                }
            }
            Ok(stats)
        })
    }

    /// Drain-and-run every runnable task synchronously on the calling thread
    /// until the queue is quiet. Deterministic alternative to the worker pool
    /// for tests and single-threaded embedding.
    pub fn run_until_quiet(&self, handlers: &HandlerRegistry, max_steps: usize) -> Result<usize> {
        let mut processed = 0;
        for _ in 0..max_steps {
            let Some(task) = self.claim_next()? else {
                break;
            };
            run_one(self, handlers, &task);
            processed += 1;
        }
        Ok(processed)
    }
}

/// Exponential backoff for the nth attempt (1-based): 10 s, 20 s, 40 s ...
/// capped at 10 minutes.
fn backoff_secs(attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    (BACKOFF_BASE_SECS << shift).min(BACKOFF_CAP_SECS)
}

// ============================================================================
// HANDLERS AND WORKER POOL
// ============================================================================

/// A background task handler. Must be idempotent for its payload: the queue
/// redelivers after crashes and never deduplicates.
pub trait TaskHandler: Send + Sync {
    /// Process one task. Errors reschedule the task with backoff.
    fn handle(&self, task: &Task) -> Result<()>;
}

impl<F> TaskHandler for F
where
    F: Fn(&Task) -> Result<()> + Send + Sync,
{
    fn handle(&self, task: &Task) -> Result<()> {
        self(task)
    }
}

/// Routing table from task type to handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type; last registration wins.
    pub fn register(&mut self, task_type: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.to_string(), handler);
    }

    /// Look up the handler for a type.
    pub fn get(&self, task_type: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_type)
    }
}

fn run_one(queue: &TaskQueue, handlers: &HandlerRegistry, task: &Task) {
    let Some(handler) = handlers.get(&task.task_type) else {
        tracing::warn!(task_type = %task.task_type, "no handler registered; dead-lettering");
        let _ = queue.dead_letter(&task.id, "no handler registered");
        return;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(task)));
    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = queue.complete(&task.id) {
                tracing::warn!(task_id = %task.id, error = %e, "failed to mark task complete");
            }
        }
        Ok(Err(e)) => {
            let _ = queue.fail(task, &e.to_string());
        }
        Err(_) => {
            let _ = queue.fail(task, "handler panicked");
        }
    }
}

/// Pool of worker threads polling the queue.
pub struct WorkerPool {
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads against the queue with the given routing table.
    pub fn start(queue: Arc<TaskQueue>, handlers: Arc<HandlerRegistry>, workers: usize) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers.max(1) {
            let queue = Arc::clone(&queue);
            let handlers = Arc::clone(&handlers);
            let shutdown = Arc::clone(&shutdown);

            let handle = std::thread::Builder::new()
                .name(format!("task-worker-{worker_id}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        match queue.claim_next() {
                            Ok(Some(task)) => run_one(&queue, &handlers, &task),
                            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                            Err(e) => {
                                tracing::warn!(error = %e, "queue poll failed");
                                std::thread::sleep(Duration::from_millis(200));
                            }
                        }
                    }
                })
                .expect("spawn worker thread");
            handles.push(handle);
        }

        Self { shutdown, handles }
    }

    /// Signal shutdown and join all workers.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::clock::ManualClock;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn test_queue() -> (Arc<TaskQueue>, Arc<ManualClock>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(Some(dir.path().join("q.db"))).unwrap());
        let clock = Arc::new(ManualClock::starting_at(Utc::now()));
        let queue = Arc::new(TaskQueue::new(store, clock.clone()));
        (queue, clock, dir)
    }

    #[test]
    fn test_priority_then_fifo_ordering() {
        let (queue, _clock, _dir) = test_queue();

        queue.enqueue(TaskRequest::quality_recompute("r1")).unwrap(); // p5
        queue.enqueue(TaskRequest::cache_invalidate("x:*")).unwrap(); // p9
        queue.enqueue(TaskRequest::refresh_profile("u1")).unwrap(); // p3

        let first = queue.claim_next().unwrap().unwrap();
        assert_eq!(first.task_type, kinds::CACHE_INVALIDATE);
        let second = queue.claim_next().unwrap().unwrap();
        assert_eq!(second.task_type, kinds::QUALITY_RECOMPUTE);
        let third = queue.claim_next().unwrap().unwrap();
        assert_eq!(third.task_type, kinds::RECOMMENDATION_REFRESH_PROFILE);
    }

    #[test]
    fn test_countdown_delays_claim() {
        let (queue, clock, _dir) = test_queue();

        queue.enqueue(TaskRequest::graph_update_edges("r1")).unwrap(); // 30 s countdown
        assert!(queue.claim_next().unwrap().is_none());

        clock.advance(ChronoDuration::seconds(31));
        let task = queue.claim_next().unwrap().unwrap();
        assert_eq!(task.task_type, kinds::GRAPH_UPDATE_EDGES);
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_secs(1), 10);
        assert_eq!(backoff_secs(2), 20);
        assert_eq!(backoff_secs(3), 40);
        assert_eq!(backoff_secs(10), 600); // capped at 10 min
    }

    #[test]
    fn test_fail_reschedules_then_dead_letters() {
        let (queue, clock, _dir) = test_queue();

        queue.enqueue(TaskRequest::cache_invalidate("x:*")).unwrap();

        // Attempt 1 fails -> rescheduled with 10 s backoff
        let task = queue.claim_next().unwrap().unwrap();
        queue.fail(&task, "boom").unwrap();
        assert!(queue.claim_next().unwrap().is_none());
        clock.advance(ChronoDuration::seconds(11));

        // Attempt 2 fails -> 20 s backoff
        let task = queue.claim_next().unwrap().unwrap();
        assert_eq!(task.attempts, 2);
        queue.fail(&task, "boom").unwrap();
        clock.advance(ChronoDuration::seconds(21));

        // Attempt 3 fails -> budget (3) exhausted -> dead
        let task = queue.claim_next().unwrap().unwrap();
        assert_eq!(task.attempts, 3);
        queue.fail(&task, "final boom").unwrap();

        clock.advance(ChronoDuration::seconds(3600));
        assert!(queue.claim_next().unwrap().is_none());

        let stored = queue.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Dead);
        assert_eq!(stored.last_error.as_deref(), Some("final boom"));
    }

    #[test]
    fn test_run_until_quiet_dispatches() {
        let (queue, _clock, _dir) = test_queue();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut handlers = HandlerRegistry::new();
        {
            let hits = Arc::clone(&hits);
            handlers.register(
                kinds::CACHE_INVALIDATE,
                Arc::new(move |_task: &Task| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        queue.enqueue(TaskRequest::cache_invalidate("a:*")).unwrap();
        queue.enqueue(TaskRequest::cache_invalidate("b:*")).unwrap();

        let processed = queue.run_until_quiet(&handlers, 100).unwrap();
        assert_eq!(processed, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(queue.stats().unwrap().succeeded, 2);
    }

    #[test]
    fn test_unknown_type_dead_letters_immediately() {
        let (queue, _clock, _dir) = test_queue();
        let id = queue
            .enqueue(TaskRequest::new("no.such.type", serde_json::json!({}), QueueName::Default, 0))
            .unwrap();

        let handlers = HandlerRegistry::new();
        queue.run_until_quiet(&handlers, 10).unwrap();

        let stored = queue.get(&id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Dead);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let (queue, _clock, _dir) = test_queue();
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            kinds::CACHE_INVALIDATE,
            Arc::new(|_task: &Task| -> Result<()> { panic!("handler bug") }),
        );

        let id = queue.enqueue(TaskRequest::cache_invalidate("x:*")).unwrap();
        queue.run_until_quiet(&handlers, 10).unwrap();

        let stored = queue.get(&id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("handler panicked"));
    }

    #[test]
    fn test_worker_pool_processes_and_shuts_down() {
        let (queue, _clock, _dir) = test_queue();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut handlers = HandlerRegistry::new();
        {
            let hits = Arc::clone(&hits);
            handlers.register(
                kinds::CACHE_INVALIDATE,
                Arc::new(move |_task: &Task| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        queue.enqueue(TaskRequest::cache_invalidate("a:*")).unwrap();

        let pool = WorkerPool::start(Arc::clone(&queue), Arc::new(handlers), 2);
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        pool.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
