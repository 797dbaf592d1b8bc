//! Shared Kernel
//!
//! The one-stop wiring point for cross-cutting machinery: store handle,
//! event bus, task queue, cache, clock, and model gateways. Constructed once
//! and passed into modules; no hidden singletons.
//!
//! Kernel invariants:
//! - every store write runs inside a transaction,
//! - events are emitted after successful commit,
//! - task enqueue is also post-commit.
//!
//! [`Kernel::commit`] makes those invariants structural: closures record
//! events/tasks into an effect buffer that only flushes once the transaction
//! has committed.

pub mod bus;
pub mod cache;
pub mod clock;
pub mod gateway;
pub mod queue;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Transaction;

use crate::config::Settings;
use crate::error::Result;
use crate::storage::{Effects, Store};

pub use bus::{Event, EventBus};
pub use cache::TtlCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use gateway::{
    EmbeddingGateway, HashingEmbedder, OverlapReranker, RerankGateway, SparseEncoder,
    SparseVector, TermWeightEncoder,
};
pub use queue::{HandlerRegistry, Task, TaskHandler, TaskQueue, TaskRequest, WorkerPool};

// ============================================================================
// DEADLINE
// ============================================================================

/// A hard deadline handed to every external call. Derived from the request
/// deadline so cancellation propagates through gateways.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `ms` milliseconds from now.
    pub fn from_millis(ms: u64) -> Self {
        Self {
            at: Instant::now() + Duration::from_millis(ms),
        }
    }

    /// Time left, zero-floored.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// True once the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

// ============================================================================
// KERNEL
// ============================================================================

/// Shared services handed to every module.
pub struct Kernel {
    /// The canonical store.
    pub store: Arc<Store>,
    /// In-process event bus.
    pub bus: Arc<EventBus>,
    /// Durable task queue client.
    pub queue: Arc<TaskQueue>,
    /// Keyed TTL cache.
    pub cache: Arc<TtlCache>,
    /// Injected clock.
    pub clock: Arc<dyn Clock>,
    /// Dense embedding gateway.
    pub embedder: Arc<dyn EmbeddingGateway>,
    /// Learned sparse encoder gateway.
    pub sparse_encoder: Arc<dyn SparseEncoder>,
    /// Cross-encoder reranker gateway.
    pub reranker: Arc<dyn RerankGateway>,
    /// Validated engine settings.
    pub settings: Settings,
}

impl Kernel {
    /// Run a closure inside a write transaction and, once it commits, flush
    /// the recorded effects: emit events in causal order, then enqueue tasks.
    /// A failed commit flushes nothing.
    pub fn commit<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &mut Effects) -> Result<T>,
    ) -> Result<T> {
        let (value, effects) = self.store.with_write(f)?;
        self.flush(effects);
        Ok(value)
    }

    /// Emit events and enqueue tasks collected by a committed transaction.
    /// Best-effort: an enqueue failure is logged, never propagated, because
    /// the originating commit already happened.
    pub fn flush(&self, effects: Effects) {
        for event in effects.events {
            self.bus.emit(event);
        }
        for task in effects.tasks {
            if let Err(e) = self.queue.enqueue(task) {
                tracing::warn!(error = %e, "post-commit task enqueue failed");
            }
        }
    }

    /// Current time from the injected clock.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

// ============================================================================
// TESTS
// ============================================================================
