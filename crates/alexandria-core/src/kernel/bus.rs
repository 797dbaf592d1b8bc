//! In-Process Event Bus
//!
//! Synchronous pub/sub: `emit` runs every subscriber for the event type in
//! registration order on the caller's thread, each wrapped in a panic
//! boundary so one handler cannot break the others. Delivery is best-effort,
//! once per emit per subscriber. Emission happens strictly after the
//! originating transaction commits (enforced by the kernel's effect buffer,
//! not by this module).
//!
//! Handlers must stay fast (<100 ms target); heavier work belongs on the
//! task queue.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

// ============================================================================
// EVENT TOPICS
// ============================================================================

/// Well-known event type names. Payloads are flat JSON maps with string ids
/// and a required RFC3339 `timestamp`.
pub mod topics {
    /// A resource row was created (status=pending)
    pub const RESOURCE_CREATED: &str = "resource.created";
    /// Resource metadata changed
    pub const RESOURCE_UPDATED: &str = "resource.updated";
    /// Archived content changed (lexical/dense/sparse views are stale)
    pub const RESOURCE_CONTENT_CHANGED: &str = "resource.content_changed";
    /// Classification predictions were stored
    pub const RESOURCE_CLASSIFIED: &str = "resource.classified";
    /// Quality dimensions were recomputed
    pub const RESOURCE_QUALITY_COMPUTED: &str = "resource.quality_computed";
    /// Resource and its derived data were removed
    pub const RESOURCE_DELETED: &str = "resource.deleted";
    /// Ingestion pipeline finished successfully
    pub const INGESTION_COMPLETED: &str = "ingestion.completed";
    /// Ingestion pipeline failed terminally
    pub const INGESTION_FAILED: &str = "ingestion.failed";
    /// An annotation was created
    pub const ANNOTATION_CREATED: &str = "annotation.created";
    /// Collection membership or aggregate changed
    pub const COLLECTION_UPDATED: &str = "collection.updated";
    /// Sparse model version mismatch between query and documents
    pub const SPARSE_MODEL_MISMATCH: &str = "sparse.model_mismatch";
    /// Invariant violation observed at runtime
    pub const SYSTEM_ERROR: &str = "system.error";
}

// ============================================================================
// EVENT
// ============================================================================

/// An event flowing through the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Dotted event type, e.g. `resource.created`
    pub event_type: String,
    /// Small serializable map; entity ids as strings
    pub payload: Value,
    /// When the event was emitted
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    /// Build an event, stamping `timestamp` into the payload if absent.
    pub fn new(event_type: impl Into<String>, mut payload: Value) -> Self {
        let emitted_at = Utc::now();
        if let Value::Object(ref mut map) = payload {
            map.entry("timestamp")
                .or_insert_with(|| Value::String(emitted_at.to_rfc3339()));
        }
        Self {
            event_type: event_type.into(),
            payload,
            emitted_at,
        }
    }

    /// Convenience: event with a single `resource_id` field.
    pub fn for_resource(event_type: &str, resource_id: &str) -> Self {
        Self::new(
            event_type,
            serde_json::json!({ "resource_id": resource_id }),
        )
    }

    /// String field accessor on the payload.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

/// Audit record of one delivery, kept in a bounded in-memory ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Event type
    pub event_type: String,
    /// Payload as emitted
    pub payload: Value,
    /// Emission instant
    pub emitted_at: DateTime<Utc>,
    /// Subscribers invoked
    pub handlers_called: usize,
    /// Handlers that errored or panicked
    pub handler_errors: usize,
    /// Total delivery wall time, microseconds
    pub delivery_micros: u64,
}

/// Counters and latency percentiles for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMetrics {
    /// Events emitted
    pub events_emitted: u64,
    /// Handler invocations
    pub handlers_called: u64,
    /// Handler failures (swallowed)
    pub handler_errors: u64,
    /// Median delivery latency, microseconds
    pub p50_delivery_micros: u64,
    /// 95th percentile delivery latency, microseconds
    pub p95_delivery_micros: u64,
    /// 99th percentile delivery latency, microseconds
    pub p99_delivery_micros: u64,
}

// ============================================================================
// BUS
// ============================================================================

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    name: String,
    handler: Handler,
}

const LATENCY_WINDOW: usize = 1024;
const HISTORY_WINDOW: usize = 256;

/// The in-process event bus.
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    events_emitted: AtomicU64,
    handlers_called: AtomicU64,
    handler_errors: AtomicU64,
    latencies: Mutex<VecDeque<u64>>,
    history: Mutex<VecDeque<EventRecord>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            events_emitted: AtomicU64::new(0),
            handlers_called: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_WINDOW)),
        }
    }

    /// Register a handler for an event type. Handlers run in registration
    /// order; the name shows up in error logs.
    pub fn subscribe<F>(&self, event_type: &str, name: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut subs = self.subscribers.write().expect("bus lock poisoned");
        subs.entry(event_type.to_string())
            .or_default()
            .push(Subscriber {
                name: name.to_string(),
                handler: Arc::new(handler),
            });
    }

    /// Number of subscribers registered for a type.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .expect("bus lock poisoned")
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Deliver an event to every subscriber of its type, in registration
    /// order. Panics and errors are swallowed and counted; `emit` itself
    /// never fails. Returns the number of handlers invoked.
    pub fn emit(&self, event: Event) -> usize {
        let started = Instant::now();

        // Snapshot handlers so subscribers can themselves emit without
        // deadlocking on the registry lock.
        let handlers: Vec<(String, Handler)> = {
            let subs = self.subscribers.read().expect("bus lock poisoned");
            subs.get(&event.event_type)
                .map(|list| {
                    list.iter()
                        .map(|s| (s.name.clone(), Arc::clone(&s.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut errors = 0usize;
        for (name, handler) in &handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                errors += 1;
                tracing::warn!(
                    event_type = %event.event_type,
                    handler = %name,
                    "event handler panicked; continuing with remaining handlers"
                );
            }
        }

        let elapsed = started.elapsed().as_micros() as u64;
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        self.handlers_called
            .fetch_add(handlers.len() as u64, Ordering::Relaxed);
        self.handler_errors
            .fetch_add(errors as u64, Ordering::Relaxed);

        {
            let mut latencies = self.latencies.lock().expect("bus lock poisoned");
            if latencies.len() == LATENCY_WINDOW {
                latencies.pop_front();
            }
            latencies.push_back(elapsed);
        }
        {
            let mut history = self.history.lock().expect("bus lock poisoned");
            if history.len() == HISTORY_WINDOW {
                history.pop_front();
            }
            history.push_back(EventRecord {
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
                emitted_at: event.emitted_at,
                handlers_called: handlers.len(),
                handler_errors: errors,
                delivery_micros: elapsed,
            });
        }

        handlers.len()
    }

    /// Recent deliveries, oldest first.
    pub fn history(&self) -> Vec<EventRecord> {
        self.history
            .lock()
            .expect("bus lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Current counters and latency percentiles.
    pub fn metrics(&self) -> BusMetrics {
        let latencies = self.latencies.lock().expect("bus lock poisoned");
        let mut sorted: Vec<u64> = latencies.iter().copied().collect();
        sorted.sort_unstable();

        BusMetrics {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            handlers_called: self.handlers_called.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            p50_delivery_micros: percentile(&sorted, 0.50),
            p95_delivery_micros: percentile(&sorted, 0.95),
            p99_delivery_micros: percentile(&sorted, 0.99),
        }
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(topics::RESOURCE_CREATED, &format!("h{i}"), move |_| {
                order.lock().unwrap().push(i);
            });
        }

        let called = bus.emit(Event::for_resource(topics::RESOURCE_CREATED, "r1"));
        assert_eq!(called, 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_handler_does_not_break_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(topics::RESOURCE_DELETED, "boom", |_| panic!("boom"));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe(topics::RESOURCE_DELETED, "counter", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.emit(Event::for_resource(topics::RESOURCE_DELETED, "r1"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().handler_errors, 1);
    }

    #[test]
    fn test_emit_count_matches_subscribers() {
        let bus = EventBus::new();
        bus.subscribe(topics::RESOURCE_CREATED, "a", |_| {});
        bus.subscribe(topics::RESOURCE_CREATED, "b", |_| {});

        let delivered = bus.emit(Event::for_resource(topics::RESOURCE_CREATED, "r1"));
        assert_eq!(delivered, bus.subscriber_count(topics::RESOURCE_CREATED));
    }

    #[test]
    fn test_timestamp_stamped_into_payload() {
        let event = Event::new(topics::RESOURCE_CREATED, serde_json::json!({"resource_id": "x"}));
        assert!(event.payload.get("timestamp").is_some());
    }

    #[test]
    fn test_history_and_metrics() {
        let bus = EventBus::new();
        bus.subscribe(topics::RESOURCE_UPDATED, "noop", |_| {});
        bus.emit(Event::for_resource(topics::RESOURCE_UPDATED, "r1"));
        bus.emit(Event::for_resource(topics::RESOURCE_UPDATED, "r2"));

        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].handlers_called, 1);

        let metrics = bus.metrics();
        assert_eq!(metrics.events_emitted, 2);
        assert_eq!(metrics.handlers_called, 2);
        assert_eq!(metrics.handler_errors, 0);
    }

    #[test]
    fn test_emit_with_no_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(Event::for_resource("nobody.cares", "r1")), 0);
    }
}
