//! Journey: event delivery guarantees, task idempotency, index convergence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::{Event, ResourceUpdate, SearchRequest, TaskRequest};

#[test]
fn every_subscriber_sees_every_emit() {
    let harness = TestEngine::new();
    let bus = &harness.engine.kernel.bus;

    let hits = Arc::new(AtomicUsize::new(0));
    for i in 0..3 {
        let hits = Arc::clone(&hits);
        bus.subscribe("custom.probe", &format!("probe-{i}"), move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    let delivered = bus.emit(Event::new("custom.probe", serde_json::json!({"id": "x"})));
    assert_eq!(delivered, bus.subscriber_count("custom.probe"));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn ingestion_emits_the_causal_event_sequence() {
    let harness = TestEngine::new();

    harness.ingest_document(
        "https://example.com/seq",
        TestEngine::article("Sequenced", "watching the event order", "body text here"),
    );

    let history = harness.engine.kernel.bus.history();
    let position = |event_type: &str| {
        history
            .iter()
            .position(|record| record.event_type == event_type)
    };

    let created = position("resource.created").expect("created emitted");
    let content = position("resource.content_changed").expect("content_changed emitted");
    let completed = position("ingestion.completed").expect("completed emitted");
    assert!(created < content && content < completed);

    // Downstream enrichment events follow completion
    let quality = position("resource.quality_computed").expect("quality event emitted");
    assert!(completed < quality);

    let metrics = harness.engine.kernel.bus.metrics();
    assert!(metrics.events_emitted >= 3);
    assert_eq!(metrics.handler_errors, 0);
}

#[test]
fn replaying_tasks_after_success_leaves_state_unchanged() {
    let harness = TestEngine::new();
    let resource = harness.ingest_document(
        "https://example.com/replay",
        TestEngine::article("Replayed", "idempotency check", "replay body content"),
    );

    let before = harness.engine.resources.get(&resource.id).unwrap();
    let vector_before = harness
        .engine
        .resources
        .dense_vector(&resource.id)
        .unwrap()
        .unwrap();

    // Replay the derived-state tasks wholesale
    for request in [
        TaskRequest::lexical_update_index(&resource.id),
        TaskRequest::embedding_regenerate(&resource.id),
        TaskRequest::quality_recompute(&resource.id),
        TaskRequest::graph_update_edges(&resource.id),
        TaskRequest::citation_extract(&resource.id),
    ] {
        harness.engine.kernel.queue.enqueue(request).unwrap();
    }
    harness.drain();

    let after = harness.engine.resources.get(&resource.id).unwrap();
    let vector_after = harness
        .engine
        .resources
        .dense_vector(&resource.id)
        .unwrap()
        .unwrap();

    assert_eq!(before.quality_overall, after.quality_overall);
    assert_eq!(before.classification_code, after.classification_code);
    assert_eq!(vector_before, vector_after);

    // The lexical index still holds exactly one document for the resource
    let hits = harness.engine.lexical.search("replayed", 10).unwrap();
    assert_eq!(hits.iter().filter(|(id, _)| *id == resource.id).count(), 1);
}

#[test]
fn lexical_index_converges_after_a_content_update() {
    let harness = TestEngine::new();
    let resource = harness.ingest_document(
        "https://example.com/mutating",
        TestEngine::article("Original Title", "description", "body"),
    );

    assert!(!harness.engine.lexical.search("zephyr", 10).unwrap().iter().any(|(id, _)| *id == resource.id));

    harness
        .engine
        .resources
        .update(
            &resource.id,
            &ResourceUpdate {
                title: Some("Zephyr Protocol".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    harness.drain();

    let hits = harness.engine.lexical.search("zephyr", 10).unwrap();
    assert!(hits.iter().any(|(id, _)| *id == resource.id));

    // Search reflects it too (query cache was invalidated by the update)
    let response = harness
        .engine
        .search
        .search(&SearchRequest::of("zephyr"))
        .unwrap();
    assert!(response.results.iter().any(|hit| hit.resource_id == resource.id));
}

#[test]
fn search_cache_serves_repeated_queries() {
    let harness = TestEngine::new();
    harness.ingest_document(
        "https://example.com/cached",
        TestEngine::article("Cached Article", "cache probe", "cache probe body"),
    );

    let request = SearchRequest::of("cache probe");
    harness.engine.search.search(&request).unwrap();
    let misses_after_first = harness.engine.kernel.cache.stats().misses;

    harness.engine.search.search(&request).unwrap();
    let stats = harness.engine.kernel.cache.stats();
    assert!(stats.hits >= 1);
    assert_eq!(stats.misses, misses_after_first);
}

#[test]
fn monitoring_snapshot_reflects_the_corpus() {
    let harness = TestEngine::new();
    harness.ingest_document(
        "https://example.com/mon-1",
        TestEngine::article("First", "one", "body one"),
    );
    harness.ingest_document(
        "https://example.com/mon-2",
        TestEngine::article("Second", "two", "body two"),
    );

    let snapshot = harness.engine.monitoring().unwrap();
    assert_eq!(snapshot.resources_total, 2);
    assert_eq!(snapshot.resources_completed, 2);
    assert_eq!(snapshot.dense_vectors, 2);
    assert_eq!(snapshot.sparse_documents, 2);
    assert_eq!(snapshot.lexical_documents, 2);
    assert!(snapshot.events.events_emitted > 0);
    assert!(snapshot.tasks.succeeded > 0);
    assert_eq!(snapshot.tasks.queued, 0);
}

#[test]
fn dead_lettered_tasks_keep_their_last_error() {
    let harness = TestEngine::new();

    // An ingest task for a registered resource row whose fetch always
    // fails permanently: the pipeline marks the resource failed and the
    // task itself succeeds at recording that.
    let resource = harness
        .engine
        .ingest
        .ingest("https://example.com/never-registered", &Default::default())
        .unwrap();
    harness.drain();

    let stats = harness.engine.kernel.queue.stats().unwrap();
    assert_eq!(stats.queued, 0);
    let status = harness.engine.resources.status(&resource.id).unwrap();
    assert!(status.ingestion_error.unwrap().contains("no document registered"));
}
