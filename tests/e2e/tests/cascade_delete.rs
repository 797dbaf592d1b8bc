//! Journey: deleting a resource unwinds every derived structure.

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::{AnnotationInput, CoreError, SearchRequest, Visibility};

#[test]
fn delete_cascades_through_collections_annotations_citations_and_indices() {
    let harness = TestEngine::new();

    let shared_body = "Shared context about retrieval engines and ranking systems. \
                       Fusion of lexical and semantic signals improves recall.";
    let r1 = harness.ingest_document(
        "https://example.com/r1",
        TestEngine::article(
            "Retrieval Engines",
            "Fusion of lexical and semantic retrieval",
            shared_body,
        ),
    );
    let r2 = harness.ingest_document(
        "https://example.com/r2",
        TestEngine::article(
            "Ranking Systems",
            "Fusion of lexical and semantic ranking",
            &format!("{shared_body} See also https://example.com/r1 for background."),
        ),
    );

    // Collection membership with a live aggregate
    let collection = harness
        .engine
        .collections
        .create("Reading", "", Visibility::Private, None, "u1")
        .unwrap();
    harness
        .engine
        .collections
        .add_resource(&collection.id, &r1.id)
        .unwrap();
    assert_eq!(harness.engine.collections.members(&collection.id).unwrap(), vec![r1.id.clone()]);
    assert!(harness
        .engine
        .collections
        .get(&collection.id)
        .unwrap()
        .aggregate_embedding
        .is_some());

    // Annotation over the archived text
    let annotation = harness
        .engine
        .annotations
        .create(&AnnotationInput {
            resource_id: r1.id.clone(),
            start_offset: 0,
            end_offset: 14,
            note: Some("good intro".to_string()),
            tags: vec![],
            color: None,
            owner: "u1".to_string(),
            shared: false,
        })
        .unwrap();
    assert_eq!(annotation.highlighted_text, "Shared context");
    harness.drain();

    // Citation R2 -> R1 resolved during enrichment
    let citations = harness.engine.citations.citations_for(&r2.id).unwrap();
    assert_eq!(citations.outbound_count, 1);
    assert_eq!(
        citations.outbound[0].target_resource_id.as_deref(),
        Some(r1.id.as_str())
    );
    let inbound = harness.engine.citations.citations_for(&r1.id).unwrap();
    assert_eq!(inbound.inbound_count, 1);

    // Graph sees the near-duplicate neighbor
    let neighbors = harness.engine.graph.neighbors(&r2.id, 7).unwrap();
    assert!(neighbors.iter().any(|n| n.resource_id == r1.id));

    // ---- Delete R1 ----------------------------------------------------
    harness.engine.resources.delete(&r1.id).unwrap();
    harness.drain();

    // Resource gone
    assert!(matches!(
        harness.engine.resources.get(&r1.id),
        Err(CoreError::NotFound(_))
    ));

    // Collection no longer lists it; aggregate returned to null
    assert!(harness
        .engine
        .collections
        .members(&collection.id)
        .unwrap()
        .is_empty());
    assert!(harness
        .engine
        .collections
        .get(&collection.id)
        .unwrap()
        .aggregate_embedding
        .is_none());

    // Annotations are gone
    assert!(matches!(
        harness.engine.annotations.get(&annotation.id),
        Err(CoreError::NotFound(_))
    ));
    assert!(harness
        .engine
        .annotations
        .list_for_resource(&r1.id)
        .unwrap()
        .is_empty());

    // Citations from R2 lose their resolved target but keep the row
    let citations = harness.engine.citations.citations_for(&r2.id).unwrap();
    assert_eq!(citations.outbound_count, 1);
    assert!(citations.outbound[0].target_resource_id.is_none());

    // Graph no longer reaches R1
    let neighbors = harness.engine.graph.neighbors(&r2.id, 7).unwrap();
    assert!(neighbors.iter().all(|n| n.resource_id != r1.id));

    // Search no longer returns R1 (lexical converged via the urgent task)
    let response = harness
        .engine
        .search
        .search(&SearchRequest::of("retrieval engines"))
        .unwrap();
    assert!(response.results.iter().all(|hit| hit.resource_id != r1.id));
}

#[test]
fn deleting_twice_is_not_found() {
    let harness = TestEngine::new();
    let r1 = harness.ingest_document(
        "https://example.com/r1",
        TestEngine::article("One", "only one", "body text"),
    );
    harness.engine.resources.delete(&r1.id).unwrap();
    assert!(matches!(
        harness.engine.resources.delete(&r1.id),
        Err(CoreError::NotFound(_))
    ));
}
