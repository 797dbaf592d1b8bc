//! Journey: ingest a URL, watch the pipeline enrich it end to end.

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::IngestionStatus;

#[test]
fn ingest_completes_with_vectors_classification_and_quality() {
    let harness = TestEngine::new();

    // Classifier needs labels before the pipeline runs
    harness
        .engine
        .taxonomy
        .create(
            "Machine Learning",
            None,
            None,
            vec![
                "neural".to_string(),
                "learning".to_string(),
                "training".to_string(),
                "models".to_string(),
            ],
            true,
        )
        .expect("create taxonomy node");

    let resource = harness.ingest_document(
        "https://example.com/ml-paper",
        TestEngine::article(
            "Training Neural Models",
            "A study of neural network training dynamics and learning curves",
            "We analyze training neural models across learning regimes. \
             Deep models require careful optimization.",
        ),
    );

    // Lifecycle reached completed with timestamps
    assert_eq!(resource.ingestion_status, IngestionStatus::Completed);
    let status = harness.engine.resources.status(&resource.id).unwrap();
    assert!(status.started_at.is_some());
    assert!(status.completed_at.is_some());
    assert!(status.ingestion_error.is_none());

    // Completed resources carry a unit-norm dense vector of the configured
    // dimension
    let vector = harness
        .engine
        .resources
        .dense_vector(&resource.id)
        .unwrap()
        .expect("dense vector stored");
    assert_eq!(
        vector.len(),
        harness.engine.kernel.settings.embedding_dimensions
    );
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-6, "norm was {norm}");

    // Classification produced at least one assignment above the floor
    let assignments = harness.engine.classifier.assignments(&resource.id).unwrap();
    assert!(!assignments.is_empty());
    assert!(assignments.iter().any(|a| a.confidence >= 0.30));

    // Quality landed in range
    let stored = harness.engine.resources.get(&resource.id).unwrap();
    let overall = stored.quality_overall.expect("quality computed");
    assert!((0.0..=1.0).contains(&overall));

    // Model versions were stamped
    assert!(stored.embedding_model.is_some());
    assert!(stored.sparse_model.is_some());
    assert!(stored.classifier_model.is_some());
}

#[test]
fn failed_fetch_marks_resource_failed_with_error() {
    let harness = TestEngine::new();

    // No document registered for this URL: the fetch fails permanently
    let resource = harness
        .engine
        .ingest
        .ingest("https://example.com/missing", &Default::default())
        .unwrap();
    assert_eq!(resource.ingestion_status, IngestionStatus::Pending);
    harness.drain();

    let status = harness.engine.resources.status(&resource.id).unwrap();
    assert_eq!(status.ingestion_status, IngestionStatus::Failed);
    assert!(status.ingestion_error.is_some());

    // No vectors were stored for the failed resource
    assert!(harness
        .engine
        .resources
        .dense_vector(&resource.id)
        .unwrap()
        .is_none());
}

#[test]
fn invalid_url_rejected_synchronously() {
    let harness = TestEngine::new();
    let result = harness.engine.ingest.ingest("not-a-url", &Default::default());
    assert!(result.is_err());
}
