//! Journey: three-way hybrid search over a small corpus.

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::SearchRequest;

fn seeded_corpus() -> (TestEngine, String) {
    let harness = TestEngine::new();

    let r1 = harness.ingest_document(
        "https://example.com/r1",
        TestEngine::article(
            "An Unusual Venture",
            "Notes on an unusual venture into knowledge engines",
            "This body mentions the quixotic nature of building retrieval systems by hand.",
        ),
    );
    harness.ingest_document(
        "https://example.com/r2",
        TestEngine::article(
            "Deep Reinforcement Learning",
            "Transformers for deep reinforcement learning agents",
            "Deep reinforcement learning with transformers and policy gradients.",
        ),
    );
    harness.ingest_document(
        "https://example.com/r3",
        TestEngine::article(
            "Gardening Basics",
            "Soil, water, and sunlight for beginners",
            "Tomatoes want sun. Water deeply and mulch the soil.",
        ),
    );

    (harness, r1.id)
}

#[test]
fn rare_token_query_surfaces_its_document_first() {
    let (harness, r1) = seeded_corpus();

    let response = harness
        .engine
        .search
        .search(&SearchRequest {
            hybrid_weight: Some(0.5),
            ..SearchRequest::of("quixotic")
        })
        .unwrap();

    assert!(response.total >= 1);
    assert_eq!(response.results[0].resource_id, r1);
    assert!(response.results[0].snippet.to_lowercase().contains("quixotic"));

    // Fusion weights always renormalize to 1
    assert!((response.diagnostics.weights_used.sum() - 1.0).abs() < 1e-9);
}

#[test]
fn reranking_keeps_the_relevant_document_first() {
    let (harness, r1) = seeded_corpus();

    let response = harness
        .engine
        .search
        .search(&SearchRequest {
            enable_reranking: true,
            ..SearchRequest::of("quixotic")
        })
        .unwrap();

    assert_eq!(response.results[0].resource_id, r1);
    assert_eq!(response.diagnostics.reranker, "applied");
}

#[test]
fn adaptive_weighting_shifts_long_queries_toward_dense() {
    let (harness, _) = seeded_corpus();
    let query = "a very long multi term query about deep reinforcement learning transformers";

    let uniform = harness
        .engine
        .search
        .search(&SearchRequest::of(query))
        .unwrap();
    let adaptive = harness
        .engine
        .search
        .search(&SearchRequest {
            adaptive_weights: true,
            ..SearchRequest::of(query)
        })
        .unwrap();

    let weights = adaptive.diagnostics.weights_used;
    assert!(weights.dense > weights.lexical);
    assert!((weights.sum() - 1.0).abs() < 1e-9);

    // Lexical mass shrinks relative to the uniform run
    assert!(
        adaptive.diagnostics.method_contributions.lexical
            <= uniform.diagnostics.method_contributions.lexical + 1e-9
    );
}

#[test]
fn empty_corpus_returns_empty_page_and_facets() {
    let harness = TestEngine::new();
    let response = harness
        .engine
        .search
        .search(&SearchRequest::of("anything"))
        .unwrap();

    assert_eq!(response.total, 0);
    assert!(response.results.is_empty());
    assert!(response.facets.is_empty());
}

#[test]
fn blank_query_is_a_validation_error() {
    let harness = TestEngine::new();
    assert!(harness
        .engine
        .search
        .search(&SearchRequest::of("   "))
        .is_err());
}

#[test]
fn filters_apply_after_ranking_and_feed_facets() {
    let (harness, _) = seeded_corpus();

    let unfiltered = harness
        .engine
        .search
        .search(&SearchRequest::of("learning transformers soil"))
        .unwrap();
    assert!(unfiltered.total >= 2);
    assert!(!unfiltered.facets.language.is_empty());

    let filtered = harness
        .engine
        .search
        .search(&SearchRequest {
            filters: alexandria_core::ResourceFilters {
                language: Some("de".to_string()),
                ..Default::default()
            },
            ..SearchRequest::of("learning transformers soil")
        })
        .unwrap();
    assert_eq!(filtered.total, 0);
    assert!(filtered.results.is_empty());
}

#[test]
fn evaluate_reports_rank_metrics() {
    let (harness, r1) = seeded_corpus();

    let mut judgments = std::collections::HashMap::new();
    judgments.insert(r1, 1.0);

    let metrics = harness
        .engine
        .search
        .evaluate("quixotic", &judgments, 10)
        .unwrap();
    assert!((metrics.mrr - 1.0).abs() < 1e-9);
    assert!((metrics.recall - 1.0).abs() < 1e-9);
    assert!(metrics.ndcg > 0.99);
}

#[test]
fn compare_methods_returns_per_method_lists() {
    let (harness, r1) = seeded_corpus();
    let comparison = harness
        .engine
        .search
        .compare_methods("quixotic retrieval", 10)
        .unwrap();

    assert!(comparison.lexical.iter().any(|(id, _)| *id == r1));
    assert!(!comparison.dense.is_empty());
}
