//! Journey: quality scoring, outlier detection, degradation monitoring.

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::{FetchedDocument, ResourceUpdate};
use chrono::{Duration, Utc};

fn good_article(n: usize) -> FetchedDocument {
    FetchedDocument {
        title: Some(format!("Retrieval Methods Part {n}")),
        description: Some(format!(
            "A thorough survey of retrieval and ranking methods, part {n}, \
             covering search indexing and evaluation practice in depth."
        )),
        text: format!(
            "Retrieval ranking search indexing methods volume {n}. \
             We evaluate search systems and ranking quality. See Figure 1."
        ),
        language: Some("en".to_string()),
        published_at: Some(Utc::now() - Duration::days(200)),
        ..Default::default()
    }
}

fn seeded() -> (TestEngine, String) {
    let harness = TestEngine::new();

    harness
        .engine
        .taxonomy
        .create(
            "Retrieval",
            None,
            None,
            vec![
                "retrieval".to_string(),
                "ranking".to_string(),
                "search".to_string(),
                "indexing".to_string(),
            ],
            true,
        )
        .unwrap();

    for n in 0..6 {
        harness.ingest_document(&format!("https://example.com/good-{n}"), good_article(n));
    }

    // The outlier: no description, ancient publication date, nothing the
    // classifier recognizes, no citations.
    let bad = harness.ingest_document(
        "https://example.com/stale",
        FetchedDocument {
            title: Some("Untitled Scan".to_string()),
            description: None,
            text: "zxqv blorp unrelated fragment".to_string(),
            published_at: Some(Utc::now() - Duration::days(35 * 365)),
            ..Default::default()
        },
    );

    (harness, bad.id)
}

#[test]
fn outlier_detection_flags_the_degenerate_resource_with_reasons() {
    let (harness, bad_id) = seeded();

    let reports = harness.engine.outliers.detect().unwrap();
    let report = reports
        .iter()
        .find(|r| r.resource_id == bad_id)
        .expect("degenerate resource flagged");

    for reason in ["low_completeness", "low_timeliness", "low_relevance"] {
        assert!(
            report.reasons.iter().any(|r| r == reason),
            "missing reason {reason}, got {:?}",
            report.reasons
        );
    }

    let stored = harness.engine.resources.get(&bad_id).unwrap();
    assert!(stored.needs_quality_review);
}

#[test]
fn quality_dimensions_are_all_in_range() {
    let (harness, bad_id) = seeded();

    let stored = harness.engine.resources.get(&bad_id).unwrap();
    let quality = stored.quality.expect("quality computed");
    for value in quality.as_array() {
        assert!((0.0..=1.0).contains(&value), "dimension out of range: {value}");
    }
    assert!((0.0..=1.0).contains(&stored.quality_overall.unwrap()));
}

#[test]
fn recompute_is_idempotent_under_a_frozen_clock() {
    let (harness, bad_id) = seeded();

    let first = harness.engine.quality.compute_quality(&bad_id, None).unwrap();
    let second = harness.engine.quality.compute_quality(&bad_id, None).unwrap();
    assert!((first.overall - second.overall).abs() < 1e-12);
}

#[test]
fn degradation_monitor_flags_a_large_drop() {
    let (harness, _) = seeded();

    // A healthy resource degrades: description gone, publication date now
    // known to be ancient
    let victim = harness.ingest_document("https://example.com/victim", good_article(99));
    let before = harness
        .engine
        .resources
        .get(&victim.id)
        .unwrap()
        .quality_overall
        .unwrap();

    harness
        .engine
        .resources
        .update(
            &victim.id,
            &ResourceUpdate {
                description: Some(String::new()),
                published_at: Some(Utc::now() - Duration::days(30 * 365)),
                ..Default::default()
            },
        )
        .unwrap();
    harness.drain();
    let after = harness
        .engine
        .quality
        .compute_quality(&victim.id, None)
        .unwrap()
        .overall;
    assert!(after < before);

    let degraded = harness
        .engine
        .quality_monitor
        .degraded_resources(None)
        .unwrap();
    assert!(
        degraded.iter().any(|d| d.resource_id == victim.id),
        "drop {before} -> {after} not flagged"
    );
}
