//! Journey: interaction logging, profiles, and recommendation strategies.

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::{FetchedDocument, InteractionKind, Strategy};

fn ml_article(n: usize) -> FetchedDocument {
    TestEngine::article(
        &format!("Neural Training Methods {n}"),
        "neural network training optimization gradients",
        "neural network training optimization gradients backpropagation models",
    )
}

fn cooking_article(n: usize) -> FetchedDocument {
    TestEngine::article(
        &format!("Sourdough Techniques {n}"),
        "flour water salt fermentation baking",
        "flour water salt fermentation baking oven crumb starter",
    )
}

fn seeded() -> (TestEngine, Vec<String>, Vec<String>) {
    let harness = TestEngine::new();
    let mut ml_ids = Vec::new();
    let mut cooking_ids = Vec::new();

    for n in 0..6 {
        let resource =
            harness.ingest_document(&format!("https://example.com/ml-{n}"), ml_article(n));
        ml_ids.push(resource.id);
    }
    for n in 0..3 {
        let resource = harness
            .ingest_document(&format!("https://example.com/cook-{n}"), cooking_article(n));
        cooking_ids.push(resource.id);
    }
    (harness, ml_ids, cooking_ids)
}

#[test]
fn content_strategy_follows_the_interest_profile() {
    let (harness, ml_ids, cooking_ids) = seeded();

    // u1 strongly engages with five ML articles
    for id in &ml_ids[..5] {
        harness
            .engine
            .profiles
            .record_interaction("u1", id, InteractionKind::Rating, 1.0)
            .unwrap();
    }
    harness.drain();

    let profile = harness.engine.profiles.profile("u1").unwrap();
    assert!(profile.interest_vector.is_some());
    assert!(profile.interaction_count >= 5);

    let recommendations = harness
        .engine
        .recommender
        .recommend("u1", 5, Some(Strategy::Content), None, None)
        .unwrap();
    assert!(!recommendations.is_empty());

    // Interacted resources are excluded
    for rec in &recommendations {
        assert!(!ml_ids[..5].contains(&rec.resource_id));
    }

    // The unseen ML article outranks the cooking ones
    let ml_rank = recommendations
        .iter()
        .position(|r| r.resource_id == ml_ids[5])
        .expect("unseen ML article recommended");
    for cook in &cooking_ids {
        if let Some(cook_rank) = recommendations.iter().position(|r| &r.resource_id == cook) {
            assert!(ml_rank < cook_rank, "cooking outranked the profile match");
        }
    }
}

#[test]
fn hybrid_works_for_cold_start_users() {
    let (harness, ml_ids, _) = seeded();

    // Two interactions: below the collaborative threshold
    for id in &ml_ids[..2] {
        harness
            .engine
            .profiles
            .record_interaction("newcomer", id, InteractionKind::View, 0.8)
            .unwrap();
    }
    harness.drain();

    let recommendations = harness
        .engine
        .recommender
        .recommend("newcomer", 5, None, None, None)
        .unwrap();
    assert!(!recommendations.is_empty());
    for rec in &recommendations {
        assert!(!ml_ids[..2].contains(&rec.resource_id));
        assert!((0.0..=1.0).contains(&rec.novelty_score));
        // Cold-start blends never include a collaborative component
        assert!(!rec.strategy_scores.contains_key("collaborative"));
    }
}

#[test]
fn min_quality_filters_the_pool() {
    let (harness, _, _) = seeded();

    harness
        .engine
        .profiles
        .record_interaction("picky", &harness.engine.resources.list(
            &Default::default(), 1, 0, Default::default(), Default::default(),
        ).unwrap().0[0].id, InteractionKind::View, 0.9)
        .unwrap();
    harness.drain();

    let strict = harness
        .engine
        .recommender
        .recommend("picky", 10, None, None, Some(0.99))
        .unwrap();
    assert!(strict.is_empty(), "no resource clears quality 0.99");
}

#[test]
fn diversity_preference_changes_the_selection() {
    let (harness, ml_ids, _) = seeded();

    for id in &ml_ids[..5] {
        harness
            .engine
            .profiles
            .record_interaction("u2", id, InteractionKind::Rating, 1.0)
            .unwrap();
    }
    harness.drain();

    // Both calls succeed and return ranked, deduplicated lists
    for diversity in [0.0, 0.9] {
        let recommendations = harness
            .engine
            .recommender
            .recommend("u2", 4, None, Some(diversity), None)
            .unwrap();
        let mut ids: Vec<&str> = recommendations.iter().map(|r| r.resource_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), recommendations.len());
    }
}

#[test]
fn annotation_creation_feeds_the_interaction_log() {
    let (harness, ml_ids, _) = seeded();

    harness
        .engine
        .annotations
        .create(&alexandria_core::AnnotationInput {
            resource_id: ml_ids[0].clone(),
            start_offset: 0,
            end_offset: 6,
            note: None,
            tags: vec![],
            color: None,
            owner: "reader".to_string(),
            shared: false,
        })
        .unwrap();

    let interactions = harness.engine.profiles.interactions("reader").unwrap();
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].kind, InteractionKind::Annotation);
    assert_eq!(interactions[0].resource_id, ml_ids[0]);
}
