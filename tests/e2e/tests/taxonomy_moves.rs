//! Journey: materialized-path maintenance under moves and deletes.

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::CoreError;

#[test]
fn move_rewrites_descendant_paths_atomically() {
    let harness = TestEngine::new();
    let taxonomy = &harness.engine.taxonomy;

    let cs = taxonomy.create("CS", None, None, vec![], true).unwrap();
    let ml = taxonomy
        .create("ML", None, Some(&cs.id), vec![], true)
        .unwrap();
    let dl = taxonomy
        .create("DL", None, Some(&ml.id), vec![], true)
        .unwrap();
    let rl = taxonomy
        .create("RL", None, Some(&dl.id), vec![], true)
        .unwrap();
    let ai = taxonomy.create("AI", None, None, vec![], true).unwrap();

    assert_eq!(taxonomy.get(&dl.id).unwrap().path, "/cs/ml/dl");
    assert_eq!(taxonomy.get(&rl.id).unwrap().path, "/cs/ml/dl/rl");

    // Move dl (and its subtree) under ai
    taxonomy.move_node(&dl.id, Some(&ai.id)).unwrap();

    let moved = taxonomy.get(&dl.id).unwrap();
    assert_eq!(moved.path, "/ai/dl");
    assert_eq!(moved.level, 1);

    let ancestors: Vec<String> = taxonomy
        .ancestors(&dl.id)
        .unwrap()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert_eq!(ancestors, vec![ai.id.clone()]);

    for descendant in taxonomy.descendants(&dl.id).unwrap() {
        assert!(descendant.path.starts_with("/ai/dl/"), "path {}", descendant.path);
    }
    assert_eq!(taxonomy.get(&rl.id).unwrap().level, 2);

    // Moving back restores every descendant path
    taxonomy.move_node(&dl.id, Some(&ml.id)).unwrap();
    assert_eq!(taxonomy.get(&dl.id).unwrap().path, "/cs/ml/dl");
    assert_eq!(taxonomy.get(&rl.id).unwrap().path, "/cs/ml/dl/rl");
    assert_eq!(taxonomy.get(&rl.id).unwrap().level, 3);
}

#[test]
fn cycles_and_duplicate_slugs_rejected() {
    let harness = TestEngine::new();
    let taxonomy = &harness.engine.taxonomy;

    let cs = taxonomy.create("CS", None, None, vec![], true).unwrap();
    let ml = taxonomy
        .create("ML", None, Some(&cs.id), vec![], true)
        .unwrap();

    // Self-parent and descendant-parent both refuse
    assert!(matches!(
        taxonomy.move_node(&cs.id, Some(&cs.id)),
        Err(CoreError::Conflict(_))
    ));
    assert!(matches!(
        taxonomy.move_node(&cs.id, Some(&ml.id)),
        Err(CoreError::Conflict(_))
    ));

    // Duplicate sibling slug refuses, at create and at move
    assert!(matches!(
        taxonomy.create("ML", None, Some(&cs.id), vec![], true),
        Err(CoreError::Conflict(_))
    ));
    let other_ml = taxonomy.create("ML", None, None, vec![], true).unwrap();
    assert!(matches!(
        taxonomy.move_node(&other_ml.id, Some(&cs.id)),
        Err(CoreError::Conflict(_))
    ));
}

#[test]
fn delete_reparents_children_or_cascades() {
    let harness = TestEngine::new();
    let taxonomy = &harness.engine.taxonomy;

    let cs = taxonomy.create("CS", None, None, vec![], true).unwrap();
    let ml = taxonomy
        .create("ML", None, Some(&cs.id), vec![], true)
        .unwrap();
    let dl = taxonomy
        .create("DL", None, Some(&ml.id), vec![], true)
        .unwrap();

    // cascade=false: children hop to the grandparent
    taxonomy.delete(&ml.id, false).unwrap();
    let dl_node = taxonomy.get(&dl.id).unwrap();
    assert_eq!(dl_node.parent_id.as_deref(), Some(cs.id.as_str()));
    assert_eq!(dl_node.path, "/cs/dl");
    assert_eq!(dl_node.level, 1);

    // cascade=true: the subtree goes away
    taxonomy.delete(&cs.id, true).unwrap();
    assert!(matches!(taxonomy.get(&dl.id), Err(CoreError::NotFound(_))));
    assert!(taxonomy.tree().unwrap().is_empty());
}

#[test]
fn delete_refuses_while_resources_are_assigned() {
    let harness = TestEngine::new();
    let taxonomy = &harness.engine.taxonomy;

    let node = taxonomy
        .create(
            "Retrieval",
            None,
            None,
            vec!["retrieval".to_string(), "ranking".to_string(), "search".to_string()],
            true,
        )
        .unwrap();

    // Classified during the pipeline: the node now has an assignment
    harness.ingest_document(
        "https://example.com/paper",
        TestEngine::article(
            "Search and Ranking",
            "Retrieval and ranking for search",
            "retrieval ranking search methods",
        ),
    );

    assert!(matches!(
        taxonomy.delete(&node.id, true),
        Err(CoreError::Conflict(_))
    ));
}
