//! Journey: citation extraction, resolution, and PageRank importance.

use alexandria_e2e_tests::harness::TestEngine;
use alexandria_core::{CitationType, FetchedDocument};

fn citing_article(title: &str, cited_urls: &[&str]) -> FetchedDocument {
    let mut text = format!("{title}. This work builds on earlier results. ");
    for url in cited_urls {
        text.push_str(&format!("See {url} for details. "));
    }
    FetchedDocument {
        title: Some(title.to_string()),
        description: Some(format!("{title} with references")),
        text,
        language: Some("en".to_string()),
        ..Default::default()
    }
}

#[test]
fn four_node_cycle_has_uniform_importance() {
    let harness = TestEngine::new();
    let urls = [
        "https://example.com/a",
        "https://example.com/b",
        "https://example.com/c",
        "https://example.com/d",
    ];

    let mut ids = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        let cited = urls[(i + 1) % 4];
        let resource =
            harness.ingest_document(url, citing_article(&format!("Node {i}"), &[cited]));
        ids.push(resource.id);
    }

    let scores = harness.engine.citations.compute_importance().unwrap();
    assert_eq!(scores.len(), 4);
    let first = scores[&ids[0]];
    for id in &ids {
        assert!(
            (scores[id] - first).abs() < 1e-6,
            "cycle importance should be uniform"
        );
        assert!((0.0..=1.0).contains(&scores[id]));
    }
}

#[test]
fn shortcut_edge_boosts_its_target_over_the_bypassed_node() {
    let harness = TestEngine::new();
    let urls = [
        "https://example.com/a",
        "https://example.com/b",
        "https://example.com/c",
        "https://example.com/d",
    ];

    let mut ids = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        let mut cited = vec![urls[(i + 1) % 4]];
        if i == 0 {
            // Extra edge a -> c alongside the cycle
            cited.push(urls[2]);
        }
        let resource =
            harness.ingest_document(url, citing_article(&format!("Node {i}"), &cited));
        ids.push(resource.id);
    }

    let scores = harness.engine.citations.compute_importance().unwrap();
    assert!(
        scores[&ids[2]] > scores[&ids[3]],
        "c should outrank d after a->c"
    );
}

#[test]
fn extraction_classifies_resolves_and_stays_idempotent() {
    let harness = TestEngine::new();

    let target = harness.ingest_document(
        "https://example.com/target",
        citing_article("Target Paper", &[]),
    );
    let citing = harness.ingest_document(
        "https://example.com/citing",
        FetchedDocument {
            title: Some("Citing Paper".to_string()),
            description: Some("cites several kinds of targets".to_string()),
            text: "Background at https://example.com/target and code at \
                   https://github.com/example/repo plus data in \
                   https://example.com/table.csv and the DOI 10.1000/xyz123 reference."
                .to_string(),
            ..Default::default()
        },
    );

    let view = harness.engine.citations.citations_for(&citing.id).unwrap();
    assert_eq!(view.outbound_count, 4);

    let by_type = |t: CitationType| {
        view.outbound
            .iter()
            .filter(|c| c.cite_type == t)
            .count()
    };
    assert_eq!(by_type(CitationType::General), 1);
    assert_eq!(by_type(CitationType::Code), 1);
    assert_eq!(by_type(CitationType::Dataset), 1);
    assert_eq!(by_type(CitationType::Reference), 1);

    // The internal target resolved; positions are sequential
    let internal = view
        .outbound
        .iter()
        .find(|c| c.normalized_url == "https://example.com/target")
        .unwrap();
    assert_eq!(internal.target_resource_id.as_deref(), Some(target.id.as_str()));
    let positions: Vec<u32> = view.outbound.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    for citation in &view.outbound {
        assert!(!citation.context.is_empty());
        assert!(citation.context.len() <= 244);
    }

    // Re-running extraction and resolution changes nothing
    harness.engine.citations.extract(&citing.id).unwrap();
    harness.engine.citations.resolve().unwrap();
    let again = harness.engine.citations.citations_for(&citing.id).unwrap();
    assert_eq!(again.outbound_count, 4);
    assert_eq!(
        again
            .outbound
            .iter()
            .find(|c| c.normalized_url == "https://example.com/target")
            .unwrap()
            .target_resource_id
            .as_deref(),
        Some(target.id.as_str())
    );
}

#[test]
fn bounded_subgraph_walks_at_most_two_hops() {
    let harness = TestEngine::new();

    // Chain: a -> b -> c -> d; from a, depth 2 reaches c but not d
    let urls = [
        "https://example.com/a",
        "https://example.com/b",
        "https://example.com/c",
        "https://example.com/d",
    ];
    let mut ids = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        let cited: Vec<&str> = if i + 1 < urls.len() {
            vec![urls[i + 1]]
        } else {
            vec![]
        };
        let resource =
            harness.ingest_document(url, citing_article(&format!("Chain {i}"), &cited));
        ids.push(resource.id);
    }

    let (nodes, edges) = harness.engine.citations.subgraph(&ids[0], 100).unwrap();
    assert!(nodes.contains(&ids[0]));
    assert!(nodes.contains(&ids[1]));
    assert!(nodes.contains(&ids[2]));
    assert!(!nodes.contains(&ids[3]), "depth cap exceeded");
    assert!(edges.len() <= 2);
}
