//! PageRank
//!
//! Power iteration over a directed edge list: damping 0.85, at most 100
//! iterations, L1 convergence below 1e-6. Dangling mass redistributes
//! uniformly. Output is normalized to [0, 1] by the maximum score and is
//! deterministic for a fixed graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Damping factor.
pub const DAMPING: f64 = 0.85;
/// Iteration cap.
pub const MAX_ITERATIONS: usize = 100;
/// L1 convergence threshold.
pub const CONVERGENCE: f64 = 1e-6;

/// Run PageRank over directed `(source, target)` edges. Returns a score per
/// node, normalized so the most important node scores 1.0. Empty input
/// yields an empty map.
pub fn pagerank(edges: &[(String, String)]) -> HashMap<String, f64> {
    // BTree containers keep iteration order stable across runs
    let mut nodes: BTreeSet<&str> = BTreeSet::new();
    for (source, target) in edges {
        nodes.insert(source);
        nodes.insert(target);
    }
    if nodes.is_empty() {
        return HashMap::new();
    }

    let index: BTreeMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let n = nodes.len();

    let mut out_degree = vec![0usize; n];
    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (source, target) in edges {
        let s = index[source.as_str()];
        let t = index[target.as_str()];
        out_degree[s] += 1;
        incoming[t].push(s);
    }

    let mut rank = vec![1.0 / n as f64; n];
    for _ in 0..MAX_ITERATIONS {
        let dangling_mass: f64 = rank
            .iter()
            .zip(out_degree.iter())
            .filter(|(_, d)| **d == 0)
            .map(|(r, _)| r)
            .sum();

        let base = (1.0 - DAMPING) / n as f64 + DAMPING * dangling_mass / n as f64;
        let mut next = vec![base; n];
        for (t, sources) in incoming.iter().enumerate() {
            for &s in sources {
                next[t] += DAMPING * rank[s] / out_degree[s] as f64;
            }
        }

        let delta: f64 = rank
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        rank = next;
        if delta < CONVERGENCE {
            break;
        }
    }

    let max = rank.iter().cloned().fold(f64::MIN, f64::max).max(f64::MIN_POSITIVE);
    nodes
        .iter()
        .map(|node| (node.to_string(), rank[index[*node]] / max))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_cycle_is_uniform() {
        let edges = vec![
            edge("a", "b"),
            edge("b", "c"),
            edge("c", "d"),
            edge("d", "a"),
        ];
        let scores = pagerank(&edges);
        assert_eq!(scores.len(), 4);
        for score in scores.values() {
            assert!((score - 1.0).abs() < 1e-6, "cycle should be uniform, got {score}");
        }
    }

    #[test]
    fn test_extra_edge_boosts_target() {
        let base = vec![
            edge("a", "b"),
            edge("b", "c"),
            edge("c", "d"),
            edge("d", "a"),
        ];
        let mut boosted = base.clone();
        boosted.push(edge("a", "c"));

        let scores = pagerank(&boosted);
        assert!(scores["c"] > scores["d"], "c should outrank d after a->c");
    }

    #[test]
    fn test_scores_in_unit_interval_and_deterministic() {
        let edges = vec![edge("a", "b"), edge("c", "b"), edge("b", "d")];
        let first = pagerank(&edges);
        let second = pagerank(&edges);
        assert_eq!(first, second);
        for score in first.values() {
            assert!((0.0..=1.0).contains(score));
        }
        assert!(first.values().any(|s| (s - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_empty_graph() {
        assert!(pagerank(&[]).is_empty());
    }

    #[test]
    fn test_sink_receives_mass() {
        let edges = vec![edge("a", "sink"), edge("b", "sink")];
        let scores = pagerank(&edges);
        assert!(scores["sink"] > scores["a"]);
    }
}
