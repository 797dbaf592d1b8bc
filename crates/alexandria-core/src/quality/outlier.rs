//! Quality Outlier Detection
//!
//! Isolation Forest over the five-dimensional quality feature, contamination
//! 0.10, with inputs standardized to zero mean and unit variance. A resource
//! is an outlier when its sample score falls below −0.5 (anomaly score above
//! 0.5) or when any dimension sits below the population's 5th percentile;
//! the reasons name the triggering dimensions. Flagged resources get
//! `needs_quality_review`.

use std::sync::Arc;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kernel::Kernel;
use crate::resource::QualityDimensions;
use crate::storage::format_ts;

/// Trees in the forest.
const N_TREES: usize = 100;
/// Subsample per tree.
const SAMPLE_SIZE: usize = 256;
/// Declared contamination fraction.
pub const CONTAMINATION: f64 = 0.10;
/// Sample-score threshold: below this is anomalous.
const SCORE_THRESHOLD: f64 = -0.5;
/// Dimension percentile for per-dimension reasons.
const DIMENSION_PERCENTILE: f64 = 0.05;

const DIMENSION_NAMES: [&str; 5] = [
    "accuracy",
    "completeness",
    "consistency",
    "timeliness",
    "relevance",
];

// ============================================================================
// DETERMINISTIC PRNG
// ============================================================================

/// xorshift64* — deterministic split choices so repeated runs over the same
/// population flag the same resources.
struct SplitRng(u64);

impl SplitRng {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn next_usize(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound.max(1) as u64) as usize
    }
}

// ============================================================================
// ISOLATION FOREST
// ============================================================================

enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// An isolation forest over fixed-width feature rows.
pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

/// Average unsuccessful-search path length in a BST of n nodes.
fn c_factor(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + 0.577_215_664_901_532_9) - 2.0 * (n - 1.0) / n
}

fn build_tree(rows: &mut [[f64; 5]], depth: usize, max_depth: usize, rng: &mut SplitRng) -> Node {
    if rows.len() <= 1 || depth >= max_depth {
        return Node::Leaf { size: rows.len() };
    }

    let feature = rng.next_usize(5);
    let (min, max) = rows.iter().fold((f64::MAX, f64::MIN), |(lo, hi), row| {
        (lo.min(row[feature]), hi.max(row[feature]))
    });
    if (max - min).abs() < 1e-12 {
        return Node::Leaf { size: rows.len() };
    }

    let threshold = min + rng.next_f64() * (max - min);
    let split = partition_rows(rows, feature, threshold);
    if split == 0 || split == rows.len() {
        return Node::Leaf { size: rows.len() };
    }
    let (left_rows, right_rows) = rows.split_at_mut(split);
    Node::Split {
        feature,
        threshold,
        left: Box::new(build_tree(left_rows, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(right_rows, depth + 1, max_depth, rng)),
    }
}

/// Partition rows by `row[feature] < threshold`; returns the split point.
fn partition_rows(rows: &mut [[f64; 5]], feature: usize, threshold: f64) -> usize {
    let mut split = 0;
    for i in 0..rows.len() {
        if rows[i][feature] < threshold {
            rows.swap(i, split);
            split += 1;
        }
    }
    split
}

fn path_length(node: &Node, row: &[f64; 5], depth: f64) -> f64 {
    match node {
        Node::Leaf { size } => depth + c_factor(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            if row[*feature] < *threshold {
                path_length(left, row, depth + 1.0)
            } else {
                path_length(right, row, depth + 1.0)
            }
        }
    }
}

impl IsolationForest {
    /// Fit a forest on the rows. Deterministic for a fixed population.
    pub fn fit(rows: &[[f64; 5]]) -> Self {
        let sample_size = SAMPLE_SIZE.min(rows.len().max(1));
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = SplitRng::new(0x5EED_CAFE);

        let trees = (0..N_TREES)
            .map(|_| {
                let mut sample: Vec<[f64; 5]> = (0..sample_size)
                    .map(|_| rows[rng.next_usize(rows.len())])
                    .collect();
                build_tree(&mut sample, 0, max_depth, &mut rng)
            })
            .collect();

        Self { trees, sample_size }
    }

    /// Anomaly score in (0, 1]: 2^(−E[h(x)] / c(sample_size)). Higher means
    /// more easily isolated.
    pub fn anomaly_score(&self, row: &[f64; 5]) -> f64 {
        let c = c_factor(self.sample_size);
        if c <= f64::EPSILON || self.trees.is_empty() {
            return 0.5;
        }
        let mean_path: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, row, 0.0))
            .sum::<f64>()
            / self.trees.len() as f64;
        2f64.powf(-mean_path / c)
    }

    /// Sample score in [−1, 0): the negated anomaly score. Below −0.5 reads
    /// as anomalous.
    pub fn score_samples(&self, row: &[f64; 5]) -> f64 {
        -self.anomaly_score(row)
    }
}

// ============================================================================
// PERCENTILES AND STANDARDIZATION
// ============================================================================

/// Linear-interpolated percentile (q in [0, 1]) of unsorted values.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

fn standardize(rows: &[[f64; 5]]) -> Vec<[f64; 5]> {
    let n = rows.len() as f64;
    let mut mean = [0.0f64; 5];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row.iter()) {
            *m += v / n;
        }
    }
    let mut std_dev = [0.0f64; 5];
    for row in rows {
        for ((s, v), m) in std_dev.iter_mut().zip(row.iter()).zip(mean.iter()) {
            *s += (v - m).powi(2) / n;
        }
    }
    for s in &mut std_dev {
        *s = s.sqrt().max(1e-9);
    }

    rows.iter()
        .map(|row| {
            let mut out = [0.0f64; 5];
            for i in 0..5 {
                out[i] = (row[i] - mean[i]) / std_dev[i];
            }
            out
        })
        .collect()
}

// ============================================================================
// DETECTOR SERVICE
// ============================================================================

/// One flagged resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlierReport {
    /// Flagged resource
    pub resource_id: String,
    /// Isolation-forest sample score (below −0.5 is anomalous)
    pub score: f64,
    /// Triggering dimensions (`low_completeness`, ...) or `anomalous_profile`
    pub reasons: Vec<String>,
}

/// The outlier detection service.
pub struct OutlierDetector {
    kernel: Arc<Kernel>,
}

impl OutlierDetector {
    /// Create the service over the shared kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Run detection over every resource with computed quality. Flagged
    /// resources get `needs_quality_review = 1`; reports carry the reasons.
    pub fn detect(&self) -> Result<Vec<OutlierReport>> {
        let population: Vec<(String, QualityDimensions)> = self.kernel.store.with_read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, quality_accuracy, quality_completeness, quality_consistency,
                        quality_timeliness, quality_relevance
                 FROM resources WHERE quality_overall IS NOT NULL ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    QualityDimensions {
                        accuracy: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                        completeness: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                        consistency: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                        timeliness: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                        relevance: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    },
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        if population.len() < 2 {
            return Ok(Vec::new());
        }

        let raw: Vec<[f64; 5]> = population.iter().map(|(_, d)| d.as_array()).collect();
        let standardized = standardize(&raw);
        let forest = IsolationForest::fit(&standardized);

        let mut floors = [0.0f64; 5];
        for (i, floor) in floors.iter_mut().enumerate() {
            let column: Vec<f64> = raw.iter().map(|row| row[i]).collect();
            *floor = percentile(&column, DIMENSION_PERCENTILE);
        }

        let mut reports = Vec::new();
        for ((resource_id, _), (raw_row, std_row)) in population
            .iter()
            .zip(raw.iter().zip(standardized.iter()))
        {
            let score = forest.score_samples(std_row);

            let mut reasons: Vec<String> = DIMENSION_NAMES
                .iter()
                .enumerate()
                .filter(|(i, _)| raw_row[*i] < floors[*i])
                .map(|(_, name)| format!("low_{name}"))
                .collect();
            if reasons.is_empty() && score < SCORE_THRESHOLD {
                reasons.push("anomalous_profile".to_string());
            }
            if reasons.is_empty() {
                continue;
            }

            reports.push(OutlierReport {
                resource_id: resource_id.clone(),
                score,
                reasons,
            });
        }

        let now = self.kernel.now();
        let flagged: Vec<String> = reports.iter().map(|r| r.resource_id.clone()).collect();
        self.kernel.commit(move |tx, _fx| {
            for id in &flagged {
                tx.execute(
                    "UPDATE resources SET needs_quality_review = 1, updated_at = ?2
                     WHERE id = ?1",
                    params![id, format_ts(now)],
                )?;
            }
            Ok(())
        })?;

        Ok(reports)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolation() {
        let values = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&values, 0.0) - 0.0).abs() < 1e-12);
        assert!((percentile(&values, 1.0) - 4.0).abs() < 1e-12);
        assert!((percentile(&values, 0.5) - 2.0).abs() < 1e-12);
        assert!((percentile(&values, 0.05) - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_forest_isolates_the_obvious_outlier() {
        let mut rows: Vec<[f64; 5]> = (0..60)
            .map(|i| {
                let jitter = (i % 7) as f64 * 0.01;
                [
                    0.7 + jitter,
                    0.7 - jitter,
                    0.65 + jitter,
                    0.72 - jitter,
                    0.68 + jitter,
                ]
            })
            .collect();
        rows.push([0.01, 0.02, 0.01, 0.03, 0.02]);

        let standardized = standardize(&rows);
        let forest = IsolationForest::fit(&standardized);

        let outlier_score = forest.anomaly_score(&standardized[rows.len() - 1]);
        let inlier_score = forest.anomaly_score(&standardized[0]);
        assert!(
            outlier_score > inlier_score,
            "outlier {outlier_score} vs inlier {inlier_score}"
        );
    }

    #[test]
    fn test_scores_are_deterministic() {
        let rows: Vec<[f64; 5]> = (0..40)
            .map(|i| [i as f64 * 0.01, 0.5, 0.5, 0.5, 0.5])
            .collect();
        let a = IsolationForest::fit(&rows).anomaly_score(&rows[0]);
        let b = IsolationForest::fit(&rows).anomaly_score(&rows[0]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_score_range() {
        let rows: Vec<[f64; 5]> = (0..30)
            .map(|i| [(i % 10) as f64 * 0.1, 0.4, 0.6, 0.5, 0.5])
            .collect();
        let forest = IsolationForest::fit(&rows);
        for row in &rows {
            let s = forest.score_samples(row);
            assert!((-1.0..0.0).contains(&s), "score {s} out of range");
        }
    }
}
