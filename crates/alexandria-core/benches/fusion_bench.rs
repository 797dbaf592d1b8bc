//! Fusion hot-path benchmarks: weighted RRF over realistic candidate lists
//! and the MMR-free sort that follows.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use alexandria_core::search::{weighted_rrf, FusionWeights, RetrievalMethod};

fn candidate_list(prefix: &str, count: usize) -> Vec<(String, f32)> {
    (0..count)
        .map(|i| (format!("{prefix}-{:05}", i * 7 % count), 1.0 - i as f32 / count as f32))
        .collect()
}

fn bench_weighted_rrf(c: &mut Criterion) {
    let lists = vec![
        (RetrievalMethod::Lexical, candidate_list("lex", 200)),
        (RetrievalMethod::Dense, candidate_list("den", 200)),
        (RetrievalMethod::Sparse, candidate_list("spa", 200)),
    ];
    let weights = FusionWeights::uniform();

    c.bench_function("weighted_rrf_3x200", |b| {
        b.iter(|| weighted_rrf(black_box(&lists), black_box(&weights)))
    });

    let big_lists = vec![
        (RetrievalMethod::Lexical, candidate_list("lex", 1000)),
        (RetrievalMethod::Dense, candidate_list("den", 1000)),
        (RetrievalMethod::Sparse, candidate_list("spa", 1000)),
    ];
    c.bench_function("weighted_rrf_3x1000", |b| {
        b.iter(|| weighted_rrf(black_box(&big_lists), black_box(&weights)))
    });
}

criterion_group!(benches, bench_weighted_rrf);
criterion_main!(benches);
