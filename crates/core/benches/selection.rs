// Selection Benchmarks
// Critical path: Pareto front extraction is O(n^2) in the evaluated batch,
// ranking sorts the front and pads from the remainder.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use forkloop_core::selection::{pareto, CompositeRanker, CompositeWeights, SelectionBand};
use forkloop_core::test_utils::result_with;
use forkloop_shared::ForkResult;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_results(count: usize) -> Vec<ForkResult> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..count)
        .map(|i| {
            result_with(
                &format!("fork-{:04}", i),
                rng.gen_range(0.3..=1.0),
                rng.gen_range(0.3..=1.0),
                rng.gen_range(0.0..=1.0),
                rng.gen_range(0.5..30.0),
            )
        })
        .collect()
}

fn pareto_front(c: &mut Criterion) {
    let mut group = c.benchmark_group("pareto_front");

    for count in &[16, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let results = random_results(count);
            b.iter(|| black_box(pareto::select(black_box(&results))));
        });
    }
    group.finish();
}

fn composite_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("composite_ranking");
    let ranker = CompositeRanker::new(CompositeWeights::default(), 30.0);

    for count in &[16, 64, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let results = random_results(count);
            b.iter(|| black_box(ranker.select(black_box(&results), SelectionBand::default())));
        });
    }
    group.finish();
}

criterion_group!(benches, pareto_front, composite_ranking);
criterion_main!(benches);
