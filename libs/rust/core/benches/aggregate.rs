use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use fedagg_core::federated_learning::{aggregate, AggregationMethod, GlobalModel, LocalUpdate};

fn updates(devices: usize, dim: usize) -> Vec<LocalUpdate> {
    (0..devices)
        .map(|d| {
            let params = (0..dim).map(|i| ((d * 31 + i * 7) % 97) as f64 / 97.0 - 0.5).collect();
            LocalUpdate::new(format!("device-{d:04}"), params, 10 + (d as u64 % 50), 1)
        })
        .collect()
}

fn bench_strategies(c: &mut Criterion) {
    let dim = 4096;
    let seed = GlobalModel::seed(vec![0.0; dim]);
    let mut group = c.benchmark_group("aggregate");
    for devices in [10usize, 100] {
        let batch = updates(devices, dim);
        for method in [
            AggregationMethod::FedAvg,
            AggregationMethod::Momentum { beta: 0.9 },
            AggregationMethod::TrimmedMean { trim_ratio: 0.1 },
            AggregationMethod::Median,
        ] {
            group.bench_with_input(BenchmarkId::new(method.name(), devices), &batch, |b, batch| {
                b.iter(|| aggregate(method, 1, &seed, black_box(batch)).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_strategies);
criterion_main!(benches);
