use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use rapl_interface::sampler::Sampler;
use rapl_interface::synthetic::SyntheticSource;

/// Measures the cost of a full start/stop cycle over a synthetic source,
/// i.e. the overhead the shim adds around a benchmark iteration.
fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampler");
    for sockets in [1usize, 2, 4] {
        let source = SyntheticSource::new(sockets, 50_000, u32::MAX as u64, 0.001);
        let mut sampler = Sampler::new(Box::new(source));
        group.bench_function(BenchmarkId::new("start_stop", sockets), |b| {
            b.iter(|| {
                sampler.start().unwrap();
                black_box(sampler.stop().unwrap())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
