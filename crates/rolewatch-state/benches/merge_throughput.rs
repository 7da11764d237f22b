//! Merge Throughput Benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rolewatch_common::{DeviceId, Label, Timestamp};
use rolewatch_ml::{Candidate, Verdict};
use rolewatch_state::{CoordinatorPolicy, DeviceStore};

fn verdict(identity: &DeviceId, secs: u64) -> Verdict {
    let at = Timestamp::from_secs(secs);
    Verdict {
        identity: identity.clone(),
        observed_at: at,
        fingerprint: secs,
        candidates: vec![
            Candidate::new(Label::new("printer"), 0.85, "port-heuristic", at),
            Candidate::new(Label::new("printer"), 0.92, "linear-model", at),
        ],
        degraded: Vec::new(),
    }
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for devices in [1_000usize, 100_000] {
        let store = DeviceStore::new(CoordinatorPolicy::default(), 64, devices * 2);
        let ids: Vec<DeviceId> = (0..devices)
            .map(|i| DeviceId::parse(&format!("dev-{}", i)).unwrap())
            .collect();
        let mut secs = 0u64;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(devices), &ids, |b, ids| {
            let mut i = 0usize;
            b.iter(|| {
                secs += 1;
                i = (i + 1) % ids.len();
                black_box(store.merge(&verdict(&ids[i], secs)).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_sweep(c: &mut Criterion) {
    let store = DeviceStore::new(CoordinatorPolicy::default(), 64, 200_000);
    for i in 0..100_000u64 {
        let id = DeviceId::parse(&format!("dev-{}", i)).unwrap();
        store.merge(&verdict(&id, 1)).unwrap();
    }

    c.bench_function("sweep_100k_nothing_to_evict", |b| {
        b.iter(|| black_box(store.sweep(Timestamp::from_secs(60))))
    });
}

criterion_group!(benches, bench_merge, bench_sweep);
criterion_main!(benches);
