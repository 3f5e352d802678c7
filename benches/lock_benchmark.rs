//! Lock performance benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crossbeam::thread;
use libtask::lock::{LockKind, Locked};
use rand::Rng;

const KINDS: [LockKind; 6] = [
    LockKind::Tas,
    LockKind::Ttas,
    LockKind::Ticket,
    LockKind::Anderson { slots: 16 },
    LockKind::Clh,
    LockKind::Native,
];

fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_uncontended");
    for kind in KINDS {
        let counter = Locked::new(0u64, kind);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", kind)), &kind, |b, _| {
            b.iter(|| {
                *counter.lock() += 1;
                black_box(&counter);
            })
        });
    }
    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let threads = num_cpus::get().clamp(2, 8);
    // Random critical section lengths so the threads do not fall into lockstep.
    let work: Vec<u32> = {
        let mut rng = rand::thread_rng();
        (0..1_000).map(|_| rng.gen_range(0..64)).collect()
    };

    let mut group = c.benchmark_group("lock_contended");
    group.sample_size(20);
    for kind in KINDS {
        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", kind)), &kind, |b, &kind| {
            b.iter(|| {
                let counter = Locked::new(0u64, kind);
                thread::scope(|s| {
                    for _ in 0..threads {
                        s.spawn(|_| {
                            for &spins in &work {
                                let mut guard = counter.lock();
                                for _ in 0..spins {
                                    std::hint::spin_loop();
                                }
                                *guard += 1;
                            }
                        });
                    }
                })
                .unwrap();
                black_box(counter.into_inner())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_contended);
criterion_main!(benches);
