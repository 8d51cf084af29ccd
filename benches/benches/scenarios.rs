//! Workspace-level scenario benchmarks: composed structured-concurrency
//! patterns exercised purely through `kestrel_runtime`'s public API, with
//! no privileged access to scheduler internals (mirrors the crate-local
//! micro-benchmarks in `runtime/benches/concurrency.rs`, but at the scale
//! of whole scenarios rather than single primitives).

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kestrel_runtime::{clock, open_nursery, run, spawn_blocking, MockClock, RuntimeConfig, TaskError};

fn autojumping_config() -> RuntimeConfig {
    let mock = MockClock::new();
    mock.set_autojump(true);
    RuntimeConfig::new().with_clock(Box::new(mock))
}

fn bench_nested_nurseries(c: &mut Criterion) {
    let mut group = c.benchmark_group("nested_nurseries");
    group.sample_size(30);

    // Three levels of nurseries, each fanning out to a handful of leaf
    // tasks: a stand-in for a supervisor tree.
    group.bench_function("three_levels_deep", |b| {
        b.iter(|| {
            let result = run(RuntimeConfig::new(), || async {
                open_nursery(|outer| async move {
                    for _ in 0..3 {
                        outer.start_soon(|| async {
                            open_nursery(|middle| async move {
                                for _ in 0..3 {
                                    middle.start_soon(|| async {
                                        open_nursery(|inner| async move {
                                            for i in 0..3 {
                                                inner.start_soon(move || async move {
                                                    black_box(i);
                                                    Ok(())
                                                });
                                            }
                                            Ok::<(), TaskError>(())
                                        })
                                        .await
                                    });
                                }
                                Ok::<(), TaskError>(())
                            })
                            .await
                        });
                    }
                    Ok::<(), TaskError>(())
                })
                .await
            });
            black_box(result.unwrap())
        })
    });

    group.finish();
}

fn bench_spawn_blocking_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_blocking_round_trip");

    for n in [1, 10, 50].iter() {
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("jobs", n), n, |b, &n| {
            b.iter(|| {
                let result = run(
                    RuntimeConfig::new().with_blocking_pool_size(4),
                    move || async move {
                        open_nursery(|nursery| async move {
                            for i in 0..n {
                                nursery.start_soon(move || async move {
                                    let v = spawn_blocking(move || i * 2).await?;
                                    black_box(v);
                                    Ok(())
                                });
                            }
                            Ok::<(), TaskError>(())
                        })
                        .await
                    },
                );
                black_box(result.unwrap())
            })
        });
    }

    group.finish();
}

fn bench_deadline_heavy_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("deadline_heavy_fanout");
    group.sample_size(30);

    // Many sibling tasks each racing their own deadline against a sleep
    // that never wins, run against an autojumping mock clock so the
    // benchmark measures scheduler overhead rather than real time.
    group.bench_function("twenty_racing_deadlines", |b| {
        b.iter(|| {
            let result = run(autojumping_config(), || async {
                open_nursery(|nursery| async move {
                    for i in 0..20 {
                        nursery.start_soon(move || async move {
                            let _ = clock::sleep(Duration::from_millis(i + 1)).await;
                            Ok(())
                        });
                    }
                    Ok::<(), TaskError>(())
                })
                .await
            });
            black_box(result.unwrap())
        })
    });

    group.finish();
}

criterion_group!(
    scenario_benches,
    bench_nested_nurseries,
    bench_spawn_blocking_round_trip,
    bench_deadline_heavy_fanout,
);

criterion_main!(scenario_benches);
