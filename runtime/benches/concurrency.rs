//! Micro-benchmarks for the scheduler core: run-loop overhead, a single
//! checkpoint's cost, and small nursery/cancel-scope fan-outs. Exercises
//! only the public `kestrel_runtime` API, the same surface any downstream
//! crate has.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use kestrel_runtime::{checkpoint, open_cancel_scope, open_nursery, run, RuntimeConfig, TaskError};

fn bench_run_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_overhead");

    group.bench_function("trivial_root_task", |b| {
        b.iter(|| {
            let result = run(RuntimeConfig::new(), || async { Ok::<i32, TaskError>(1) });
            black_box(result.unwrap())
        })
    });

    group.bench_function("root_task_with_one_checkpoint", |b| {
        b.iter(|| {
            let result = run(RuntimeConfig::new(), || async {
                checkpoint().await?;
                Ok::<i32, TaskError>(1)
            });
            black_box(result.unwrap())
        })
    });

    group.finish();
}

fn bench_checkpoint_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_loop");

    for n in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("checkpoints", n), n, |b, &n| {
            b.iter(|| {
                let result = run(RuntimeConfig::new(), move || async move {
                    for _ in 0..n {
                        checkpoint().await?;
                    }
                    Ok::<(), TaskError>(())
                });
                black_box(result.unwrap())
            })
        });
    }

    group.finish();
}

fn bench_cancel_scope_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("cancel_scope_overhead");

    group.bench_function("enter_and_exit_empty_scope", |b| {
        b.iter(|| {
            let result = run(RuntimeConfig::new(), || async {
                let outcome = open_cancel_scope()
                    .run(|_scope| async { Ok::<i32, TaskError>(1) })
                    .await?;
                Ok::<i32, TaskError>(outcome.value.unwrap_or(0))
            });
            black_box(result.unwrap())
        })
    });

    group.finish();
}

fn bench_nursery_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("nursery_fanout");
    group.sample_size(30);

    for n in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*n as u64));
        group.bench_with_input(BenchmarkId::new("children", n), n, |b, &n| {
            b.iter(|| {
                let result = run(RuntimeConfig::new(), move || async move {
                    open_nursery(|nursery| async move {
                        for i in 0..n {
                            nursery.start_soon(move || async move {
                                black_box(i);
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
    }

    group.finish();
}

criterion_group!(
    scheduler_benches,
    bench_run_overhead,
    bench_checkpoint_loop,
    bench_cancel_scope_overhead,
    bench_nursery_fanout,
);

criterion_main!(scheduler_benches);
