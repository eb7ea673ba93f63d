//! Benchmarks for task dispatch.
//!
//! Run with: cargo bench --package text2image-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crossbeam_channel::unbounded;
use std::time::Duration;
use text2image_core::{ContextBuilder, LibraryContext, RenderEngine, RenderOptions, Task};

/// Returns the document unchanged so only pipeline overhead is measured.
struct Passthrough;

impl RenderEngine for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn render(&self, task: &Task) -> anyhow::Result<Vec<u8>> {
        Ok(task.document().as_bytes().to_vec())
    }
}

fn context(pool_size: usize) -> LibraryContext {
    let context = ContextBuilder::new()
        .pool_size(pool_size)
        .engine(|| Passthrough)
        .build()
        .unwrap();
    context.initialize().unwrap();
    context
}

fn benchmark_sync_dispatch(c: &mut Criterion) {
    let context = context(1);

    c.bench_function("sync_create_render_free", |b| {
        b.iter(|| {
            let handle = context.create_task("<p>bench</p>", "", None).unwrap();
            context.render_sync(handle, None).unwrap();
            let bytes = context.get_result(handle).unwrap();
            context.free_task(handle);
            black_box(bytes)
        });
    });

    context.shutdown();
}

fn benchmark_pool_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_throughput");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    const BATCH: usize = 256;

    for workers in [1usize, 2, 4, 8] {
        let context = context(workers);
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                let (tx, rx) = unbounded();
                for _ in 0..BATCH {
                    let handle = context.create_task("<p>bench</p>", "", None).unwrap();
                    let tx = tx.clone();
                    context
                        .render_async(
                            handle,
                            None,
                            Some(Box::new(move |handle, ok| {
                                let _ = tx.send((handle, ok));
                            })),
                        )
                        .unwrap();
                }
                for _ in 0..BATCH {
                    let (handle, ok) = rx.recv().unwrap();
                    context.free_task(handle);
                    black_box(ok);
                }
            });
        });
        context.shutdown();
    }

    group.finish();
}

fn benchmark_raster_png(c: &mut Criterion) {
    let context = ContextBuilder::new().pool_size(1).build().unwrap();
    context.initialize().unwrap();
    let options = RenderOptions::default().custom_size(640, 480).border_radius(24);

    c.bench_function("raster_png_640x480", |b| {
        b.iter(|| {
            let handle = context
                .create_task("<p>bench</p>", "", Some(options.clone()))
                .unwrap();
            context.render_sync(handle, None).unwrap();
            context.free_task(handle);
        });
    });

    context.shutdown();
}

criterion_group!(
    benches,
    benchmark_sync_dispatch,
    benchmark_pool_throughput,
    benchmark_raster_png
);
criterion_main!(benches);
