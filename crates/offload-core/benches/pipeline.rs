//! Command pipeline benchmarks on the simulated runtime.
//!
//! Measures the per-run overhead of callback-driven resubmission: buffer
//! allocation, five enqueued commands, callback delivery and release, for a
//! range of matrix sizes and iteration budgets.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use offload_core::kernels::{self, MATRIX_MULT};
use offload_core::pipeline::{CommandPipeline, DeviceHandles, PipelineConfig};
use offload_core::sim::SimRuntime;

fn handles(rt: &SimRuntime) -> DeviceHandles<SimRuntime> {
    let context = rt.create_context().unwrap();
    let queue = rt.create_queue(&context).unwrap();
    let kernel = rt.create_kernel(&context, MATRIX_MULT).unwrap();
    DeviceHandles { context, queue, kernel }
}

fn bench_pipeline_run(c: &mut Criterion) {
    let rt = Arc::new(SimRuntime::new());
    let h = handles(&rt);
    let mut group = c.benchmark_group("pipeline_run");

    for &(dimension, iterations) in &[(4usize, 16usize), (32, 16), (64, 4)] {
        group.throughput(Throughput::Elements(iterations as u64));
        group.bench_with_input(
            BenchmarkId::new(format!("{dimension}x{dimension}"), iterations),
            &(dimension, iterations),
            |b, &(dimension, iterations)| {
                b.iter(|| {
                    let p = CommandPipeline::new(
                        Arc::clone(&rt),
                        PipelineConfig::new(dimension, iterations),
                        h.clone(),
                    )
                    .unwrap();
                    p.enqueue().unwrap();
                    black_box(p.wait().unwrap())
                });
            },
        );
    }
    group.finish();
}

fn bench_reference_kernel(c: &mut Criterion) {
    let mut group = c.benchmark_group("matrix_mult_ref");
    for &dimension in &[16usize, 64, 128] {
        let lhs: Vec<f32> = (0..dimension * dimension).map(|i| i as f32).collect();
        let mut out = vec![0.0f32; dimension * dimension];
        group.bench_with_input(BenchmarkId::from_parameter(dimension), &dimension, |b, &d| {
            b.iter(|| kernels::matrix_mult_ref(black_box(&lhs), black_box(&lhs), &mut out, d));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline_run, bench_reference_kernel);
criterion_main!(benches);
