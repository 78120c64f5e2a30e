// benches/benchmarks.rs — shape, forest and pipeline benchmarks.
//
//   cargo bench
//
// The GPU group runs only when a Vulkan adapter is found; otherwise it is
// skipped with a log line. Criterion measures wall time including submit
// and poll, which is what a caller blocking on results sees.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::rc::Rc;
use std::time::Duration;

use hips_forest::context::ComputeContext;
use hips_forest::forest::HipsForest;
use hips_forest::gpu::device::GpuDevice;
use hips_forest::host::HostContext;
use hips_forest::matmul::MatMulStep;
use hips_forest::pipeline::Pipeline;
use hips_forest::tree_shape::TreeShape;

// ============================================================
// Helpers
// ============================================================

fn lcg_words(n: usize, seed: u32) -> Vec<u32> {
    let mut rng = seed;
    (0..n)
        .map(|_| {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            rng & (rng >> 9)
        })
        .collect()
}

/// A pipeline of `steps` chained `n×n × n×n` multiplies.
fn matmul_pipeline(ctx: Rc<dyn ComputeContext>, n: u32, steps: usize) -> Pipeline {
    let mut p = Pipeline::new(ctx.clone());
    let len = (n * n) as usize;
    let a_data: Vec<f32> = (0..len).map(|i| if i % (n as usize + 1) == 0 { 1.0 } else { 0.0 }).collect();
    let b_data: Vec<f32> = (0..len).map(|i| (i % 7) as f32).collect();

    let s = p.states_mut();
    let a = s.add_matrix("A", n, n).expect("alloc A");
    let b = s.add_matrix("B", n, n).expect("alloc B");
    s.write_matrix(a, &a_data).expect("write A");
    s.write_matrix(b, &b_data).expect("write B");
    for _ in 0..steps {
        let step = MatMulStep::new(ctx.clone(), p.states(), a, b).expect("matmul step");
        p.push(step);
    }
    p
}

// ============================================================
// Benchmarks
// ============================================================

fn bench_tree_shape(c: &mut Criterion) {
    c.bench_function("tree_shape/all_valid", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for levels in 3..=11u32 {
                for keep in 2..levels {
                    let s = TreeShape::new(1 << levels, keep).expect("valid shape");
                    acc = acc.wrapping_add(s.n_keep_nodes());
                }
            }
            std::hint::black_box(acc)
        })
    });
}

fn bench_forest_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("forest_build");
    for &n_leaves in &[64u32, 512, 2048] {
        let shape = TreeShape::new(n_leaves, 4).expect("valid shape");
        let leaves = lcg_words(n_leaves as usize * 8, n_leaves);
        group.bench_with_input(BenchmarkId::from_parameter(n_leaves), &leaves, |b, leaves| {
            b.iter(|| HipsForest::from_leaves(shape, 8, leaves).expect("forest"))
        });
    }
    group.finish();
}

fn bench_matmul_pipeline(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut group = c.benchmark_group("matmul_pipeline");
    group.warm_up_time(Duration::from_secs(2));

    let host: Rc<dyn ComputeContext> = Rc::new(HostContext::new());
    let mut p = matmul_pipeline(host, 64, 4);
    group.bench_function("host_64x64_x4", |b| b.iter(|| p.run().expect("host run")));

    match GpuDevice::new() {
        Ok(gpu) => {
            let gpu: Rc<dyn ComputeContext> = Rc::new(gpu);
            let mut p = matmul_pipeline(gpu, 64, 4);
            group.bench_function("gpu_64x64_x4", |b| b.iter(|| p.run().expect("gpu run")));
        }
        Err(e) => log::warn!("skipping GPU benchmarks: {e}"),
    }
    group.finish();
}

criterion_group!(benches, bench_tree_shape, bench_forest_build, bench_matmul_pipeline);
criterion_main!(benches);
