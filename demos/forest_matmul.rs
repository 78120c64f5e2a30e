// demos/forest_matmul.rs — forest layout + matrix pipeline walkthrough.
//
// Builds a HIPS forest from synthetic descriptors, uploads it as a state,
// then runs a two-step matrix-multiply pipeline on the first Vulkan GPU
// found. Without a GPU the run fails with the device error. `--host`
// selects the host reference context instead.
// GPU results are checked against the host.
//
// USAGE
// ─────
//   RUST_LOG=info cargo run --example forest_matmul
//   RUST_LOG=debug cargo run --example forest_matmul -- 1024 3     # leaves, kept levels
//   cargo run --example forest_matmul -- 512 4 --host

use std::rc::Rc;

use hips_forest::context::ComputeContext;
use hips_forest::forest::{ForestConfig, HipsForest};
use hips_forest::gpu::device::GpuDevice;
use hips_forest::host::HostContext;
use hips_forest::matmul::MatMulStep;
use hips_forest::pipeline::Pipeline;
use hips_forest::step::PipelineError;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let defaults = ForestConfig::default();
    let config = ForestConfig {
        n_leaves: args.get(1).and_then(|s| s.parse().ok()).unwrap_or(defaults.n_leaves),
        n_keep_levels: args.get(2).and_then(|s| s.parse().ok()).unwrap_or(defaults.n_keep_levels),
        ..defaults
    };
    let force_host = args.iter().any(|a| a == "--host");

    if let Err(e) = run(config, force_host) {
        let kind = if e.is_precondition() { "usage error" } else { "device error" };
        eprintln!("forest_matmul: {kind}: {e}");
        std::process::exit(1);
    }
}

fn run(config: ForestConfig, force_host: bool) -> Result<(), PipelineError> {
    let shape = config.shape()?;
    println!("shape: {shape}");
    println!("  words: {:?}", shape.to_words());

    let leaves = synthetic_leaves(shape.n_leaves(), config.words_per_node);
    let forest = HipsForest::from_leaves(shape, config.words_per_node, &leaves)?;
    let set_bits: Vec<u32> = forest
        .roots()
        .map(|d| d.iter().map(|w| w.count_ones()).sum())
        .collect();
    println!("root popcounts: {set_bits:?}");

    let host: Rc<dyn ComputeContext> = Rc::new(HostContext::new());
    let ctx: Rc<dyn ComputeContext> = if force_host {
        host.clone()
    } else {
        let gpu = GpuDevice::new()?;
        println!("GPU: {gpu}");
        Rc::new(gpu)
    };
    println!("context: {}", ctx.name());

    let result = run_pipeline(ctx.clone(), &forest)?;
    println!("B after two steps: {result:?}");

    if !Rc::ptr_eq(&ctx, &host) {
        let reference = run_pipeline(host, &forest)?;
        let max_err = result
            .iter()
            .zip(&reference)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        println!("max |device - host| = {max_err}");
    }
    Ok(())
}

/// Upload the forest, then B := R × (S × B) with a 90° rotation R and a
/// scale S applied to a batch of 2D points.
fn run_pipeline(ctx: Rc<dyn ComputeContext>, forest: &HipsForest) -> Result<Vec<f32>, PipelineError> {
    let mut p = Pipeline::new(ctx.clone());
    let states = p.states_mut();
    let forest_id = states.add_forest("forest", forest)?;
    let scale = states.add_matrix("S", 2, 2)?;
    let rotate = states.add_matrix("R", 2, 2)?;
    let points = states.add_matrix("B", 2, 4)?;
    states.write_matrix(scale, &[2.0, 0.0, 0.0, 3.0])?;
    states.write_matrix(rotate, &[0.0, -1.0, 1.0, 0.0])?;
    states.write_matrix(points, &[1.0, 0.0, -1.0, 2.0, 0.0, 1.0, 0.0, 5.0])?;

    let first = MatMulStep::new(ctx.clone(), p.states(), scale, points)?;
    let second = MatMulStep::new(ctx, p.states(), rotate, points)?;
    p.push(first);
    p.push(second);
    for d in p.dependencies() {
        log::info!("step {} depends on step {} via {}", d.step, d.on, d.state);
    }
    p.run()?;

    let stored = p.states().read_words(forest_id)?;
    log::info!("forest state holds {} words", stored.len());
    p.states().read_matrix(points)
}

fn synthetic_leaves(n_leaves: u32, words: u32) -> Vec<u32> {
    let mut rng = 0x2545_f491u32;
    (0..n_leaves * words)
        .map(|_| {
            rng ^= rng << 13;
            rng ^= rng >> 17;
            rng ^= rng << 5;
            rng & (rng >> 11) & (rng >> 19)
        })
        .collect()
}
