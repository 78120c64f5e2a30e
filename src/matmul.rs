// matmul.rs — matrix-multiply step: B := A × B.
//
// CONVENTION
// ──────────
// A is read-only, B is overwritten in place with A × B. That requires
// A.cols == B.rows for the product to exist, and A.rows == A.cols so the
// product has B's shape. A and B must be distinct states. All of this is
// checked in `MatMulStep::new`, and the shapes again at the top of every
// `execute()`, before any device call.
//
// IN-PLACE WITHOUT RACES
// ──────────────────────
// Output element (i, j) needs the whole of column j of B. Writing B while
// other invocations still read it would race, so the kernel writes into a
// step-owned scratch buffer and the step then enqueues a copy back into B.
// The copy is a transfer on the same in-order queue, not a second dispatch.
//
// KERNEL ARGUMENTS (binding order)
// ────────────────────────────────
//   0  uniform  MatMulParams { m, k, n, _pad }
//   1  storage  A        (read)
//   2  storage  B        (read)
//   3  storage  scratch  (read_write)
//
// Global range: (n, m, 1). x runs over columns, y over rows.

use std::rc::Rc;

use crate::context::{BufferHandle, ComputeContext, KernelArg, KernelHandle, ProgramSource};
use crate::state::{StateId, StateTable};
use crate::step::{PipelineError, Step};

/// Kernel entry point, shared by the WGSL shader and the host backend.
pub const ENTRY_POINT: &str = "matmul";

/// WGSL program for the matrix multiply.
pub const PROGRAM: ProgramSource = ProgramSource {
    name: "matmul.wgsl",
    wgsl: include_str!("shaders/matmul.wgsl"),
};

/// Uniform params (must match WGSL struct MatMulParams exactly).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatMulParams {
    pub m: u32,
    pub k: u32,
    pub n: u32,
    pub _pad: u32,
}

/// `B := A × B` for a square matrix state A and a matrix state B.
pub struct MatMulStep {
    ctx: Rc<dyn ComputeContext>,
    inputs: [StateId; 1],
    input_outputs: [StateId; 1],
    params: MatMulParams,
    kernel: Option<KernelHandle>,
    scratch: Option<BufferHandle>,
}

impl MatMulStep {
    /// Validate shapes and create the step. Nothing is compiled or
    /// allocated until the first `execute()`.
    pub fn new(
        ctx: Rc<dyn ComputeContext>,
        states: &StateTable,
        a: StateId,
        b: StateId,
    ) -> Result<Self, PipelineError> {
        let (a_rows, a_cols) = states.matrix_dims(a)?;
        let (b_rows, b_cols) = states.matrix_dims(b)?;

        if a == b {
            return Err(PipelineError::AliasedState {
                step: "matmul",
                label: states.get(a)?.label().to_string(),
            });
        }

        if a_cols != b_rows {
            return Err(PipelineError::ShapeMismatch {
                step: "matmul",
                detail: format!("A is {a_rows}x{a_cols}, B is {b_rows}x{b_cols}: A.cols != B.rows"),
            });
        }
        if a_rows != a_cols {
            return Err(PipelineError::ShapeMismatch {
                step: "matmul",
                detail: format!("A is {a_rows}x{a_cols}: must be square to overwrite B in place"),
            });
        }

        Ok(MatMulStep {
            ctx,
            inputs: [a],
            input_outputs: [b],
            params: MatMulParams { m: a_rows, k: a_cols, n: b_cols, _pad: 0 },
            kernel: None,
            scratch: None,
        })
    }

    /// Result size in bytes.
    fn out_bytes(&self) -> u64 {
        self.params.m as u64 * self.params.n as u64 * 4
    }

    fn kernel(&mut self) -> Result<KernelHandle, PipelineError> {
        if let Some(k) = self.kernel {
            return Ok(k);
        }
        let k = self.ctx.build_kernel(&PROGRAM, ENTRY_POINT)?;
        self.kernel = Some(k);
        Ok(k)
    }

    fn scratch(&mut self) -> Result<BufferHandle, PipelineError> {
        if let Some(s) = self.scratch {
            return Ok(s);
        }
        let s = self.ctx.create_buffer("matmul scratch", self.out_bytes())?;
        self.scratch = Some(s);
        Ok(s)
    }
}

impl Step for MatMulStep {
    fn name(&self) -> &str {
        "matmul"
    }

    fn inputs(&self) -> &[StateId] {
        &self.inputs
    }

    fn input_outputs(&self) -> &[StateId] {
        &self.input_outputs
    }

    fn execute(&mut self, states: &mut StateTable) -> Result<(), PipelineError> {
        let [a] = self.inputs;
        let [b] = self.input_outputs;

        // The table may not be the one the step was built against.
        let MatMulParams { m, k, n, .. } = self.params;
        let a_dims = states.matrix_dims(a)?;
        let b_dims = states.matrix_dims(b)?;
        if a_dims != (m, k) || b_dims != (k, n) {
            return Err(PipelineError::ShapeMismatch {
                step: "matmul",
                detail: format!(
                    "built for {m}x{k} * {k}x{n}, states are now {}x{} and {}x{}",
                    a_dims.0, a_dims.1, b_dims.0, b_dims.1
                ),
            });
        }

        let a_buf = states.require_ready(a)?.buffer();
        let b_buf = states.require_ready(b)?.buffer();

        let kernel = self.kernel()?;
        let scratch = self.scratch()?;
        let params = self.params;

        log::trace!("matmul: {}x{} * {}x{}", params.m, params.k, params.k, params.n);
        self.ctx.dispatch(
            kernel,
            &[
                KernelArg::Uniform(bytemuck::bytes_of(&params)),
                KernelArg::Read(a_buf),
                KernelArg::Read(b_buf),
                KernelArg::ReadWrite(scratch),
            ],
            [params.n, params.m, 1],
        )?;
        self.ctx.copy_buffer(scratch, b_buf, self.out_bytes())?;
        states.mark_written(b)
    }
}

impl Drop for MatMulStep {
    fn drop(&mut self) {
        if let Some(s) = self.scratch.take() {
            self.ctx.release_buffer(s);
        }
    }
}

/// Host implementation of the `matmul` kernel. Same argument layout and
/// summation order as the WGSL shader.
pub fn host_matmul(args: &mut [Vec<u8>], global: [u32; 3]) -> Result<(), String> {
    let n_args = args.len();
    let [params, a, b, dst] = args else {
        return Err(format!("matmul takes 4 arguments, got {n_args}"));
    };
    if params.len() < std::mem::size_of::<MatMulParams>() {
        return Err("params uniform too small".to_string());
    }
    let p: MatMulParams =
        bytemuck::pod_read_unaligned(&params[..std::mem::size_of::<MatMulParams>()]);
    let (m, k, n) = (p.m as usize, p.k as usize, p.n as usize);

    let a: Vec<f32> = bytemuck::pod_collect_to_vec(a.as_slice());
    let b: Vec<f32> = bytemuck::pod_collect_to_vec(b.as_slice());
    if a.len() < m * k || b.len() < k * n || dst.len() < m * n * 4 {
        return Err(format!("buffers too small for {m}x{k} * {k}x{n}"));
    }

    let mut out = vec![0f32; m * n];
    let rows = m.min(global[1] as usize);
    let cols = n.min(global[0] as usize);
    for row in 0..rows {
        for col in 0..cols {
            let mut acc = 0f32;
            for i in 0..k {
                acc += a[row * k + i] * b[i * n + col];
            }
            out[row * n + col] = acc;
        }
    }
    dst[..m * n * 4].copy_from_slice(bytemuck::cast_slice(&out));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostContext;

    fn setup() -> (Rc<HostContext>, Rc<dyn ComputeContext>, StateTable) {
        let host = Rc::new(HostContext::new());
        let ctx: Rc<dyn ComputeContext> = host.clone();
        let states = StateTable::new(ctx.clone());
        (host, ctx, states)
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<MatMulParams>(), 16);
    }

    #[test]
    fn test_product_2x2_times_2x3() {
        let (_host, ctx, mut states) = setup();
        let a = states.add_matrix("A", 2, 2).unwrap();
        let b = states.add_matrix("B", 2, 3).unwrap();
        states.write_matrix(a, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        states.write_matrix(b, &[1.0, 0.0, 2.0, 0.0, 1.0, 3.0]).unwrap();

        let mut step = MatMulStep::new(ctx, &states, a, b).unwrap();
        step.execute(&mut states).unwrap();

        // [1 2] [1 0 2]   [1 2  8]
        // [3 4] [0 1 3] = [3 4 18]
        assert_eq!(states.read_matrix(b).unwrap(), vec![1.0, 2.0, 8.0, 3.0, 4.0, 18.0]);
        assert_eq!(states.read_matrix(a).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_orientation_is_a_times_b() {
        // A×B and B×A differ for these; the step must give A×B.
        let (_host, ctx, mut states) = setup();
        let a = states.add_matrix("A", 2, 2).unwrap();
        let b = states.add_matrix("B", 2, 2).unwrap();
        states.write_matrix(a, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        states.write_matrix(b, &[1.0, 2.0, 3.0, 4.0]).unwrap();

        let mut step = MatMulStep::new(ctx, &states, a, b).unwrap();
        step.execute(&mut states).unwrap();
        // A×B picks B's second row into the first: [3 4; 0 0]. B×A would be [0 1; 0 3].
        assert_eq!(states.read_matrix(b).unwrap(), vec![3.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_kernel_built_once() {
        let (host, ctx, mut states) = setup();
        let a = states.add_matrix("A", 3, 3).unwrap();
        let b = states.add_matrix("B", 3, 1).unwrap();
        states.write_matrix(a, &[2.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0]).unwrap();
        states.write_matrix(b, &[1.0, 2.0, 3.0]).unwrap();

        let mut step = MatMulStep::new(ctx, &states, a, b).unwrap();
        assert_eq!(host.builds(), 0);
        for _ in 0..3 {
            step.execute(&mut states).unwrap();
        }
        assert_eq!(host.builds(), 1);
        assert_eq!(host.dispatches(), 3);
        assert_eq!(states.read_matrix(b).unwrap(), vec![8.0, 16.0, 24.0]);
    }

    #[test]
    fn test_shape_mismatch_rejected_before_device() {
        let (host, ctx, mut states) = setup();
        let a = states.add_matrix("A", 2, 3).unwrap();
        let b = states.add_matrix("B", 2, 2).unwrap();
        let err = MatMulStep::new(ctx.clone(), &states, a, b).err().unwrap();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
        assert!(err.is_precondition());

        // Non-square A with matching inner dimension.
        let a2 = states.add_matrix("A2", 3, 2).unwrap();
        assert!(MatMulStep::new(ctx.clone(), &states, a2, b).is_err());

        let d = states.add_descriptors("D", 2, 2).unwrap();
        assert!(matches!(
            MatMulStep::new(ctx, &states, d, b),
            Err(PipelineError::KindMismatch { .. })
        ));
        assert_eq!(host.builds(), 0);
        assert_eq!(host.dispatches(), 0);
    }

    #[test]
    fn test_same_state_for_both_operands_rejected() {
        let (host, ctx, mut states) = setup();
        let a = states.add_matrix("A", 2, 2).unwrap();
        states.write_matrix(a, &[1.0, 1.0, 0.0, 1.0]).unwrap();

        let err = MatMulStep::new(ctx, &states, a, a).err().unwrap();
        assert!(matches!(err, PipelineError::AliasedState { step: "matmul", .. }));
        assert!(err.is_precondition());
        assert_eq!(host.builds() + host.dispatches(), 0);
        assert_eq!(states.read_matrix(a).unwrap(), vec![1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_execute_rechecks_shapes_of_the_given_table() {
        let (host, ctx, mut built_on) = setup();
        let a = built_on.add_matrix("A", 2, 2).unwrap();
        let b = built_on.add_matrix("B", 2, 3).unwrap();
        let mut step = MatMulStep::new(ctx.clone(), &built_on, a, b).unwrap();

        // Same ids, different shapes: Y is 3x2 where B was 2x3.
        let mut other = StateTable::new(ctx);
        let x = other.add_matrix("X", 2, 2).unwrap();
        let y = other.add_matrix("Y", 3, 2).unwrap();
        assert_eq!((x, y), (a, b));
        other.write_matrix(x, &[1.0; 4]).unwrap();
        other.write_matrix(y, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();

        let err = step.execute(&mut other).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
        assert!(err.is_precondition());
        assert_eq!(host.builds() + host.dispatches(), 0);
        assert_eq!(other.read_matrix(y).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        // A descriptor state under B's id is a kind mismatch.
        let mut third = StateTable::new(step.ctx.clone());
        third.add_matrix("A", 2, 2).unwrap();
        third.add_descriptors("D", 2, 3).unwrap();
        assert!(matches!(step.execute(&mut third), Err(PipelineError::KindMismatch { .. })));
        assert_eq!(host.dispatches(), 0);
    }

    #[test]
    fn test_unpopulated_input_rejected_before_dispatch() {
        let (host, ctx, mut states) = setup();
        let a = states.add_matrix("A", 2, 2).unwrap();
        let b = states.add_matrix("B", 2, 2).unwrap();
        states.write_matrix(b, &[1.0; 4]).unwrap();

        let mut step = MatMulStep::new(ctx, &states, a, b).unwrap();
        assert!(matches!(step.execute(&mut states), Err(PipelineError::StateNotReady { .. })));
        assert_eq!(host.dispatches(), 0);
    }

    #[test]
    fn test_drop_releases_scratch() {
        let (host, ctx, mut states) = setup();
        let a = states.add_matrix("A", 2, 2).unwrap();
        let b = states.add_matrix("B", 2, 2).unwrap();
        states.write_matrix(a, &[1.0; 4]).unwrap();
        states.write_matrix(b, &[1.0; 4]).unwrap();

        let mut step = MatMulStep::new(ctx, &states, a, b).unwrap();
        step.execute(&mut states).unwrap();
        assert_eq!(host.live_buffers(), 3);
        drop(step);
        assert_eq!(host.live_buffers(), 2);
    }

    // ---- GPU vs host (subprocess isolation, see gpu::device tests) ----

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args(["test", "--lib", "--", test_name, "--exact", "--ignored", "--nocapture"])
            .output()
            .unwrap_or_else(|e| panic!("subprocess failed for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}"); eprint!("{stderr}");
        stdout + &stderr
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_host() {
        use crate::gpu::device::GpuDevice;

        // Small integers keep every partial sum exact in f32.
        let mut rng = 99991u32;
        let mut next = || {
            rng = rng.wrapping_mul(1664525).wrapping_add(1013904223);
            ((rng >> 28) as f32) - 8.0
        };
        let a_data: Vec<f32> = (0..17 * 17).map(|_| next()).collect();
        let b_data: Vec<f32> = (0..17 * 33).map(|_| next()).collect();

        let run = |ctx: Rc<dyn ComputeContext>| -> Vec<f32> {
            let mut states = StateTable::new(ctx.clone());
            let a = states.add_matrix("A", 17, 17).unwrap();
            let b = states.add_matrix("B", 17, 33).unwrap();
            states.write_matrix(a, &a_data).unwrap();
            states.write_matrix(b, &b_data).unwrap();
            let mut step = MatMulStep::new(ctx, &states, a, b).unwrap();
            step.execute(&mut states).unwrap();
            states.read_matrix(b).unwrap()
        };

        let host = run(Rc::new(HostContext::new()));
        let gpu = run(Rc::new(GpuDevice::new().expect("need Vulkan GPU")));
        assert_eq!(gpu, host);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_matches_host() {
        let out = run_gpu_test_in_subprocess("matmul::tests::inner_gpu_matches_host");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
