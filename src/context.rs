// context.rs — the device execution capability that steps are built on.
//
// A `ComputeContext` is everything a step needs from the outside world:
//
//   create / write / read / copy / release buffers
//   build a kernel from program source + entry point
//   dispatch a kernel over a global index range with bound arguments
//   wait for all enqueued work to finish
//
// It is injected into each step at construction (`Rc<dyn ComputeContext>`)
// rather than living in a global, so a pipeline can run on the wgpu device
// (`gpu::device::GpuDevice`) or on the host reference backend
// (`host::HostContext`) without changing a line of step code.
//
// Buffers and kernels are named by small opaque handles. The context owns
// the real resources; handles are `Copy` and carry no lifetime, which keeps
// the trait object-safe.
//
// ORDERING
// ────────
// Dispatches and copies are enqueued in call order and executed in that
// order by the device queue. `read_buffer` observes every write enqueued
// before it. That in-order guarantee is the only synchronisation the
// pipeline relies on.

use std::fmt;

use thiserror::Error;

/// Opaque handle to a device buffer owned by a `ComputeContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Opaque handle to a compiled kernel owned by a `ComputeContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub(crate) u64);

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel#{}", self.0)
    }
}

/// Program source handed to `build_kernel`.
///
/// `wgsl` may contain `{{WG_X}}` / `{{WG_Y}}` placeholders; the wgpu backend
/// substitutes its active workgroup size before compiling.
#[derive(Debug, Clone, Copy)]
pub struct ProgramSource {
    pub name: &'static str,
    pub wgsl: &'static str,
}

/// One kernel argument. Arguments bind to `@binding(i)` in slice order.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    /// Storage buffer the kernel only reads.
    Read(BufferHandle),
    /// Storage buffer the kernel reads and writes.
    ReadWrite(BufferHandle),
    /// Small uniform block, uploaded per dispatch.
    Uniform(&'a [u8]),
}

/// Device and dispatch failures. These are environment problems, distinct
/// from usage errors (see `step::PipelineError::is_precondition`).
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No adapter passed the non-CPU filter.
    #[error("no suitable Vulkan adapter found (only CPU/software renderers visible)")]
    NoSuitableAdapter,

    #[error("device request failed: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("workgroup size {total} exceeds profile limit of {max} invocations")]
    WorkgroupTooLarge { total: u64, max: u32 },

    #[error("workgroup size {x}×{y} has a zero dimension")]
    EmptyWorkgroup { x: u32, y: u32 },

    #[error("failed to build kernel `{entry_point}` from `{program}`: {message}")]
    ProgramBuild { program: &'static str, entry_point: String, message: String },

    #[error("unknown {0}")]
    UnknownBuffer(BufferHandle),

    #[error("unknown {0}")]
    UnknownKernel(KernelHandle),

    #[error("write of {len} bytes overflows {buffer} ({size} bytes)")]
    BufferOverflow { buffer: BufferHandle, len: u64, size: u64 },

    #[error("dispatch of {kernel} failed: {message}")]
    Dispatch { kernel: KernelHandle, message: String },

    #[error("readback of {buffer} failed: {message}")]
    Readback { buffer: BufferHandle, message: String },
}

/// The opaque device capability: compile, bind, enqueue.
pub trait ComputeContext {
    /// Short name for logs ("host", adapter name, ...).
    fn name(&self) -> &str;

    /// Allocate a zero-filled buffer of `size` bytes.
    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferHandle, DeviceError>;

    /// Overwrite the start of `buffer` with `data`.
    fn write_buffer(&self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError>;

    /// Wait for pending work and return the full contents of `buffer`.
    fn read_buffer(&self, buffer: BufferHandle) -> Result<Vec<u8>, DeviceError>;

    /// Enqueue a copy of `size` bytes from `src` to `dst` (both at offset 0).
    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle, size: u64) -> Result<(), DeviceError>;

    /// Free `buffer`. Unknown handles are ignored.
    fn release_buffer(&self, buffer: BufferHandle);

    /// Compile `program` and create a kernel for `entry_point`.
    fn build_kernel(&self, program: &ProgramSource, entry_point: &str) -> Result<KernelHandle, DeviceError>;

    /// Enqueue one dispatch of `kernel` covering `global` invocations.
    fn dispatch(&self, kernel: KernelHandle, args: &[KernelArg<'_>], global: [u32; 3]) -> Result<(), DeviceError>;

    /// Block until all enqueued work has completed.
    fn finish(&self) -> Result<(), DeviceError>;
}

/// Convert a word slice to bytes for upload.
pub fn words_as_bytes<T: bytemuck::Pod>(words: &[T]) -> &[u8] {
    bytemuck::cast_slice(words)
}

/// Convert readback bytes to 4-byte elements. Trailing bytes are dropped.
pub fn bytes_to_words<T: bytemuck::Pod>(bytes: &[u8]) -> Vec<T> {
    let n = bytes.len() / std::mem::size_of::<T>();
    // Readback Vec<u8> has alignment 1, so copy rather than cast in place.
    bytemuck::pod_collect_to_vec(&bytes[..n * std::mem::size_of::<T>()])
}
