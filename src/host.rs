// host.rs — host-memory reference backend for `ComputeContext`.
//
// Buffers are `Vec<u8>`s; kernels are plain Rust functions looked up by
// entry point. Every dispatch snapshots its arguments, runs the function,
// and writes back the read-write arguments, so a host dispatch has exactly
// the visibility rules of a device dispatch: writes become visible to the
// next call, read-only arguments are never touched.
//
// This is the authoritative reference the wgpu kernels are validated
// against, and the substitutable fake the pipeline tests run on. It also
// counts builds, dispatches and copies so tests can assert "compiled once"
// and "nothing was enqueued".
//
// NEW RUST CONCEPTS:
// - `Cell` / `RefCell` — interior mutability behind `&self`. The trait takes
//   `&self` because steps share the context through an `Rc`; everything
//   runs on one controlling thread, so runtime borrow checks suffice.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::context::{
    BufferHandle, ComputeContext, DeviceError, KernelArg, KernelHandle, ProgramSource,
};
use crate::matmul;

/// A host kernel: receives one byte vector per argument (uniforms included)
/// and the global invocation range.
pub type HostKernel = fn(args: &mut [Vec<u8>], global: [u32; 3]) -> Result<(), String>;

/// Host-memory `ComputeContext`.
pub struct HostContext {
    registry: HashMap<String, HostKernel>,
    buffers: RefCell<HashMap<u64, Vec<u8>>>,
    kernels: RefCell<HashMap<u64, HostKernel>>,
    next_handle: Cell<u64>,
    builds: Cell<usize>,
    dispatches: Cell<usize>,
    copies: Cell<usize>,
}

impl Default for HostContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HostContext {
    /// A context with the built-in kernels registered.
    pub fn new() -> Self {
        let mut ctx = HostContext {
            registry: HashMap::new(),
            buffers: RefCell::new(HashMap::new()),
            kernels: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            builds: Cell::new(0),
            dispatches: Cell::new(0),
            copies: Cell::new(0),
        };
        ctx.register(matmul::ENTRY_POINT, matmul::host_matmul);
        ctx
    }

    /// Register (or replace) the host function behind `entry_point`.
    pub fn register(&mut self, entry_point: &str, kernel: HostKernel) {
        self.registry.insert(entry_point.to_string(), kernel);
    }

    /// Kernels built so far.
    pub fn builds(&self) -> usize {
        self.builds.get()
    }

    /// Dispatches enqueued so far.
    pub fn dispatches(&self) -> usize {
        self.dispatches.get()
    }

    /// Buffer copies enqueued so far.
    pub fn copies(&self) -> usize {
        self.copies.get()
    }

    /// Live buffers.
    pub fn live_buffers(&self) -> usize {
        self.buffers.borrow().len()
    }

    fn next(&self) -> u64 {
        let h = self.next_handle.get();
        self.next_handle.set(h + 1);
        h
    }
}

impl ComputeContext for HostContext {
    fn name(&self) -> &str {
        "host"
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferHandle, DeviceError> {
        let handle = BufferHandle(self.next());
        log::trace!("host: create {handle} `{label}` ({size} bytes)");
        self.buffers.borrow_mut().insert(handle.0, vec![0u8; size as usize]);
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError> {
        let mut buffers = self.buffers.borrow_mut();
        let dst = buffers.get_mut(&buffer.0).ok_or(DeviceError::UnknownBuffer(buffer))?;
        if data.len() > dst.len() {
            return Err(DeviceError::BufferOverflow {
                buffer,
                len: data.len() as u64,
                size: dst.len() as u64,
            });
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle) -> Result<Vec<u8>, DeviceError> {
        self.buffers
            .borrow()
            .get(&buffer.0)
            .cloned()
            .ok_or(DeviceError::UnknownBuffer(buffer))
    }

    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle, size: u64) -> Result<(), DeviceError> {
        let mut buffers = self.buffers.borrow_mut();
        let data = buffers.get(&src.0).ok_or(DeviceError::UnknownBuffer(src))?;
        if size > data.len() as u64 {
            return Err(DeviceError::BufferOverflow { buffer: src, len: size, size: data.len() as u64 });
        }
        let data = data[..size as usize].to_vec();
        let target = buffers.get_mut(&dst.0).ok_or(DeviceError::UnknownBuffer(dst))?;
        if size > target.len() as u64 {
            return Err(DeviceError::BufferOverflow { buffer: dst, len: size, size: target.len() as u64 });
        }
        target[..data.len()].copy_from_slice(&data);
        self.copies.set(self.copies.get() + 1);
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferHandle) {
        self.buffers.borrow_mut().remove(&buffer.0);
    }

    fn build_kernel(&self, program: &ProgramSource, entry_point: &str) -> Result<KernelHandle, DeviceError> {
        let kernel = *self.registry.get(entry_point).ok_or_else(|| DeviceError::ProgramBuild {
            program: program.name,
            entry_point: entry_point.to_string(),
            message: "no host implementation registered".to_string(),
        })?;
        let handle = KernelHandle(self.next());
        self.kernels.borrow_mut().insert(handle.0, kernel);
        self.builds.set(self.builds.get() + 1);
        log::debug!("host: built {handle} `{entry_point}` from {}", program.name);
        Ok(handle)
    }

    fn dispatch(&self, kernel: KernelHandle, args: &[KernelArg<'_>], global: [u32; 3]) -> Result<(), DeviceError> {
        let func = *self.kernels.borrow().get(&kernel.0).ok_or(DeviceError::UnknownKernel(kernel))?;

        let mut values = Vec::with_capacity(args.len());
        {
            let buffers = self.buffers.borrow();
            for arg in args {
                let bytes = match arg {
                    KernelArg::Read(b) | KernelArg::ReadWrite(b) => {
                        buffers.get(&b.0).ok_or(DeviceError::UnknownBuffer(*b))?.clone()
                    }
                    KernelArg::Uniform(bytes) => bytes.to_vec(),
                };
                values.push(bytes);
            }
        }

        func(&mut values, global).map_err(|message| DeviceError::Dispatch { kernel, message })?;

        let mut buffers = self.buffers.borrow_mut();
        for (arg, bytes) in args.iter().zip(values) {
            if let KernelArg::ReadWrite(b) = arg {
                if let Some(dst) = buffers.get_mut(&b.0) {
                    *dst = bytes;
                }
            }
        }
        self.dispatches.set(self.dispatches.get() + 1);
        log::trace!("host: dispatched {kernel} over {global:?}");
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
