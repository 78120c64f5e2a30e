// gpu/device.rs — wgpu device and its `ComputeContext` implementation.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Expose a `DeviceProfile` for simulating hardware limits on a
//     development machine (e.g., cap invocations to match Raspberry Pi).
//   - Provide `WorkgroupSize` — validated against the active profile and
//     substituted into WGSL templates at kernel build time.
//   - Own every buffer and compute pipeline a step creates, behind the
//     opaque handles of `ComputeContext`.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics that
// may grab llvmpipe/softpipe on WSL2 (where the software renderer appears
// as a valid Vulkan device). We enumerate explicitly and prefer anything
// that is not DeviceType::Cpu.
//
// DEVICE LIMITS:
// We request *lower* limits than the hardware actually supports when
// running under a non-Native profile. wgpu validates every dispatch against
// the requested limits, so violations that would crash on RPi are caught at
// dev time on the laptop.
//
// KERNEL BUILD ERRORS:
// wgpu reports shader and pipeline validation failures through the device's
// error callback, not through return values. `build_kernel` and `dispatch`
// wrap their calls in a validation error scope and turn whatever it catches
// into a `DeviceError`, so a bad shader is an Err, not a panic.
//
// NEW RUST CONCEPTS:
// - `pollster::block_on` — runs an async fn to completion on the current
//   thread. wgpu's device/adapter API is async because on WebGPU it maps
//   to JS Promises, but for native Vulkan we just block.
// - `RefCell<HashMap<..>>` — the handle tables mutate behind `&self`
//   because the context is shared by every step through an `Rc`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;

use wgpu::util::DeviceExt;

use crate::context::{
    BufferHandle, ComputeContext, DeviceError, KernelArg, KernelHandle, ProgramSource,
};

/// Hardware profile controlling device limits and default workgroup sizes.
///
/// Use `Native` for best performance on your development machine.
/// Use `RaspberryPi` to simulate RPi 4/5 constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProfile {
    /// Use the adapter's actual hardware limits. No artificial caps.
    Native,
    /// Simulate Raspberry Pi 4/5 (Broadcom VideoCore VI/VII, V3DV Vulkan).
    /// Caps `max_compute_invocations_per_workgroup` to 256.
    RaspberryPi,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::RaspberryPi => write!(f, "RaspberryPi (simulated limits)"),
        }
    }
}

/// A workgroup size configuration for 2D compute dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    /// Total invocations per workgroup (x * y).
    pub fn total(&self) -> u32 {
        self.x * self.y
    }

    /// Substitute `{{WG_X}}` / `{{WG_Y}}` in a WGSL template.
    pub fn apply(&self, template: &str) -> String {
        template
            .replace("{{WG_X}}", &self.x.to_string())
            .replace("{{WG_Y}}", &self.y.to_string())
    }

    /// Workgroups needed to cover `global` invocations (ceiling division).
    ///
    /// The shader must guard against out-of-range global IDs.
    pub fn workgroups_for(&self, global: [u32; 3]) -> [u32; 3] {
        [global[0].div_ceil(self.x), global[1].div_ceil(self.y), global[2].max(1)]
    }

    /// Check `x × y` against the profile's invocation limit. Both
    /// dimensions must be non-zero.
    pub fn validated(x: u32, y: u32, profile: DeviceProfile) -> Result<Self, DeviceError> {
        if x == 0 || y == 0 {
            return Err(DeviceError::EmptyWorkgroup { x, y });
        }
        let max = max_invocations_for_profile(profile);
        // Widened so u32::MAX × 2 is reported, not wrapped.
        let total = x as u64 * y as u64;
        if total > max as u64 {
            return Err(DeviceError::WorkgroupTooLarge { total, max });
        }
        Ok(WorkgroupSize { x, y })
    }

    /// Validated default for a profile.
    ///
    /// - `Native`: 16×8 = 128 invocations (4 NVIDIA warps, 2 AMD waves).
    /// - `RaspberryPi`: 8×8 = 64, well inside the 256 invocation limit.
    fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Native => WorkgroupSize { x: 16, y: 8 },
            DeviceProfile::RaspberryPi => WorkgroupSize { x: 8, y: 8 },
        }
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct GpuKernel {
    pipeline: wgpu::ComputePipeline,
    workgroup_size: WorkgroupSize,
}

/// The GPU context: adapter, device, queue, active profile, and the
/// buffers and kernels created through `ComputeContext`.
///
/// # Field drop order
/// Rust drops struct fields in declaration order (top → bottom). The
/// handle tables go first, then device and queue, and `_instance` last so
/// the Vulkan instance outlives every device-level object (dzn on WSL2
/// crashes otherwise).
pub struct GpuDevice {
    buffers: RefCell<HashMap<u64, GpuBuffer>>,
    kernels: RefCell<HashMap<u64, GpuKernel>>,
    next_handle: Cell<u64>,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub profile: DeviceProfile,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a `GpuDevice` on the first non-CPU Vulkan adapter, with
    /// `DeviceProfile::Native` limits.
    pub fn new() -> Result<Self, DeviceError> {
        Self::new_with_profile(DeviceProfile::Native)
    }

    /// Create a `GpuDevice` with an explicit hardware profile.
    pub fn new_with_profile(profile: DeviceProfile) -> Result<Self, DeviceError> {
        pollster::block_on(Self::init_async(profile))
    }

    async fn init_async(profile: DeviceProfile) -> Result<Self, DeviceError> {
        // Validation layer in debug builds for shader error feedback.
        // ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets dzn (WSL2) enumerate.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let all_adapters = instance.enumerate_adapters(wgpu::Backends::VULKAN);
        if all_adapters.is_empty() {
            return Err(DeviceError::NoSuitableAdapter);
        }
        for a in &all_adapters {
            let info = a.get_info();
            log::info!("Vulkan adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        // Tier 1: anything that is not a software renderer.
        // Tier 2 (last resort): whatever exists.
        let mut all_adapters = all_adapters;
        let pick = all_adapters
            .iter()
            .position(|a| a.get_info().device_type != wgpu::DeviceType::Cpu)
            .unwrap_or(0);
        let adapter = all_adapters.swap_remove(pick);

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };
        if raw_info.device_type == wgpu::DeviceType::Cpu {
            log::warn!("only a software adapter is available: {adapter_info}");
        }

        // Auto-detect RPi when the caller passed Native but the adapter is V3D.
        let profile = match profile {
            DeviceProfile::Native if raw_info.name.to_ascii_lowercase().contains("v3d") => {
                log::info!("V3D adapter detected, using RaspberryPi profile");
                DeviceProfile::RaspberryPi
            }
            other => other,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("hips-forest"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits_for_profile(profile),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await?;

        let workgroup_size = WorkgroupSize::for_profile(profile);
        log::info!("GPU ready: {adapter_info}, profile {profile}, workgroup {workgroup_size}");

        Ok(GpuDevice {
            buffers: RefCell::new(HashMap::new()),
            kernels: RefCell::new(HashMap::new()),
            next_handle: Cell::new(1),
            device,
            queue,
            profile,
            adapter_info,
            workgroup_size,
            _instance: instance,
        })
    }

    /// Override the default workgroup size, validating against the active
    /// profile. Affects kernels built afterwards.
    pub fn set_workgroup_size(&mut self, x: u32, y: u32) -> Result<(), DeviceError> {
        self.workgroup_size = WorkgroupSize::validated(x, y, self.profile)?;
        Ok(())
    }

    fn next(&self) -> u64 {
        let h = self.next_handle.get();
        self.next_handle.set(h + 1);
        h
    }

    /// Run `f` inside a validation error scope and return what it caught.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f();
        let err = pollster::block_on(self.device.pop_error_scope());
        (out, err)
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice {{ adapter: {}, profile: {}, workgroup: {} }}",
            self.adapter_info, self.profile, self.workgroup_size
        )
    }
}

impl ComputeContext for GpuDevice {
    fn name(&self) -> &str {
        &self.adapter_info.name
    }

    fn create_buffer(&self, label: &str, size: u64) -> Result<BufferHandle, DeviceError> {
        // Copies and writes must be 4-byte aligned; wgpu zero-fills.
        let padded = align_to(size.max(4), wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.next());
        self.buffers.borrow_mut().insert(handle.0, GpuBuffer { buffer, size });
        log::trace!("gpu: create {handle} `{label}` ({size} bytes)");
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError> {
        let buffers = self.buffers.borrow();
        let dst = buffers.get(&buffer.0).ok_or(DeviceError::UnknownBuffer(buffer))?;
        if data.len() as u64 > dst.size {
            return Err(DeviceError::BufferOverflow { buffer, len: data.len() as u64, size: dst.size });
        }
        if data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(&dst.buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(align_to(data.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
            self.queue.write_buffer(&dst.buffer, 0, &padded);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle) -> Result<Vec<u8>, DeviceError> {
        let buffers = self.buffers.borrow();
        let src = buffers.get(&buffer.0).ok_or(DeviceError::UnknownBuffer(buffer))?;
        let padded = src.buffer.size();

        let rb = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: padded,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(&src.buffer, 0, &rb, 0, padded);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = rb.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| DeviceError::Readback { buffer, message: e.to_string() })?
            .map_err(|e| DeviceError::Readback { buffer, message: e.to_string() })?;

        let bytes = slice.get_mapped_range()[..src.size as usize].to_vec();
        rb.unmap();
        Ok(bytes)
    }

    fn copy_buffer(&self, src: BufferHandle, dst: BufferHandle, size: u64) -> Result<(), DeviceError> {
        let buffers = self.buffers.borrow();
        let s = buffers.get(&src.0).ok_or(DeviceError::UnknownBuffer(src))?;
        let d = buffers.get(&dst.0).ok_or(DeviceError::UnknownBuffer(dst))?;
        for (handle, b) in [(src, s), (dst, d)] {
            if size > b.size {
                return Err(DeviceError::BufferOverflow { buffer: handle, len: size, size: b.size });
            }
        }
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("copy") });
        encoder.copy_buffer_to_buffer(
            &s.buffer,
            0,
            &d.buffer,
            0,
            align_to(size, wgpu::COPY_BUFFER_ALIGNMENT),
        );
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn release_buffer(&self, buffer: BufferHandle) {
        if let Some(b) = self.buffers.borrow_mut().remove(&buffer.0) {
            b.buffer.destroy();
        }
    }

    fn build_kernel(&self, program: &ProgramSource, entry_point: &str) -> Result<KernelHandle, DeviceError> {
        let workgroup_size = self.workgroup_size;
        let source = workgroup_size.apply(program.wgsl);

        let (pipeline, err) = self.scoped(|| {
            let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(program.name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            // layout: None derives the bind group layout from the shader.
            self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &module,
                entry_point,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        });
        if let Some(e) = err {
            return Err(DeviceError::ProgramBuild {
                program: program.name,
                entry_point: entry_point.to_string(),
                message: e.to_string(),
            });
        }

        let handle = KernelHandle(self.next());
        self.kernels.borrow_mut().insert(handle.0, GpuKernel { pipeline, workgroup_size });
        log::debug!("gpu: built {handle} `{entry_point}` from {} ({workgroup_size})", program.name);
        Ok(handle)
    }

    fn dispatch(&self, kernel: KernelHandle, args: &[KernelArg<'_>], global: [u32; 3]) -> Result<(), DeviceError> {
        let kernels = self.kernels.borrow();
        let k = kernels.get(&kernel.0).ok_or(DeviceError::UnknownKernel(kernel))?;
        let buffers = self.buffers.borrow();

        // Uniform blocks are uploaded first so the bind group can borrow them.
        let uniforms: Vec<Option<wgpu::Buffer>> = args
            .iter()
            .map(|arg| match arg {
                KernelArg::Uniform(bytes) => {
                    Some(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("uniform"),
                        contents: bytes,
                        usage: wgpu::BufferUsages::UNIFORM,
                    }))
                }
                _ => None,
            })
            .collect();

        let mut entries = Vec::with_capacity(args.len());
        for (i, (arg, uniform)) in args.iter().zip(&uniforms).enumerate() {
            let resource = match (arg, uniform) {
                (KernelArg::Read(h) | KernelArg::ReadWrite(h), _) => buffers
                    .get(&h.0)
                    .ok_or(DeviceError::UnknownBuffer(*h))?
                    .buffer
                    .as_entire_binding(),
                (KernelArg::Uniform(_), Some(buf)) => buf.as_entire_binding(),
                (KernelArg::Uniform(_), None) => {
                    return Err(DeviceError::Dispatch {
                        kernel,
                        message: format!("uniform argument {i} was not uploaded"),
                    })
                }
            };
            entries.push(wgpu::BindGroupEntry { binding: i as u32, resource });
        }

        let [wx, wy, wz] = k.workgroup_size.workgroups_for(global);
        let ((), err) = self.scoped(|| {
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("step args"),
                layout: &k.pipeline.get_bind_group_layout(0),
                entries: &entries,
            });
            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("step dispatch") });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("step"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&k.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(wx, wy, wz);
            }
            self.queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(e) = err {
            return Err(DeviceError::Dispatch { kernel, message: e.to_string() });
        }
        log::trace!("gpu: dispatched {kernel} as {wx}×{wy}×{wz} workgroups");
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_to(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

// ============================================================
// Limits helpers
// ============================================================

/// Build wgpu limits for the given profile.
fn limits_for_profile(profile: DeviceProfile) -> wgpu::Limits {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default(),

        DeviceProfile::RaspberryPi => wgpu::Limits {
            // VideoCore VI/VII: vulkaninfo reports 256 max invocations.
            max_compute_invocations_per_workgroup: 256,
            max_compute_workgroup_size_x: 256,
            max_compute_workgroup_size_y: 256,
            max_compute_workgroup_size_z: 64,
            // 128 MiB is plenty for a 2048-leaf forest of wide descriptors.
            max_storage_buffer_binding_size: 128 << 20,
            ..wgpu::Limits::default()
        },
    }
}

/// Maximum compute invocations per workgroup for the given profile.
fn max_invocations_for_profile(profile: DeviceProfile) -> u32 {
    match profile {
        DeviceProfile::Native => wgpu::Limits::default().max_compute_invocations_per_workgroup,
        DeviceProfile::RaspberryPi => 256,
    }
}

// ============================================================
// Tests
// ============================================================
