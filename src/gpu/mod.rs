// gpu/mod.rs — wgpu backend.
//
// `GpuDevice` implements `ComputeContext` on a Vulkan adapter. Every step in
// the crate is written against the trait, so the same pipeline runs here or
// on `host::HostContext`; the host backend remains the reference that GPU
// results are validated against.

pub mod device;
