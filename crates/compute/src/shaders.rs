use crate::gpu_types::DEFAULT_WORKGROUP_SIZE;
use crate::Kernel;

pub const CAST_RAYS_WGSL: &str = include_str!("../../../shaders/cast_rays.wgsl");
pub const FORWARD_WGSL: &str = include_str!("../../../shaders/forward.wgsl");

#[must_use]
pub fn source(kernel: Kernel) -> &'static str {
    match kernel {
        Kernel::CastRays => CAST_RAYS_WGSL,
        Kernel::Forward => FORWARD_WGSL,
    }
}

/// Shader source with the workgroup size constant replaced.
#[must_use]
pub fn specialize(kernel: Kernel, workgroup_size: u32) -> String {
    let from = format!("const WORKGROUP_SIZE: u32 = {DEFAULT_WORKGROUP_SIZE}u;");
    let to = format!("const WORKGROUP_SIZE: u32 = {workgroup_size}u;");
    source(kernel).replacen(&from, &to, 1)
}
