//! Binding slots shared by the WGSL shaders, the wgpu bind group layouts and
//! the CPU kernel mirrors.

use crate::Kernel;

pub const PARAMS: u32 = 0;

// CastRays
pub const RAY_AGENTS: u32 = 1;
pub const RAY_ENTITIES: u32 = 2;
pub const RAY_SEGMENTS: u32 = 3;
pub const RAY_CELL_RANGES: u32 = 4;
pub const RAY_CELL_INDICES: u32 = 5;
pub const RAY_HITS: u32 = 6;

// Forward
pub const FWD_INPUTS: u32 = 1;
pub const FWD_WEIGHTS1: u32 = 2;
pub const FWD_WEIGHTS2: u32 = 3;
pub const FWD_OUTPUTS: u32 = 4;

const _: () = assert!(RAY_HITS == binding_count(&Kernel::CastRays) - 1);
const _: () = assert!(FWD_OUTPUTS == binding_count(&Kernel::Forward) - 1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    StorageRead,
    StorageReadWrite,
}

/// Return expected number of bindings for each kernel.
pub const fn binding_count(kernel: &Kernel) -> u32 {
    match kernel {
        Kernel::CastRays => 7,
        Kernel::Forward => 5,
    }
}

/// The single writable binding of each kernel; its contents are read back.
pub const fn output_binding(kernel: &Kernel) -> u32 {
    match kernel {
        Kernel::CastRays => RAY_HITS,
        Kernel::Forward => FWD_OUTPUTS,
    }
}

pub const fn binding_kind(kernel: &Kernel, binding: u32) -> BindingKind {
    if binding == PARAMS {
        BindingKind::Uniform
    } else if binding == output_binding(kernel) {
        BindingKind::StorageReadWrite
    } else {
        BindingKind::StorageRead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_uniform_and_outputs_writable() {
        for kernel in [Kernel::CastRays, Kernel::Forward] {
            assert_eq!(binding_kind(&kernel, PARAMS), BindingKind::Uniform);
            assert_eq!(
                binding_kind(&kernel, output_binding(&kernel)),
                BindingKind::StorageReadWrite
            );
            let read_only = (1..binding_count(&kernel) - 1)
                .filter(|b| binding_kind(&kernel, *b) == BindingKind::StorageRead)
                .count() as u32;
            assert_eq!(read_only, binding_count(&kernel) - 2);
        }
    }
}
