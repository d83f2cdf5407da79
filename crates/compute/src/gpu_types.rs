//! Plain-old-data records shared with the WGSL shaders.
//!
//! Field order and padding must match the struct declarations in
//! `shaders/cast_rays.wgsl` and `shaders/forward.wgsl`.

use bytemuck::{Pod, Zeroable};

pub const HIT_NONE: u32 = 0;
pub const HIT_BOUNDARY: u32 = 1;
pub const HIT_FOOD: u32 = 2;
pub const HIT_AGENT: u32 = 3;
pub const HIT_OBSTACLE: u32 = 4;

/// Marks "no entity" in index and owner fields.
pub const NO_INDEX: u32 = u32::MAX;

pub const ENTITY_FOOD: u32 = 0;
pub const ENTITY_AGENT: u32 = 1;

/// Hits closer than this are treated as self-intersections.
pub const RAY_EPSILON: f32 = 1e-4;

/// Upper bound of `input_size + hidden_size` for the forward shader.
pub const MAX_FORWARD_ROW: usize = 256;
/// Upper bound of `hidden_size` for the forward shader.
pub const MAX_FORWARD_HIDDEN: usize = 64;

/// Workgroup size written into the shader sources before specialization.
pub const DEFAULT_WORKGROUP_SIZE: u32 = 64;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RayParams {
    pub world_size: [f32; 2],
    pub agent_count: u32,
    pub entity_count: u32,
    pub segment_count: u32,
    /// Ray slots per agent in the padded output grid.
    pub max_rays: u32,
    pub grid_dims: [u32; 2],
    pub cell_size: f32,
    /// 1 when the cell tables are populated.
    pub use_grid: u32,
    pub sensor_arc: f32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuAgent {
    pub pos: [f32; 2],
    pub angle: f32,
    pub size: f32,
    pub ray_count: u32,
    pub max_dist: f32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuEntity {
    pub pos: [f32; 2],
    pub size: f32,
    pub kind: u32,
    /// Index of the casting agent this body belongs to, or [`NO_INDEX`].
    pub owner: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GpuSegment {
    pub a: [f32; 2],
    pub b: [f32; 2],
    pub obstacle: u32,
    pub radius: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct GpuRayHit {
    pub distance: f32,
    pub hit_type: u32,
    pub index: u32,
    pub size: f32,
}

impl GpuRayHit {
    #[must_use]
    pub fn miss(max_dist: f32) -> Self {
        Self {
            distance: max_dist,
            hit_type: HIT_NONE,
            index: NO_INDEX,
            size: 0.0,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ForwardParams {
    pub agent_count: u32,
    pub input_size: u32,
    pub hidden_size: u32,
    pub output_size: u32,
}

impl ForwardParams {
    /// Length of one agent's combined input row (inputs then recurrent hidden).
    #[must_use]
    pub fn row_len(&self) -> usize {
        (self.input_size + self.hidden_size) as usize
    }

    /// Floats written per agent: the new hidden state followed by the outputs.
    #[must_use]
    pub fn out_len(&self) -> usize {
        (self.hidden_size + self.output_size) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn record_sizes_match_shader_layout() {
        assert_eq!(size_of::<RayParams>(), 48);
        assert_eq!(size_of::<GpuAgent>(), 32);
        assert_eq!(size_of::<GpuEntity>(), 24);
        assert_eq!(size_of::<GpuSegment>(), 24);
        assert_eq!(size_of::<GpuRayHit>(), 16);
        assert_eq!(size_of::<ForwardParams>(), 16);
    }

    #[test]
    fn forward_lengths() {
        let p = ForwardParams {
            agent_count: 3,
            input_size: 4,
            hidden_size: 2,
            output_size: 5,
        };
        assert_eq!(p.row_len(), 6);
        assert_eq!(p.out_len(), 7);
    }
}
