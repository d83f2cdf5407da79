//! Sensor ray casting.
//!
//! Every ray is tested against the world edge, then entities, then obstacle
//! edges, keeping the nearest hit strictly closer than the current best.
//! Ties therefore keep the earlier category. [`cpu`] and [`accelerated`]
//! implement the same rules and agree to within floating-point noise.

pub mod accelerated;
pub mod cpu;
pub mod geometry;

pub use accelerated::{AcceleratedRaycaster, RayTicket};
pub use cpu::cast_rays_cpu;
pub use geometry::{build_segments, ObstacleSegment};

use crate::spatial::SpatialIndex;
use crate::types::{Agent, Entity, WorldBounds};

/// Everything a ray can hit during one tick.
#[derive(Debug, Clone, Copy)]
pub struct RayScene<'a> {
    pub bounds: WorldBounds,
    pub entities: &'a [Entity],
    pub segments: &'a [ObstacleSegment],
    /// Restricts entity tests to grid neighbours of the ray when present.
    pub index: Option<&'a SpatialIndex>,
    pub sensor_arc: f32,
}

impl RayScene<'_> {
    /// Number of obstacles the segments were built from.
    #[must_use]
    pub fn obstacle_count(&self) -> usize {
        self.segments.last().map_or(0, |s| s.obstacle + 1)
    }
}

/// Ray length of `agent`, with unusable values collapsed to zero.
#[must_use]
pub fn max_distance(agent: &Agent) -> f32 {
    if agent.max_ray_distance.is_finite() && agent.max_ray_distance > 0.0 {
        agent.max_ray_distance
    } else {
        0.0
    }
}
