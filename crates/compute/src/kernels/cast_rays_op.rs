use crate::gpu_types::{
    GpuAgent, GpuEntity, GpuRayHit, GpuSegment, RayParams, ENTITY_AGENT, HIT_BOUNDARY, HIT_FOOD,
    HIT_OBSTACLE, NO_INDEX, RAY_EPSILON,
};
use crate::kernels::{read_one, read_pod};
use crate::layout::{
    PARAMS, RAY_AGENTS, RAY_CELL_INDICES, RAY_CELL_RANGES, RAY_ENTITIES, RAY_SEGMENTS,
};
use crate::{BufferView, ComputeError, Kernel};

type V2 = [f32; 2];

struct Scene {
    params: RayParams,
    entities: Vec<GpuEntity>,
    segments: Vec<GpuSegment>,
    cell_ranges: Vec<[u32; 2]>,
    cell_indices: Vec<u32>,
}

pub fn handle_cast_rays(binds: &[BufferView]) -> Result<Vec<Vec<u8>>, ComputeError> {
    if binds.len() != Kernel::CastRays.binding_count() as usize {
        return Err(ComputeError::ShapeMismatch(
            "CastRays kernel expects 7 buffers",
        ));
    }
    let params: RayParams = read_one(&binds[PARAMS as usize], "CastRays params buffer too small")?;
    let agents: Vec<GpuAgent> = read_pod(
        &binds[RAY_AGENTS as usize],
        params.agent_count as usize,
        "CastRays agent buffer shorter than agent_count",
    )?;
    let entities = read_pod(
        &binds[RAY_ENTITIES as usize],
        params.entity_count as usize,
        "CastRays entity buffer shorter than entity_count",
    )?;
    let segments = read_pod(
        &binds[RAY_SEGMENTS as usize],
        params.segment_count as usize,
        "CastRays segment buffer shorter than segment_count",
    )?;

    let (cell_ranges, cell_indices) = if params.use_grid == 1 {
        if params.grid_dims[0] == 0 || params.grid_dims[1] == 0 || params.cell_size <= 0.0 {
            return Err(ComputeError::ShapeMismatch(
                "CastRays grid enabled with an empty grid",
            ));
        }
        let cells = params.grid_dims[0] as usize * params.grid_dims[1] as usize;
        let ranges: Vec<[u32; 2]> = read_pod(
            &binds[RAY_CELL_RANGES as usize],
            cells,
            "CastRays cell range buffer shorter than grid",
        )?;
        let indexed = ranges
            .iter()
            .map(|[start, count]| (*start as usize) + (*count as usize))
            .max()
            .unwrap_or(0);
        let indices = read_pod(
            &binds[RAY_CELL_INDICES as usize],
            indexed,
            "CastRays cell index buffer shorter than its ranges",
        )?;
        (ranges, indices)
    } else {
        (Vec::new(), Vec::new())
    };

    let scene = Scene {
        params,
        entities,
        segments,
        cell_ranges,
        cell_indices,
    };

    let max_rays = params.max_rays;
    let mut hits = Vec::with_capacity(agents.len() * max_rays as usize);
    for (agent_index, agent) in agents.iter().enumerate() {
        for ray in 0..max_rays {
            hits.push(trace(&scene, agent_index as u32, agent, ray));
        }
    }
    Ok(vec![bytemuck::cast_slice(&hits).to_vec()])
}

fn trace(scene: &Scene, agent_index: u32, agent: &GpuAgent, ray: u32) -> GpuRayHit {
    let mut best = GpuRayHit::miss(agent.max_dist);
    if ray >= agent.ray_count {
        return best;
    }
    let params = &scene.params;
    let theta =
        agent.angle + ((ray as f32 + 0.5) / agent.ray_count as f32 - 0.5) * params.sensor_arc;
    let dir = [theta.cos(), theta.sin()];
    let origin = agent.pos;

    let tb = boundary_distance(params.world_size, origin, dir);
    if tb < best.distance {
        best = GpuRayHit {
            distance: tb,
            hit_type: HIT_BOUNDARY,
            index: NO_INDEX,
            size: 0.0,
        };
    }

    let mut test_entity = |index: u32| {
        let Some(entity) = scene.entities.get(index as usize) else {
            return;
        };
        if entity.kind == ENTITY_AGENT && entity.owner == agent_index {
            return;
        }
        let t = ray_circle(origin, dir, entity.pos, entity.size);
        if t > 0.0 && t < best.distance {
            best = GpuRayHit {
                distance: t,
                hit_type: HIT_FOOD + entity.kind,
                index,
                size: entity.size,
            };
        }
    };

    if params.use_grid == 1 {
        let end = [origin[0] + dir[0] * agent.max_dist, origin[1] + dir[1] * agent.max_dist];
        let lo = cell_of(params, [origin[0].min(end[0]), origin[1].min(end[1])]);
        let hi = cell_of(params, [origin[0].max(end[0]), origin[1].max(end[1])]);
        let x0 = lo[0].saturating_sub(1);
        let y0 = lo[1].saturating_sub(1);
        let x1 = (hi[0] + 1).min(params.grid_dims[0] - 1);
        let y1 = (hi[1] + 1).min(params.grid_dims[1] - 1);
        for cy in y0..=y1 {
            for cx in x0..=x1 {
                let cell = (cy * params.grid_dims[0] + cx) as usize;
                let Some(&[start, count]) = scene.cell_ranges.get(cell) else {
                    continue;
                };
                for k in start..start + count {
                    if let Some(&index) = scene.cell_indices.get(k as usize) {
                        test_entity(index);
                    }
                }
            }
        }
    } else {
        for index in 0..params.entity_count {
            test_entity(index);
        }
    }

    for segment in &scene.segments {
        let t = ray_segment(origin, dir, segment.a, segment.b);
        if t > 0.0 && t < best.distance {
            best = GpuRayHit {
                distance: t,
                hit_type: HIT_OBSTACLE,
                index: segment.obstacle,
                size: segment.radius,
            };
        }
    }
    best
}

fn cell_of(params: &RayParams, p: V2) -> [u32; 2] {
    let clamp = |v: f32, dim: u32| {
        let cell = (v / params.cell_size).floor();
        cell.clamp(0.0, (dim - 1) as f32) as u32
    };
    [clamp(p[0], params.grid_dims[0]), clamp(p[1], params.grid_dims[1])]
}

/// Distance to the first world edge along `dir`, never negative.
pub(crate) fn boundary_distance(world: V2, origin: V2, dir: V2) -> f32 {
    let mut t = f32::MAX;
    for axis in 0..2 {
        if dir[axis] > 1e-6 {
            t = t.min(((world[axis] - origin[axis]) / dir[axis]).max(0.0));
        } else if dir[axis] < -1e-6 {
            t = t.min((-origin[axis] / dir[axis]).max(0.0));
        }
    }
    t
}

/// Nearest forward intersection with a circle, or -1 on a miss.
pub(crate) fn ray_circle(origin: V2, dir: V2, center: V2, radius: f32) -> f32 {
    let oc = [origin[0] - center[0], origin[1] - center[1]];
    let b = oc[0] * dir[0] + oc[1] * dir[1];
    let c = oc[0] * oc[0] + oc[1] * oc[1] - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return -1.0;
    }
    let s = disc.sqrt();
    let t1 = -b - s;
    if t1 > RAY_EPSILON {
        return t1;
    }
    let t2 = -b + s;
    if t2 > RAY_EPSILON {
        return t2;
    }
    -1.0
}

/// Intersection distance with the segment `a..b`, or -1 on a miss.
pub(crate) fn ray_segment(origin: V2, dir: V2, a: V2, b: V2) -> f32 {
    let v1 = [origin[0] - a[0], origin[1] - a[1]];
    let v2 = [b[0] - a[0], b[1] - a[1]];
    let v3 = [-dir[1], dir[0]];
    let denom = v2[0] * v3[0] + v2[1] * v3[1];
    if denom.abs() < 1e-8 {
        return -1.0;
    }
    let t = (v2[0] * v1[1] - v2[1] * v1[0]) / denom;
    let u = (v1[0] * v3[0] + v1[1] * v3[1]) / denom;
    if t > RAY_EPSILON && (0.0..=1.0).contains(&u) {
        t
    } else {
        -1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu_types::{ENTITY_FOOD, HIT_AGENT, HIT_NONE};

    fn params(agent_count: u32, entity_count: u32, segment_count: u32) -> RayParams {
        RayParams {
            world_size: [1000.0, 1000.0],
            agent_count,
            entity_count,
            segment_count,
            max_rays: 1,
            grid_dims: [1, 1],
            cell_size: 1000.0,
            use_grid: 0,
            sensor_arc: std::f32::consts::PI,
            _pad: 0,
        }
    }

    fn agent_at(x: f32, y: f32) -> GpuAgent {
        GpuAgent {
            pos: [x, y],
            angle: 0.0,
            size: 5.0,
            ray_count: 1,
            max_dist: 100.0,
            _pad: [0; 2],
        }
    }

    fn binds(
        params: RayParams,
        agents: &[GpuAgent],
        entities: &[GpuEntity],
        segments: &[GpuSegment],
        ranges: &[[u32; 2]],
        indices: &[u32],
    ) -> Vec<BufferView> {
        let hits = vec![GpuRayHit::miss(0.0); (params.agent_count * params.max_rays) as usize];
        vec![
            BufferView::from_pod(&[params]),
            BufferView::from_pod(agents),
            BufferView::from_pod(entities),
            BufferView::from_pod(segments),
            BufferView::from_pod(ranges),
            BufferView::from_pod(indices),
            BufferView::from_pod(&hits),
        ]
    }

    fn hits_of(out: &[Vec<u8>]) -> Vec<GpuRayHit> {
        bytemuck::pod_collect_to_vec(&out[0])
    }

    #[test]
    fn food_ahead_is_hit_at_surface() {
        let food = GpuEntity {
            pos: [550.0, 500.0],
            size: 10.0,
            kind: ENTITY_FOOD,
            owner: NO_INDEX,
            _pad: 0,
        };
        let out = handle_cast_rays(&binds(
            params(1, 1, 0),
            &[agent_at(500.0, 500.0)],
            &[food],
            &[],
            &[[0, 0]],
            &[0],
        ))
        .unwrap();
        let hit = hits_of(&out)[0];
        assert_eq!(hit.hit_type, HIT_FOOD);
        assert_eq!(hit.index, 0);
        assert!((hit.distance - 40.0).abs() < 1e-3, "got {hit:?}");
        assert_eq!(hit.size, 10.0);
    }

    #[test]
    fn own_body_is_ignored() {
        let own = GpuEntity {
            pos: [500.0, 500.0],
            size: 5.0,
            kind: ENTITY_AGENT,
            owner: 0,
            _pad: 0,
        };
        let other = GpuEntity {
            pos: [560.0, 500.0],
            size: 5.0,
            kind: ENTITY_AGENT,
            owner: 1,
            _pad: 0,
        };
        let out = handle_cast_rays(&binds(
            params(1, 2, 0),
            &[agent_at(500.0, 500.0)],
            &[own, other],
            &[],
            &[[0, 0]],
            &[0],
        ))
        .unwrap();
        let hit = hits_of(&out)[0];
        assert_eq!(hit.hit_type, HIT_AGENT);
        assert_eq!(hit.index, 1);
    }

    #[test]
    fn boundary_and_miss() {
        let out = handle_cast_rays(&binds(
            params(2, 0, 0),
            &[agent_at(960.0, 500.0), agent_at(500.0, 500.0)],
            &[],
            &[],
            &[[0, 0]],
            &[0],
        ))
        .unwrap();
        let hits = hits_of(&out);
        assert_eq!(hits[0].hit_type, HIT_BOUNDARY);
        assert!((hits[0].distance - 40.0).abs() < 1e-3);
        assert_eq!(hits[1].hit_type, HIT_NONE);
        assert_eq!(hits[1].distance, 100.0);
    }

    #[test]
    fn obstacle_segment_blocks_ray() {
        let wall = GpuSegment {
            a: [530.0, 400.0],
            b: [530.0, 600.0],
            obstacle: 7,
            radius: 20.0,
        };
        let out = handle_cast_rays(&binds(
            params(1, 0, 1),
            &[agent_at(500.0, 500.0)],
            &[],
            &[wall],
            &[[0, 0]],
            &[0],
        ))
        .unwrap();
        let hit = hits_of(&out)[0];
        assert_eq!(hit.hit_type, HIT_OBSTACLE);
        assert_eq!(hit.index, 7);
        assert!((hit.distance - 30.0).abs() < 1e-3);
    }

    #[test]
    fn grid_lookup_matches_brute_force() {
        let food = GpuEntity {
            pos: [560.0, 500.0],
            size: 10.0,
            kind: ENTITY_FOOD,
            owner: NO_INDEX,
            _pad: 0,
        };
        let mut p = params(1, 1, 0);
        p.use_grid = 1;
        p.cell_size = 100.0;
        p.grid_dims = [10, 10];
        let mut ranges = vec![[0u32, 0u32]; 100];
        ranges[5 * 10 + 5] = [0, 1];
        let out = handle_cast_rays(&binds(p, &[agent_at(500.0, 500.0)], &[food], &[], &ranges, &[0]))
            .unwrap();
        let hit = hits_of(&out)[0];
        assert_eq!(hit.hit_type, HIT_FOOD);
        assert!((hit.distance - 50.0).abs() < 1e-3);
    }

    #[test]
    fn padded_ray_slots_are_misses() {
        let mut p = params(1, 0, 0);
        p.max_rays = 3;
        let out = handle_cast_rays(&binds(p, &[agent_at(500.0, 500.0)], &[], &[], &[[0, 0]], &[0]))
            .unwrap();
        let hits = hits_of(&out);
        assert_eq!(hits.len(), 3);
        assert!(hits[1..].iter().all(|h| h.hit_type == HIT_NONE));
    }

    #[test]
    fn wrong_binding_count_fails() {
        let result = handle_cast_rays(&[BufferView::from_pod(&[params(0, 0, 0)])]);
        assert!(
            matches!(result, Err(ComputeError::ShapeMismatch(_))),
            "Expected ShapeMismatch error, got {result:?}"
        );
    }

    #[test]
    fn short_agent_buffer_fails() {
        let result = handle_cast_rays(&binds(params(2, 0, 0), &[agent_at(1.0, 1.0)], &[], &[], &[[0, 0]], &[0]));
        assert!(
            matches!(result, Err(ComputeError::ShapeMismatch(_))),
            "Expected ShapeMismatch error, got {result:?}"
        );
    }
}
