//! Sequential ray caster. Also the reference the accelerated results are
//! checked against in tests.

use crate::raycast::geometry::{boundary_distance, ray_angle, ray_circle, ray_segment};
use crate::raycast::{max_distance, RayScene};
use crate::types::{Agent, EntityKind, HitType, RayResult, RayResults, Vec2};

/// Sequential ray caster. Writes one result per ray of every active agent.
pub fn cast_rays_cpu(scene: &RayScene<'_>, agents: &[Agent], out: &mut RayResults) {
    out.clear();
    for (agent_index, agent) in agents.iter().enumerate() {
        if !agent.is_active() {
            continue;
        }
        let max = max_distance(agent);
        if !agent.position.is_finite() || !agent.angle.is_finite() {
            out.push_agent(agent_index, (0..agent.ray_count).map(|_| RayResult::miss(max)));
            continue;
        }
        out.push_agent(
            agent_index,
            (0..agent.ray_count).map(|ray| trace(scene, agent_index, agent, ray, max)),
        );
    }
}

fn trace(scene: &RayScene<'_>, agent_index: usize, agent: &Agent, ray: u32, max: f32) -> RayResult {
    let theta = ray_angle(agent.angle, ray, agent.ray_count, scene.sensor_arc);
    let dir = Vec2::from_angle(theta);
    let origin = agent.position;
    let mut best = RayResult::miss(max);

    let tb = boundary_distance(scene.bounds, origin, dir);
    if tb < best.distance {
        best = RayResult {
            distance: tb,
            hit_type: HitType::Boundary,
            hit_index: None,
            hit_size: 0.0,
        };
    }

    let mut test_entity = |index: usize| {
        let Some(entity) = scene.entities.get(index) else {
            return;
        };
        let hit_type = match entity.kind {
            EntityKind::Agent { owner } if owner == agent_index => return,
            EntityKind::Agent { .. } => HitType::Agent,
            EntityKind::Food => HitType::Food,
        };
        if let Some(t) = ray_circle(origin, dir, entity.position, entity.size) {
            if t < best.distance {
                best = RayResult {
                    distance: t,
                    hit_type,
                    hit_index: Some(index),
                    hit_size: entity.size,
                };
            }
        }
    };

    match scene.index {
        Some(index) => {
            let rect = index.cells_for_segment(origin, origin + dir * max);
            for candidate in index.candidates(rect) {
                test_entity(candidate as usize);
            }
        }
        None => (0..scene.entities.len()).for_each(&mut test_entity),
    }

    for segment in scene.segments {
        if let Some(t) = ray_segment(origin, dir, segment.a, segment.b) {
            if t < best.distance {
                best = RayResult {
                    distance: t,
                    hit_type: HitType::Obstacle,
                    hit_index: Some(segment.obstacle),
                    hit_size: segment.radius,
                };
            }
        }
    }
    best
}
