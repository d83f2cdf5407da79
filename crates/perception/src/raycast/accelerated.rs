//! Ray casting through the `cast_rays` kernel.
//!
//! Active agents are packed into a dense array and every agent gets
//! `max_rays` output slots, the largest ray count of the tick. Slots past an
//! agent's own ray count come back as misses and are dropped when the results
//! are unpacked.
//!
//! A cast is split into [`AcceleratedRaycaster::submit`], which uploads the
//! scene and queues the kernel together with a copy into the tick's staging
//! buffer, and [`AcceleratedRaycaster::collect`], which awaits that copy.
//! Each staging buffer of the ring is claimed by the [`RayTicket`] that
//! writes it, so a later tick can be submitted while an earlier one is still
//! unread, and a tick that would land on an unread buffer is refused.

use std::mem::size_of;

use compute::gpu_types::{
    GpuAgent, GpuEntity, GpuRayHit, GpuSegment, RayParams, ENTITY_AGENT, ENTITY_FOOD, HIT_NONE,
    NO_INDEX,
};
use compute::{BufferId, BufferUsage, ComputeError, Dispatch, Kernel, Readback, ResourceManager};

use crate::config::CapacityHints;
use crate::inflight::{InflightFlag, InflightGuard};
use crate::raycast::{max_distance, RayScene};
use crate::types::{Agent, EntityKind, HitType, RayResult, RayResults};
use crate::PerceptionError;

const SLOT_PARAMS: &str = "rays.params";
const SLOT_AGENTS: &str = "rays.agents";
const SLOT_ENTITIES: &str = "rays.entities";
const SLOT_SEGMENTS: &str = "rays.segments";
const SLOT_CELL_RANGES: &str = "rays.cell_ranges";
const SLOT_CELL_INDICES: &str = "rays.cell_indices";
const SLOT_HITS: &str = "rays.hits";

/// Stand-in for entities with a non-finite position or size. Zero radius far
/// outside any world, so it is never closer than a real hit.
const PARKED_ENTITY: GpuEntity = GpuEntity {
    pos: [-1.0e6, -1.0e6],
    size: 0.0,
    kind: ENTITY_FOOD,
    owner: NO_INDEX,
    _pad: 0,
};

#[derive(Debug, Clone, Copy)]
struct PackedAgent {
    /// Index into the agent slice.
    index: usize,
    rays: u32,
    max: f32,
    /// Position or heading is unusable; every ray reports a miss.
    parked: bool,
}

/// A submitted cast whose hits are waiting in a staging buffer.
///
/// Holds everything needed to validate and unpack the hits, and keeps the
/// staging buffer claimed until it is collected or dropped.
#[derive(Debug)]
pub struct RayTicket {
    tick: u64,
    epoch: u64,
    /// Staging buffer and byte count, or `None` when no agent casts a ray.
    readback: Option<(BufferId, u64)>,
    max_rays: usize,
    packed: Vec<PackedAgent>,
    entity_kinds: Vec<u32>,
    obstacles: usize,
    _slot: InflightGuard,
}

impl RayTicket {
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }
}

/// Host-side staging for the ray kernel. Vectors are reused across ticks.
#[derive(Debug, Default)]
pub struct AcceleratedRaycaster {
    agents: Vec<GpuAgent>,
    packed: Vec<PackedAgent>,
    /// Packed index of every agent slice entry, or `NO_INDEX` if inactive.
    slot_of: Vec<u32>,
    entities: Vec<GpuEntity>,
    segments: Vec<GpuSegment>,
    /// One claim per staging buffer of the ring.
    ring: Vec<InflightFlag>,
    dispatches: u64,
}

/// Size in bytes of the product of `counts` records of `T`.
fn bytes_for<T>(label: &str, counts: &[usize], limit: u64) -> Result<u64, ComputeError> {
    counts
        .iter()
        .try_fold(size_of::<T>(), |acc, &n| acc.checked_mul(n))
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or_else(|| ComputeError::AllocationOverflow {
            label: label.to_string(),
            requested: u64::MAX,
            limit,
        })
}

impl AcceleratedRaycaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }

    /// Allocates device buffers large enough for `hints` up front. The grid
    /// buffers depend on the world size and are sized on first use.
    ///
    /// # Errors
    ///
    /// `ComputeError::AllocationOverflow` when a hinted size does not fit the
    /// address space or the device, and any backend allocation error.
    pub fn reserve(
        &self,
        rm: &mut ResourceManager,
        hints: &CapacityHints,
        segments_per_obstacle: u32,
    ) -> Result<(), PerceptionError> {
        let limit = rm.backend().max_buffer_size();
        let segments = segments_per_obstacle as usize;
        let sizes = [
            (SLOT_PARAMS, BufferUsage::Uniform, size_of::<RayParams>() as u64),
            (
                SLOT_AGENTS,
                BufferUsage::Storage,
                bytes_for::<GpuAgent>(SLOT_AGENTS, &[hints.max_agents], limit)?,
            ),
            (
                SLOT_ENTITIES,
                BufferUsage::Storage,
                bytes_for::<GpuEntity>(SLOT_ENTITIES, &[hints.max_entities], limit)?,
            ),
            (
                SLOT_SEGMENTS,
                BufferUsage::Storage,
                bytes_for::<GpuSegment>(SLOT_SEGMENTS, &[hints.max_obstacles, segments], limit)?,
            ),
            (
                SLOT_CELL_INDICES,
                BufferUsage::Storage,
                bytes_for::<u32>(SLOT_CELL_INDICES, &[hints.max_entities], limit)?,
            ),
            (
                SLOT_HITS,
                BufferUsage::Storage,
                bytes_for::<GpuRayHit>(
                    SLOT_HITS,
                    &[hints.max_agents, hints.max_rays_per_agent],
                    limit,
                )?,
            ),
        ];
        for (slot, usage, bytes) in sizes {
            rm.ensure(slot, usage, bytes)?;
        }
        Ok(())
    }

    /// Casts every ray of the active agents in `agents` and writes the
    /// validated results into `out`.
    ///
    /// # Errors
    ///
    /// Any error of [`Self::submit`] or [`Self::collect`]. `out` is left in
    /// an unspecified state on error.
    pub async fn cast(
        &mut self,
        rm: &mut ResourceManager,
        scene: &RayScene<'_>,
        agents: &[Agent],
        tick: u64,
        out: &mut RayResults,
    ) -> Result<(), PerceptionError> {
        let ticket = self.submit(rm, scene, agents, tick)?;
        self.collect(rm, ticket, out).await
    }

    /// Uploads the scene and queues the kernel, copying the hits into the
    /// staging buffer of `tick`.
    ///
    /// # Errors
    ///
    /// `ComputeError::Busy` while the ticket of an earlier tick that shares
    /// the staging buffer is still outstanding, and any backend error.
    pub fn submit(
        &mut self,
        rm: &mut ResourceManager,
        scene: &RayScene<'_>,
        agents: &[Agent],
        tick: u64,
    ) -> Result<RayTicket, PerceptionError> {
        if self.ring.len() < rm.ring_depth() {
            self.ring.resize_with(rm.ring_depth(), InflightFlag::default);
        }
        let Some(claim) = self.ring[rm.ring_index(tick)].try_acquire() else {
            return Err(ComputeError::Busy.into());
        };

        self.pack(scene, agents);
        let max_rays = self.agents.iter().map(|a| a.ray_count).max().unwrap_or(0);
        let mut ticket = RayTicket {
            tick,
            epoch: rm.backend().epoch(),
            readback: None,
            max_rays: max_rays as usize,
            packed: self.packed.clone(),
            entity_kinds: self.entities.iter().map(|e| e.kind).collect(),
            obstacles: scene.obstacle_count(),
            _slot: claim,
        };
        if max_rays == 0 {
            return Ok(ticket);
        }

        let limit = rm.backend().max_buffer_size();
        let total_slots = self.agents.len() * max_rays as usize;
        let hits_bytes = bytes_for::<GpuRayHit>(SLOT_HITS, &[total_slots], limit)?;
        let empty_grid = ([[0u32; 2]], [0u32]);
        let (use_grid, grid_dims, cell_size, ranges, indices) = match scene.index {
            Some(index) => (1, index.dims(), index.cell_size(), index.ranges(), index.indices()),
            None => (0, [1, 1], 1.0, &empty_grid.0[..], &empty_grid.1[..]),
        };
        let params = RayParams {
            world_size: [scene.bounds.width, scene.bounds.height],
            agent_count: self.agents.len() as u32,
            entity_count: self.entities.len() as u32,
            segment_count: self.segments.len() as u32,
            max_rays,
            grid_dims,
            cell_size,
            use_grid,
            sensor_arc: scene.sensor_arc,
            _pad: 0,
        };

        rm.sync_epoch();
        ticket.epoch = rm.backend().epoch();
        let pipeline = rm.pipeline(Kernel::CastRays)?;
        let bindings = [
            rm.upload(SLOT_PARAMS, BufferUsage::Uniform, bytemuck::bytes_of(&params))?.id,
            rm.upload(SLOT_AGENTS, BufferUsage::Storage, bytemuck::cast_slice(&self.agents))?.id,
            rm.upload(SLOT_ENTITIES, BufferUsage::Storage, bytemuck::cast_slice(&self.entities))?.id,
            rm.upload(SLOT_SEGMENTS, BufferUsage::Storage, bytemuck::cast_slice(&self.segments))?.id,
            rm.upload(SLOT_CELL_RANGES, BufferUsage::Storage, bytemuck::cast_slice(ranges))?.id,
            rm.upload(SLOT_CELL_INDICES, BufferUsage::Storage, bytemuck::cast_slice(indices))?.id,
            rm.ensure(SLOT_HITS, BufferUsage::Storage, hits_bytes)?.id,
        ];
        let staging_slot = rm.staging_slot("rays", tick);
        let staging = rm.ensure(&staging_slot, BufferUsage::Staging, hits_bytes)?.id;

        rm.backend().dispatch(&Dispatch {
            pipeline: pipeline.id,
            bindings: &bindings,
            workgroups: pipeline.workgroups_for(total_slots as u32),
            readback: Some(Readback {
                source: bindings[bindings.len() - 1],
                staging,
                size: hits_bytes,
            }),
        })?;
        self.dispatches += 1;
        ticket.readback = Some((staging, hits_bytes));
        Ok(ticket)
    }

    /// Waits for the hits of `ticket` and writes the validated results into
    /// `out`. The staging buffer is released for reuse once this returns.
    ///
    /// # Errors
    ///
    /// `ComputeError::DeviceLost` when the device was re-created after the
    /// submission, any backend error, or `PerceptionError::ResultCorruption`
    /// when the device returned a result that cannot be correct.
    pub async fn collect(
        &self,
        rm: &ResourceManager,
        ticket: RayTicket,
        out: &mut RayResults,
    ) -> Result<(), PerceptionError> {
        out.clear();
        let Some((staging, hits_bytes)) = ticket.readback else {
            for agent in &ticket.packed {
                out.push_agent(agent.index, (0..agent.rays).map(|_| RayResult::miss(agent.max)));
            }
            return Ok(());
        };
        let backend = rm.backend();
        if backend.epoch() != ticket.epoch {
            return Err(ComputeError::DeviceLost.into());
        }

        let bytes = backend.read_buffer(staging, hits_bytes).await?;
        let raw = bytes.get(..hits_bytes as usize).ok_or_else(|| {
            PerceptionError::ResultCorruption(format!(
                "readback returned {} of {hits_bytes} bytes",
                bytes.len()
            ))
        })?;
        let hits: Vec<GpuRayHit> = bytemuck::pod_collect_to_vec(raw);
        unpack(&ticket, &hits, out)
    }

    fn pack(&mut self, scene: &RayScene<'_>, agents: &[Agent]) {
        self.agents.clear();
        self.packed.clear();
        self.slot_of.clear();
        self.slot_of.resize(agents.len(), NO_INDEX);
        for (index, agent) in agents.iter().enumerate() {
            if !agent.is_active() {
                continue;
            }
            let parked = !agent.position.is_finite() || !agent.angle.is_finite();
            let max = max_distance(agent);
            self.slot_of[index] = self.agents.len() as u32;
            self.packed.push(PackedAgent {
                index,
                rays: agent.ray_count,
                max,
                parked,
            });
            self.agents.push(GpuAgent {
                pos: if parked { [0.0; 2] } else { agent.position.to_array() },
                angle: if parked { 0.0 } else { agent.angle },
                size: agent.size,
                ray_count: if parked { 0 } else { agent.ray_count },
                max_dist: max,
                _pad: [0; 2],
            });
        }

        self.entities.clear();
        self.entities.extend(scene.entities.iter().map(|entity| {
            if !entity.position.is_finite() || !entity.size.is_finite() {
                return PARKED_ENTITY;
            }
            let (kind, owner) = match entity.kind {
                EntityKind::Food => (ENTITY_FOOD, NO_INDEX),
                EntityKind::Agent { owner } => (
                    ENTITY_AGENT,
                    self.slot_of.get(owner).copied().unwrap_or(NO_INDEX),
                ),
            };
            GpuEntity {
                pos: entity.position.to_array(),
                size: entity.size,
                kind,
                owner,
                _pad: 0,
            }
        }));

        self.segments.clear();
        self.segments.extend(scene.segments.iter().map(|s| GpuSegment {
            a: s.a.to_array(),
            b: s.b.to_array(),
            obstacle: s.obstacle as u32,
            radius: s.radius,
        }));
    }
}

fn unpack(ticket: &RayTicket, hits: &[GpuRayHit], out: &mut RayResults) -> Result<(), PerceptionError> {
    for (slot, agent) in ticket.packed.iter().enumerate() {
        if agent.parked {
            out.push_agent(agent.index, (0..agent.rays).map(|_| RayResult::miss(agent.max)));
            continue;
        }
        let base = slot * ticket.max_rays;
        let rays = hits
            .get(base..base + agent.rays as usize)
            .ok_or_else(|| PerceptionError::ResultCorruption("hit grid too short".to_string()))?;
        let mut converted = Vec::with_capacity(rays.len());
        for hit in rays {
            converted.push(convert(ticket, hit, agent.max)?);
        }
        out.push_agent(agent.index, converted);
    }
    Ok(())
}

fn convert(ticket: &RayTicket, hit: &GpuRayHit, max: f32) -> Result<RayResult, PerceptionError> {
    let corrupt = |why: &str| {
        Err(PerceptionError::ResultCorruption(format!("{why}: {hit:?}")))
    };
    if !hit.distance.is_finite() || hit.distance < 0.0 || hit.distance > max {
        return corrupt("distance outside [0, max]");
    }
    let Some(hit_type) = HitType::from_code(hit.hit_type) else {
        return corrupt("unknown hit type");
    };
    if (hit.hit_type == HIT_NONE) != (hit.distance == max) {
        return corrupt("miss flag disagrees with distance");
    }
    let hit_index = match hit_type {
        HitType::None | HitType::Boundary => {
            if hit.index != NO_INDEX {
                return corrupt("index on a non-entity hit");
            }
            None
        }
        HitType::Food | HitType::Agent => {
            let expected = if hit_type == HitType::Food { ENTITY_FOOD } else { ENTITY_AGENT };
            match ticket.entity_kinds.get(hit.index as usize) {
                Some(&kind) if kind == expected => Some(hit.index as usize),
                _ => return corrupt("entity index out of range"),
            }
        }
        HitType::Obstacle => {
            if hit.index as usize >= ticket.obstacles {
                return corrupt("obstacle index out of range");
            }
            Some(hit.index as usize)
        }
    };
    Ok(RayResult {
        distance: hit.distance,
        hit_type,
        hit_index,
        hit_size: hit.size,
    })
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::raycast::{build_segments, cast_rays_cpu, ObstacleSegment};
    use crate::spatial::SpatialIndex;
    use crate::types::{ArchitectureKey, Brain, Entity, Obstacle, Vec2, WorldBounds};
    use compute::{ComputeBackend, MockCpu};
    use std::sync::Arc;

    const WORLD: WorldBounds = WorldBounds::new(800.0, 600.0);

    fn manager() -> (Arc<MockCpu>, ResourceManager) {
        let cpu = Arc::new(MockCpu::new());
        let rm = ResourceManager::new(cpu.clone(), 1.5, 2);
        (cpu, rm)
    }

    fn agent(x: f32, y: f32, angle: f32, rays: u32) -> Agent {
        let mut agent = Agent::new(0, Vec2::new(x, y), Brain::zeroed(ArchitectureKey::new(1, 1, 1)));
        agent.angle = angle;
        agent.ray_count = rays;
        agent
    }

    fn scene<'a>(
        entities: &'a [Entity],
        segments: &'a [ObstacleSegment],
        index: Option<&'a SpatialIndex>,
    ) -> RayScene<'a> {
        RayScene {
            bounds: WORLD,
            entities,
            segments,
            index,
            sensor_arc: std::f32::consts::PI,
        }
    }

    fn assert_same(cpu: &RayResults, gpu: &RayResults) {
        assert_eq!(cpu.spans(), gpu.spans());
        for (a, b) in cpu.all().iter().zip(gpu.all()) {
            assert_eq!(a.hit_type, b.hit_type, "cpu {a:?} vs accelerated {b:?}");
            assert_eq!(a.hit_index, b.hit_index, "cpu {a:?} vs accelerated {b:?}");
            assert!((a.distance - b.distance).abs() < 1e-3, "cpu {a:?} vs accelerated {b:?}");
        }
    }

    #[test]
    fn matches_cpu_caster_with_mixed_ray_counts() {
        let (_, mut rm) = manager();
        let entities = [
            Entity::food(Vec2::new(300.0, 300.0), 8.0),
            Entity::agent(0, Vec2::new(100.0, 100.0), 10.0),
            Entity::agent(2, Vec2::new(400.0, 320.0), 10.0),
        ];
        let mut segments = Vec::new();
        build_segments(
            &[Obstacle {
                center: Vec2::new(200.0, 300.0),
                radius: 30.0,
            }],
            8,
            &mut segments,
        );
        let mut dead = agent(50.0, 50.0, 0.0, 4);
        dead.energy = 0.0;
        let agents = [
            agent(100.0, 100.0, 0.8, 5),
            dead,
            agent(400.0, 320.0, std::f32::consts::PI, 9),
            agent(10.0, 590.0, 0.0, 0),
        ];
        let mut index = SpatialIndex::new(WORLD, 64.0).unwrap();
        index.rebuild(WORLD, &entities);

        for grid in [None, Some(&index)] {
            let scene = scene(&entities, &segments, grid);
            let mut expected = RayResults::default();
            cast_rays_cpu(&scene, &agents, &mut expected);
            let mut caster = AcceleratedRaycaster::new();
            let mut actual = RayResults::default();
            pollster::block_on(caster.cast(&mut rm, &scene, &agents, 0, &mut actual)).unwrap();
            assert_eq!(actual.len(), 14);
            assert_same(&expected, &actual);
        }
    }

    #[test]
    fn corrupted_readback_is_rejected() {
        let (cpu, mut rm) = manager();
        cpu.inject(|plan| plan.corrupt_reads = 1);
        let agents = [agent(100.0, 100.0, 0.0, 4)];
        let mut out = RayResults::default();
        let result = pollster::block_on(AcceleratedRaycaster::new().cast(
            &mut rm,
            &scene(&[], &[], None),
            &agents,
            0,
            &mut out,
        ));
        assert!(
            matches!(result, Err(PerceptionError::ResultCorruption(_))),
            "Expected ResultCorruption error, got {result:?}"
        );
    }

    #[test]
    fn staging_rotates_between_ticks() {
        let (_, mut rm) = manager();
        let agents = [agent(100.0, 100.0, 0.0, 4)];
        let mut caster = AcceleratedRaycaster::new();
        let mut out = RayResults::default();
        for tick in 0..3 {
            pollster::block_on(caster.cast(&mut rm, &scene(&[], &[], None), &agents, tick, &mut out))
                .unwrap();
        }
        assert!(rm.buffer("rays.staging.0").is_some());
        assert!(rm.buffer("rays.staging.1").is_some());
        assert!(rm.buffer("rays.staging.2").is_none());
        assert_eq!(caster.dispatches(), 3);
    }

    #[test]
    fn reserve_presizes_buffers() {
        let (_, mut rm) = manager();
        let hints = CapacityHints {
            max_agents: 100,
            max_rays_per_agent: 10,
            max_entities: 50,
            max_obstacles: 2,
        };
        AcceleratedRaycaster::new().reserve(&mut rm, &hints, 8).unwrap();
        assert!(rm.capacity(SLOT_HITS).unwrap() >= 100 * 10 * 16);
        assert!(rm.capacity(SLOT_CELL_RANGES).is_none());
        let before = rm.stats().allocations;

        let agents: Vec<Agent> = (0..100).map(|i| agent(5.0 * i as f32, 300.0, 0.0, 10)).collect();
        let mut out = RayResults::default();
        pollster::block_on(AcceleratedRaycaster::new().cast(
            &mut rm,
            &scene(&[], &[], None),
            &agents,
            0,
            &mut out,
        ))
        .unwrap();
        assert_eq!(rm.stats().reallocations, 0);
        // the grid ranges and the staging buffer are new
        assert_eq!(rm.stats().allocations, before + 2);
    }

    #[test]
    fn overflowing_capacity_hints_are_rejected() {
        let (cpu, mut rm) = manager();
        let hints = CapacityHints {
            max_agents: usize::MAX / 2,
            max_rays_per_agent: 16,
            max_entities: 8,
            max_obstacles: 1,
        };
        let result = AcceleratedRaycaster::new().reserve(&mut rm, &hints, 8);
        assert!(
            matches!(
                result,
                Err(PerceptionError::Compute(ComputeError::AllocationOverflow { .. }))
            ),
            "Expected AllocationOverflow error, got {result:?}"
        );
        assert_eq!(cpu.stats().buffers_created, 0);
    }

    #[test]
    fn next_tick_is_submitted_while_the_previous_one_is_unread() {
        let (cpu, mut rm) = manager();
        cpu.inject(|plan| plan.read_delay_polls = 3);
        let food = [Entity::food(Vec2::new(300.0, 100.0), 8.0)];
        let scene = scene(&food, &[], None);
        let facing_food = [agent(100.0, 100.0, 0.0, 3)];
        let facing_wall = [agent(100.0, 100.0, std::f32::consts::PI, 5)];
        let mut caster = AcceleratedRaycaster::new();

        let first = caster.submit(&mut rm, &scene, &facing_food, 0).unwrap();
        let second = caster.submit(&mut rm, &scene, &facing_wall, 1).unwrap();
        assert_eq!((first.tick(), second.tick()), (0, 1));
        // tick 2 shares the first staging buffer, which is still unread
        let blocked = caster.submit(&mut rm, &scene, &facing_food, 2);
        assert!(
            matches!(blocked, Err(PerceptionError::Compute(ComputeError::Busy))),
            "Expected Busy error, got {blocked:?}"
        );
        assert_eq!(caster.dispatches(), 2);

        let mut expected = RayResults::default();
        let mut actual = RayResults::default();
        cast_rays_cpu(&scene, &facing_food, &mut expected);
        pollster::block_on(caster.collect(&rm, first, &mut actual)).unwrap();
        assert_same(&expected, &actual);
        assert_eq!(actual.all()[1].hit_type, HitType::Food);

        cast_rays_cpu(&scene, &facing_wall, &mut expected);
        pollster::block_on(caster.collect(&rm, second, &mut actual)).unwrap();
        assert_same(&expected, &actual);
        assert_eq!(actual.all()[2].hit_type, HitType::Boundary);

        assert!(caster.submit(&mut rm, &scene, &facing_food, 2).is_ok());
    }

    #[test]
    fn ticket_from_before_a_device_loss_is_refused() {
        let (cpu, mut rm) = manager();
        let agents = [agent(100.0, 100.0, 0.0, 4)];
        let mut caster = AcceleratedRaycaster::new();
        let ticket = caster.submit(&mut rm, &scene(&[], &[], None), &agents, 0).unwrap();
        cpu.lose_device();
        cpu.recover().unwrap();
        let mut out = RayResults::default();
        let result = pollster::block_on(caster.collect(&rm, ticket, &mut out));
        assert!(
            matches!(result, Err(PerceptionError::Compute(ComputeError::DeviceLost))),
            "Expected DeviceLost error, got {result:?}"
        );
    }
}
