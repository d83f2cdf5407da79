//! The per-tick entry point: rays, sensory inputs, inference.
//!
//! Each accelerated stage is guarded by its own [`FallbackOrchestrator`].
//! Accelerator errors never leave this module; they are logged, counted and
//! answered by running the CPU implementation for that tick.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use compute::{ComputeBackend, ComputeError, ResourceManager, ResourceStats};

use crate::config::EngineConfig;
use crate::fallback::{FallbackOrchestrator, FallbackStats, OrchestratorState};
use crate::inference::{run_group_cpu, AcceleratedInference, AcceleratedRun};
use crate::inflight::InflightFlag;
use crate::raycast::{build_segments, cast_rays_cpu, AcceleratedRaycaster, ObstacleSegment, RayScene};
use crate::spatial::{SpatialIndex, SpatialIndexStats};
use crate::types::{Agent, ArchitectureKey, Entity, Obstacle, RayResult, RayResults, WorldBounds};
use crate::weight_cache::{WeightCache, WeightCacheStats};
use crate::PerceptionError;

/// Turns an agent's ray hits into its network inputs. Implemented by the
/// host simulation.
pub trait SensoryAdapter {
    /// Fills `inputs` (cleared beforehand) for the active agent at
    /// `agent_index`. `rays` is empty for agents that cast no rays.
    fn fill_inputs(&self, agent_index: usize, agent: &Agent, rays: &[RayResult], inputs: &mut Vec<f32>);
}

/// How a stage was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPath {
    Accelerated,
    /// The accelerated path was not attempted.
    Cpu,
    /// The accelerated path was attempted, failed, and the CPU took over.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceReport {
    pub path: ExecutionPath,
    pub accelerated_agents: usize,
    pub cpu_agents: usize,
    pub groups: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub rays: ExecutionPath,
    pub ray_count: usize,
    pub inference: InferenceReport,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub buffers_trimmed: usize,
    pub cache_entries_dropped: usize,
    pub pipelines_refreshed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    pub backend: Option<&'static str>,
    pub ticks: u64,
    pub ray_state: OrchestratorState,
    pub inference_state: OrchestratorState,
    pub ray_fallback: FallbackStats,
    pub inference_fallback: FallbackStats,
    pub ray_dispatches: u64,
    pub inference_dispatches: u64,
    pub weight_uploads: u64,
    pub weight_cache: WeightCacheStats,
    pub spatial: SpatialIndexStats,
    pub resources: Option<ResourceStats>,
}

#[derive(Clone, Copy)]
enum Stage {
    Rays,
    Inference,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Stage::Rays => "rays",
            Stage::Inference => "inference",
        }
    }
}

/// Re-acquires the device if it went away since the last call.
fn ensure_device(rm: &ResourceManager) -> Result<(), ComputeError> {
    let backend = rm.backend();
    if backend.is_available() {
        return Ok(());
    }
    backend.recover()?;
    if backend.is_available() {
        Ok(())
    } else {
        Err(ComputeError::BackendUnavailable)
    }
}

fn device_healthy(rm: Option<&ResourceManager>) -> bool {
    rm.is_some_and(|rm| ensure_device(rm).is_ok())
}

/// Bookkeeping for a failed accelerated call. Returns `true` when the call
/// counts as a fallback and `false` when it was merely skipped.
fn note_failure(
    stage: Stage,
    err: &PerceptionError,
    orchestrator: &mut FallbackOrchestrator,
    rm: &mut ResourceManager,
) -> bool {
    if matches!(err, PerceptionError::Compute(ComputeError::Busy)) {
        tracing::debug!(stage = stage.label(), "accelerated call already in flight, using CPU");
        return false;
    }
    tracing::warn!(stage = stage.label(), %err, "accelerated call failed, using CPU");
    orchestrator.record_failure(Instant::now());
    if err.is_permanent() {
        orchestrator.disable();
    }
    // a dead device is handled by the epoch check once it has been recovered
    if err.invalidates_resources() && rm.backend().is_available() {
        rm.invalidate();
    }
    true
}

pub struct PerceptionEngine {
    config: EngineConfig,
    resources: Option<ResourceManager>,
    index: SpatialIndex,
    segments: Vec<ObstacleSegment>,
    results: RayResults,
    raycaster: AcceleratedRaycaster,
    inference: AcceleratedInference,
    weight_cache: WeightCache,
    groups: BTreeMap<ArchitectureKey, Vec<usize>>,
    scratch: Vec<f32>,
    seen: HashSet<u64>,
    ray_orchestrator: FallbackOrchestrator,
    inference_orchestrator: FallbackOrchestrator,
    ray_calls: u64,
    inference_calls: u64,
    ticks: u64,
    last_refresh_hours: f64,
}

impl PerceptionEngine {
    /// Builds an engine on `backend`, or a CPU-only engine for `None`.
    ///
    /// # Errors
    ///
    /// `PerceptionError::InvalidConfig` when `config` fails validation.
    pub fn new(
        config: EngineConfig,
        backend: Option<Arc<dyn ComputeBackend>>,
    ) -> Result<Self, PerceptionError> {
        config.validate()?;
        let index = SpatialIndex::new(WorldBounds::new(config.cell_size, config.cell_size), config.cell_size)?;
        let threshold = config.failure_threshold;
        let cooldown = config.cooldown();
        let available = backend.as_ref().is_some_and(|b| b.is_available());
        let (ray_orchestrator, inference_orchestrator) = if available {
            (
                FallbackOrchestrator::new("rays", threshold, cooldown),
                FallbackOrchestrator::new("inference", threshold, cooldown),
            )
        } else {
            (
                FallbackOrchestrator::disabled("rays", threshold, cooldown),
                FallbackOrchestrator::disabled("inference", threshold, cooldown),
            )
        };

        let raycaster = AcceleratedRaycaster::new();
        let resources = backend.map(|backend| {
            tracing::info!(backend = backend.name(), available, "accelerator backend attached");
            let mut rm = ResourceManager::new(backend, config.growth_factor, config.staging_ring_depth);
            if available {
                if let Err(err) =
                    raycaster.reserve(&mut rm, &config.capacity, config.obstacle_segments)
                {
                    tracing::warn!(%err, "could not pre-size device buffers");
                }
            }
            rm
        });
        if resources.is_none() {
            tracing::info!("perception engine running on the CPU only");
        }

        Ok(Self {
            weight_cache: WeightCache::new(config.weight_check),
            config,
            resources,
            index,
            segments: Vec::new(),
            results: RayResults::default(),
            raycaster,
            inference: AcceleratedInference::new(),
            groups: BTreeMap::new(),
            scratch: Vec::new(),
            seen: HashSet::new(),
            ray_orchestrator,
            inference_orchestrator,
            ray_calls: 0,
            inference_calls: 0,
            ticks: 0,
            last_refresh_hours: 0.0,
        })
    }

    /// Builds an engine on [`compute::default_backend`].
    pub fn with_default_backend(config: EngineConfig) -> Result<Self, PerceptionError> {
        let backend = compute::default_backend(config.device_timeout());
        Self::new(config, backend)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Casts the rays of every active agent. Results are available from
    /// [`Self::ray_results`] until the next call.
    pub async fn cast_rays(
        &mut self,
        agents: &[Agent],
        entities: &[Entity],
        obstacles: &[Obstacle],
        bounds: WorldBounds,
    ) -> ExecutionPath {
        self.ray_calls += 1;
        build_segments(obstacles, self.config.obstacle_segments, &mut self.segments);
        if self.config.use_spatial_index {
            self.index.rebuild(bounds, entities);
        }
        let scene = RayScene {
            bounds,
            entities,
            segments: &self.segments,
            index: self.config.use_spatial_index.then_some(&self.index),
            sensor_arc: self.config.sensor_arc,
        };

        let active = agents.iter().filter(|a| a.is_active()).count();
        let wanted = active > 0 && active >= self.config.min_accelerated_agents;
        let attempt = wanted
            && self
                .ray_orchestrator
                .should_attempt(Instant::now(), || device_healthy(self.resources.as_ref()));

        let mut path = ExecutionPath::Cpu;
        if let (true, Some(rm)) = (attempt, self.resources.as_mut()) {
            let result = match ensure_device(rm) {
                Ok(()) => {
                    self.raycaster
                        .cast(rm, &scene, agents, self.ray_calls, &mut self.results)
                        .await
                }
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => {
                    self.ray_orchestrator.record_success();
                    return ExecutionPath::Accelerated;
                }
                Err(err) => {
                    if note_failure(Stage::Rays, &err, &mut self.ray_orchestrator, rm) {
                        path = ExecutionPath::Fallback;
                    }
                }
            }
        }
        cast_rays_cpu(&scene, agents, &mut self.results);
        path
    }

    #[must_use]
    pub fn ray_results(&self) -> &RayResults {
        &self.results
    }

    /// Runs every valid agent's network and stores the new hidden state and
    /// outputs on the agent.
    pub async fn run_inference(&mut self, agents: &mut [Agent]) -> InferenceReport {
        self.inference_calls += 1;
        crate::inference::group_agents(agents, &mut self.groups);
        for members in self.groups.values() {
            self.seen.extend(members.iter().map(|&i| agents[i].id));
        }
        let total: usize = self.groups.values().map(Vec::len).sum();
        let mut report = InferenceReport {
            path: ExecutionPath::Cpu,
            accelerated_agents: 0,
            cpu_agents: 0,
            groups: self.groups.len(),
        };

        let eligible = self.resources.is_some()
            && !AcceleratedInference::eligible(&self.groups, self.config.min_accelerated_group).is_empty();
        let attempt = eligible
            && self
                .inference_orchestrator
                .should_attempt(Instant::now(), || device_healthy(self.resources.as_ref()));

        let mut run = AcceleratedRun::default();
        if let (true, Some(rm)) = (attempt, self.resources.as_mut()) {
            let result = match ensure_device(rm) {
                Ok(()) => {
                    self.inference
                        .run(
                            rm,
                            &mut self.weight_cache,
                            agents,
                            &self.groups,
                            self.config.min_accelerated_group,
                            self.inference_calls,
                        )
                        .await
                }
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(accelerated) => {
                    self.inference_orchestrator.record_success();
                    report.path = ExecutionPath::Accelerated;
                    run = accelerated;
                }
                Err(err) => {
                    if note_failure(Stage::Inference, &err, &mut self.inference_orchestrator, rm) {
                        report.path = ExecutionPath::Fallback;
                    }
                    if err.invalidates_resources() {
                        self.inference.forget_residency();
                    }
                }
            }
        }

        for (key, members) in &self.groups {
            if !run.handled(key) {
                run_group_cpu(agents, members, &mut self.scratch);
            }
        }
        report.accelerated_agents = run.agents;
        report.cpu_agents = total - run.agents;
        report
    }

    /// One full step: rays, sensory inputs through `adapter`, inference.
    pub async fn tick<A: SensoryAdapter + ?Sized>(
        &mut self,
        agents: &mut [Agent],
        entities: &[Entity],
        obstacles: &[Obstacle],
        bounds: WorldBounds,
        adapter: &A,
    ) -> TickReport {
        let started = Instant::now();
        self.ticks += 1;
        let rays = self.cast_rays(agents, entities, obstacles, bounds).await;

        for (index, agent) in agents.iter_mut().enumerate() {
            if !agent.is_active() {
                continue;
            }
            let hits = self.results.for_agent(index).unwrap_or(&[]);
            let mut inputs = std::mem::take(&mut agent.inputs);
            inputs.clear();
            adapter.fill_inputs(index, agent, hits, &mut inputs);
            agent.inputs = inputs;
        }

        let inference = self.run_inference(agents).await;
        let report = TickReport {
            tick: self.ticks,
            rays,
            ray_count: self.results.len(),
            inference,
            duration: started.elapsed(),
        };
        tracing::debug!(
            tick = report.tick,
            rays = ?report.rays,
            inference = ?report.inference.path,
            ray_count = report.ray_count,
            elapsed_us = report.duration.as_micros() as u64,
            "tick complete"
        );
        report
    }

    /// Whether an accelerator is present, alive and not switched off for the
    /// session.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let enabled = self.ray_orchestrator.state() != OrchestratorState::Disabled
            || self.inference_orchestrator.state() != OrchestratorState::Disabled;
        enabled
            && self
                .resources
                .as_ref()
                .is_some_and(|rm| rm.backend().is_available())
    }

    /// Drops every device resource and the weight cache. Everything is
    /// rebuilt on the next accelerated call.
    pub fn clear_cache(&mut self) {
        if let Some(rm) = self.resources.as_mut() {
            rm.release_all();
        }
        self.inference.forget_residency();
        self.weight_cache.clear();
        tracing::info!("perception caches cleared");
    }

    /// Periodic maintenance for long sessions: releases oversized buffers,
    /// forgets agents not seen since the previous cleanup, returns spare host
    /// memory, and rebuilds pipelines every `pipeline_refresh_hours`.
    pub fn deep_cleanup(&mut self, session_hours: f64) -> CleanupReport {
        let mut report = CleanupReport::default();
        if let Some(rm) = self.resources.as_mut() {
            report.buffers_trimmed = rm.trim();
            if session_hours - self.last_refresh_hours >= self.config.pipeline_refresh_hours {
                rm.refresh_pipelines();
                self.last_refresh_hours = session_hours;
                report.pipelines_refreshed = true;
            }
        }
        report.cache_entries_dropped = self.weight_cache.retain(&self.seen);
        self.seen.clear();
        self.results.shrink_to_fit();
        self.index.shrink_to_fit();
        self.segments.shrink_to_fit();
        self.scratch.shrink_to_fit();
        tracing::info!(
            session_hours,
            trimmed = report.buffers_trimmed,
            dropped = report.cache_entries_dropped,
            refreshed = report.pipelines_refreshed,
            "deep cleanup"
        );
        report
    }

    #[must_use]
    pub fn ray_state(&self) -> OrchestratorState {
        self.ray_orchestrator.state()
    }

    #[must_use]
    pub fn inference_state(&self) -> OrchestratorState {
        self.inference_orchestrator.state()
    }

    /// Handle on the flag that serializes accelerated inference.
    #[must_use]
    pub fn inflight_flag(&self) -> InflightFlag {
        self.inference.inflight_flag()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            backend: self.resources.as_ref().map(|rm| rm.backend().name()),
            ticks: self.ticks,
            ray_state: self.ray_orchestrator.state(),
            inference_state: self.inference_orchestrator.state(),
            ray_fallback: self.ray_orchestrator.stats(),
            inference_fallback: self.inference_orchestrator.stats(),
            ray_dispatches: self.raycaster.dispatches(),
            inference_dispatches: self.inference.dispatches(),
            weight_uploads: self.inference.weight_uploads(),
            weight_cache: self.weight_cache.stats(),
            spatial: self.index.stats(),
            resources: self.resources.as_ref().map(ResourceManager::stats),
        }
    }
}
