#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
//! # Perception
//!
//! Per-tick sensing and decision making for the agents of an artificial-life
//! world.
//!
//! Every tick the [`PerceptionEngine`] casts sensor rays from each active
//! agent against food, other agents, obstacles and the world edge, hands the
//! hits to a host-provided [`SensoryAdapter`] that turns them into network
//! inputs, and then runs each agent's small recurrent network to produce its
//! action vector and next hidden state.
//!
//! ## Key Components
//!
//! -   **Spatial index:** [`SpatialIndex`] buckets entities into a uniform
//!     grid so rays only test nearby bodies.
//! -   **Ray casting:** [`raycast`] holds the sequential caster and the
//!     accelerated one that runs the `cast_rays` kernel through a
//!     [`compute::ComputeBackend`].
//! -   **Inference:** [`inference`] groups agents by network shape and runs
//!     the two-layer forward pass either on the CPU or as one batched kernel
//!     per group, re-uploading weights only when [`WeightCache`] reports a
//!     change.
//! -   **Fallback:** a [`FallbackOrchestrator`] per accelerated path counts
//!     failures and switches to the CPU for a cooldown period when the
//!     accelerator misbehaves.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use perception::{EngineConfig, PerceptionEngine};
//!
//! let mut engine = PerceptionEngine::with_default_backend(EngineConfig::default())?;
//! let report = pollster::block_on(engine.tick(&mut agents, &entities, &obstacles, bounds, &adapter));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod inference;
pub mod inflight;
pub mod raycast;
pub mod spatial;
pub mod types;
pub mod weight_cache;

pub use config::{CapacityHints, EngineConfig, WeightCheck};
pub use engine::{
    CleanupReport, EngineStats, ExecutionPath, InferenceReport, PerceptionEngine, SensoryAdapter,
    TickReport,
};
pub use error::PerceptionError;
pub use fallback::{FallbackOrchestrator, FallbackStats, OrchestratorState};
pub use inflight::{InflightFlag, InflightGuard};
pub use spatial::{CellRect, SpatialIndex, SpatialIndexStats};
pub use types::{
    Agent, AgentRays, ArchitectureKey, Brain, Entity, EntityKind, HitType, Obstacle, RayResult,
    RayResults, Vec2, WorldBounds,
};
pub use weight_cache::{WeightCache, WeightCacheStats};
