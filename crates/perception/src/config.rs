//! Engine configuration.
//!
//! Hosts usually embed [`EngineConfig`] in their own configuration files;
//! every field has a default so partial documents deserialize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PerceptionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightCheck {
    /// First element plus a 16-point positional hash per matrix.
    #[default]
    Sampled,
    /// Hash of every weight on every check.
    Exact,
}

/// Expected upper bounds, used to pre-size device buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapacityHints {
    pub max_agents: usize,
    pub max_rays_per_agent: usize,
    pub max_entities: usize,
    pub max_obstacles: usize,
}

impl Default for CapacityHints {
    fn default() -> Self {
        Self {
            max_agents: 1024,
            max_rays_per_agent: 16,
            max_entities: 4096,
            max_obstacles: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Edge length of a spatial grid cell, in world units.
    pub cell_size: f32,
    pub use_spatial_index: bool,
    /// Edges of the polygon approximating each circular obstacle.
    pub obstacle_segments: u32,
    /// Angular spread of an agent's rays, in radians.
    pub sensor_arc: f32,
    /// Fewer active agents than this cast rays on the CPU.
    pub min_accelerated_agents: usize,
    /// Architecture groups smaller than this run on the CPU.
    pub min_accelerated_group: usize,
    /// Consecutive accelerated failures before the engine degrades.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub staging_ring_depth: usize,
    pub growth_factor: f32,
    pub device_timeout_ms: u64,
    pub weight_check: WeightCheck,
    /// `deep_cleanup` rebuilds pipelines once a session is this old.
    pub pipeline_refresh_hours: f64,
    pub capacity: CapacityHints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cell_size: 100.0,
            use_spatial_index: true,
            obstacle_segments: 8,
            sensor_arc: std::f32::consts::PI,
            min_accelerated_agents: 64,
            min_accelerated_group: 32,
            failure_threshold: 10,
            cooldown_ms: 5_000,
            staging_ring_depth: 2,
            growth_factor: 1.5,
            device_timeout_ms: 2_000,
            weight_check: WeightCheck::Sampled,
            pipeline_refresh_hours: 24.0,
            capacity: CapacityHints::default(),
        }
    }
}

impl EngineConfig {
    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), PerceptionError> {
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(PerceptionError::InvalidConfig(
                "cell_size must be finite and positive",
            ));
        }
        if self.obstacle_segments < 3 {
            return Err(PerceptionError::InvalidConfig(
                "obstacle_segments must be at least 3",
            ));
        }
        if !self.sensor_arc.is_finite()
            || self.sensor_arc <= 0.0
            || self.sensor_arc > std::f32::consts::TAU
        {
            return Err(PerceptionError::InvalidConfig(
                "sensor_arc must lie in (0, 2π]",
            ));
        }
        if self.min_accelerated_group == 0 {
            return Err(PerceptionError::InvalidConfig(
                "min_accelerated_group must be at least 1",
            ));
        }
        if self.failure_threshold == 0 {
            return Err(PerceptionError::InvalidConfig(
                "failure_threshold must be at least 1",
            ));
        }
        if self.staging_ring_depth < 2 {
            return Err(PerceptionError::InvalidConfig(
                "staging_ring_depth must be at least 2",
            ));
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(PerceptionError::InvalidConfig(
                "growth_factor must be finite and at least 1",
            ));
        }
        if !self.pipeline_refresh_hours.is_finite() || self.pipeline_refresh_hours <= 0.0 {
            return Err(PerceptionError::InvalidConfig(
                "pipeline_refresh_hours must be finite and positive",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    #[must_use]
    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_cell_size_is_rejected() {
        for cell_size in [0.0, -5.0, f32::NAN, f32::INFINITY] {
            let config = EngineConfig {
                cell_size,
                ..EngineConfig::default()
            };
            let result = config.validate();
            assert!(
                matches!(result, Err(PerceptionError::InvalidConfig(_))),
                "Expected InvalidConfig for cell_size {cell_size}, got {result:?}"
            );
        }
    }

    #[test]
    fn single_slot_staging_ring_is_rejected() {
        let config = EngineConfig {
            staging_ring_depth: 1,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "cell_size": 50.0, "weight_check": "exact" }"#).unwrap();
        assert_eq!(config.cell_size, 50.0);
        assert_eq!(config.weight_check, WeightCheck::Exact);
        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.capacity, CapacityHints::default());
    }
}
