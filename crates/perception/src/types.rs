//! Records the engine consumes from, and hands back to, the host simulation.

use std::fmt;
use std::ops::{Add, Mul, Sub};

use compute::gpu_types::{HIT_AGENT, HIT_BOUNDARY, HIT_FOOD, HIT_NONE, HIT_OBSTACLE};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Unit vector pointing along `angle` (radians, counter-clockwise from +x).
    #[must_use]
    pub fn from_angle(angle: f32) -> Self {
        Self::new(angle.cos(), angle.sin())
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    #[must_use]
    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y))
    }

    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y))
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    #[must_use]
    pub fn to_array(self) -> [f32; 2] {
        [self.x, self.y]
    }
}

impl Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

/// Network dimensions. Agents sharing a key are batched together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchitectureKey {
    pub input: usize,
    pub hidden: usize,
    pub output: usize,
}

impl ArchitectureKey {
    #[must_use]
    pub const fn new(input: usize, hidden: usize, output: usize) -> Self {
        Self {
            input,
            hidden,
            output,
        }
    }

    /// Length of the network input row: perception inputs then hidden state.
    #[must_use]
    pub const fn row_len(&self) -> usize {
        self.input + self.hidden
    }

    #[must_use]
    pub const fn weights1_len(&self) -> usize {
        self.row_len() * self.hidden
    }

    #[must_use]
    pub const fn weights2_len(&self) -> usize {
        self.hidden * self.output
    }
}

impl fmt::Display for ArchitectureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}h{}o{}", self.input, self.hidden, self.output)
    }
}

/// Two dense layers. `weights1` is row-major `(input + hidden) x hidden`,
/// `weights2` is row-major `hidden x output`. Missing entries read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Brain {
    pub architecture: ArchitectureKey,
    pub weights1: Vec<f32>,
    pub weights2: Vec<f32>,
}

impl Brain {
    /// A network with all weights zero.
    #[must_use]
    pub fn zeroed(architecture: ArchitectureKey) -> Self {
        Self {
            architecture,
            weights1: vec![0.0; architecture.weights1_len()],
            weights2: vec![0.0; architecture.weights2_len()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: u64,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Heading in radians.
    pub angle: f32,
    pub size: f32,
    pub ray_count: u32,
    pub max_ray_distance: f32,
    pub specialization: u32,
    pub energy: f32,
    /// Perception inputs for the current tick, written by the sensory adapter.
    pub inputs: Vec<f32>,
    /// Recurrent state; its length never changes.
    pub hidden: Vec<f32>,
    /// Action vector produced by the last inference.
    pub outputs: Vec<f32>,
    pub brain: Brain,
}

impl Agent {
    #[must_use]
    pub fn new(id: u64, position: Vec2, brain: Brain) -> Self {
        let hidden = vec![0.0; brain.architecture.hidden];
        Self {
            id,
            position,
            velocity: Vec2::ZERO,
            angle: 0.0,
            size: 10.0,
            ray_count: 8,
            max_ray_distance: 200.0,
            specialization: 0,
            energy: 100.0,
            inputs: Vec::new(),
            hidden,
            outputs: Vec::new(),
            brain,
        }
    }

    /// Only active agents cast rays and run inference.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.energy > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Food,
    /// Body of the agent at `owner` in the agent slice passed alongside.
    Agent { owner: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub position: Vec2,
    pub size: f32,
    pub kind: EntityKind,
}

impl Entity {
    #[must_use]
    pub fn food(position: Vec2, size: f32) -> Self {
        Self {
            position,
            size,
            kind: EntityKind::Food,
        }
    }

    #[must_use]
    pub fn agent(owner: usize, position: Vec2, size: f32) -> Self {
        Self {
            position,
            size,
            kind: EntityKind::Agent { owner },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obstacle {
    pub center: Vec2,
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldBounds {
    pub width: f32,
    pub height: f32,
}

impl WorldBounds {
    #[must_use]
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HitType {
    None,
    Boundary,
    Food,
    Agent,
    Obstacle,
}

impl HitType {
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            HIT_NONE => Some(Self::None),
            HIT_BOUNDARY => Some(Self::Boundary),
            HIT_FOOD => Some(Self::Food),
            HIT_AGENT => Some(Self::Agent),
            HIT_OBSTACLE => Some(Self::Obstacle),
            _ => None,
        }
    }

    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::None => HIT_NONE,
            Self::Boundary => HIT_BOUNDARY,
            Self::Food => HIT_FOOD,
            Self::Agent => HIT_AGENT,
            Self::Obstacle => HIT_OBSTACLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayResult {
    pub distance: f32,
    pub hit_type: HitType,
    /// Entity index for food and agent hits, obstacle index for obstacle hits.
    pub hit_index: Option<usize>,
    pub hit_size: f32,
}

impl RayResult {
    #[must_use]
    pub fn miss(max_distance: f32) -> Self {
        Self {
            distance: max_distance,
            hit_type: HitType::None,
            hit_index: None,
            hit_size: 0.0,
        }
    }
}

/// The rays of one agent inside [`RayResults`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentRays {
    /// Index into the agent slice passed to `cast_rays`.
    pub agent: usize,
    pub offset: usize,
    pub count: usize,
}

/// Contiguous per-agent ray results for one tick.
#[derive(Debug, Clone, Default)]
pub struct RayResults {
    results: Vec<RayResult>,
    spans: Vec<AgentRays>,
}

impl RayResults {
    pub fn clear(&mut self) {
        self.results.clear();
        self.spans.clear();
    }

    /// Appends the rays of the next agent. Agents must be pushed in
    /// ascending slice order.
    pub fn push_agent(&mut self, agent: usize, rays: impl IntoIterator<Item = RayResult>) {
        let offset = self.results.len();
        self.results.extend(rays);
        self.spans.push(AgentRays {
            agent,
            offset,
            count: self.results.len() - offset,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    #[must_use]
    pub fn all(&self) -> &[RayResult] {
        &self.results
    }

    #[must_use]
    pub fn spans(&self) -> &[AgentRays] {
        &self.spans
    }

    #[must_use]
    pub fn for_agent(&self, agent: usize) -> Option<&[RayResult]> {
        let span = self
            .spans
            .binary_search_by_key(&agent, |s| s.agent)
            .ok()
            .map(|i| self.spans[i])?;
        self.results.get(span.offset..span.offset + span.count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[RayResult])> + '_ {
        self.spans
            .iter()
            .map(|s| (s.agent, &self.results[s.offset..s.offset + s.count]))
    }

    pub fn shrink_to_fit(&mut self) {
        self.results.shrink_to_fit();
        self.spans.shrink_to_fit();
    }
}
