//! A small headless world that drives the perception engine: agents wander,
//! burn energy, and refuel on food.

use perception::{
    Agent, ArchitectureKey, Brain, Entity, HitType, Obstacle, RayResult, SensoryAdapter, Vec2,
    WorldBounds,
};

pub const RAYS_PER_AGENT: u32 = 8;
/// Two values per ray plus the agent's own energy.
pub const INPUTS: usize = RAYS_PER_AGENT as usize * 2 + 1;
pub const FORAGER: ArchitectureKey = ArchitectureKey::new(INPUTS, 16, 3);
pub const SCOUT: ArchitectureKey = ArchitectureKey::new(INPUTS, 8, 3);

const FOOD_SIZE: f32 = 4.0;
const FOOD_ENERGY: f32 = 25.0;
const MAX_SPEED: f32 = 3.0;
const MAX_TURN: f32 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct WorldParams {
    pub width: f32,
    pub height: f32,
    pub agents: usize,
    pub food: usize,
    pub obstacles: usize,
    pub seed: u64,
}

pub struct World {
    pub bounds: WorldBounds,
    pub agents: Vec<Agent>,
    pub food: Vec<Vec2>,
    pub obstacles: Vec<Obstacle>,
    pub entities: Vec<Entity>,
    rng: fastrand::Rng,
}

fn random_brain(rng: &fastrand::Rng, key: ArchitectureKey) -> Brain {
    let mut brain = Brain::zeroed(key);
    for w in brain.weights1.iter_mut().chain(brain.weights2.iter_mut()) {
        *w = (rng.f32() * 2.0 - 1.0) * 0.8;
    }
    brain
}

impl World {
    #[must_use]
    pub fn generate(params: WorldParams) -> Self {
        let rng = fastrand::Rng::with_seed(params.seed);
        let bounds = WorldBounds::new(params.width, params.height);
        let point = |rng: &fastrand::Rng| Vec2::new(rng.f32() * bounds.width, rng.f32() * bounds.height);

        let agents = (0..params.agents)
            .map(|i| {
                // one in four agents carries the smaller network
                let (key, specialization) = if i % 4 == 3 { (SCOUT, 1) } else { (FORAGER, 0) };
                let mut agent = Agent::new(i as u64, point(&rng), random_brain(&rng, key));
                agent.angle = rng.f32() * std::f32::consts::TAU;
                agent.ray_count = RAYS_PER_AGENT;
                agent.specialization = specialization;
                agent
            })
            .collect();
        let food = (0..params.food).map(|_| point(&rng)).collect();
        let obstacles = (0..params.obstacles)
            .map(|_| Obstacle {
                center: point(&rng),
                radius: 20.0 + rng.f32() * 30.0,
            })
            .collect();

        let mut world = Self {
            bounds,
            agents,
            food,
            obstacles,
            entities: Vec::new(),
            rng,
        };
        world.refresh_entities();
        world
    }

    /// Rebuilds the ray-visible entity list from food and living agents.
    pub fn refresh_entities(&mut self) {
        self.entities.clear();
        self.entities
            .extend(self.food.iter().map(|&p| Entity::food(p, FOOD_SIZE)));
        self.entities.extend(
            self.agents
                .iter()
                .enumerate()
                .filter(|(_, a)| a.is_active())
                .map(|(i, a)| Entity::agent(i, a.position, a.size)),
        );
    }

    /// Moves every living agent according to its last outputs
    /// (`[turn, speed, unused]`) and settles energy and food.
    pub fn step(&mut self) {
        let bounds = self.bounds;
        for agent in self.agents.iter_mut().filter(|a| a.is_active()) {
            let turn = agent.outputs.first().map_or(0.0, |o| (o - 0.5) * 2.0 * MAX_TURN);
            let speed = agent.outputs.get(1).map_or(0.0, |o| o * MAX_SPEED);
            agent.angle = (agent.angle + turn).rem_euclid(std::f32::consts::TAU);
            agent.velocity = Vec2::from_angle(agent.angle) * speed;
            let next = agent.position + agent.velocity;
            agent.position = Vec2::new(next.x.clamp(0.0, bounds.width), next.y.clamp(0.0, bounds.height));
            agent.energy -= 0.05 + speed * 0.02;

            let reach = agent.size + FOOD_SIZE;
            if let Some(slot) = self
                .food
                .iter()
                .position(|&f| (f - agent.position).length() < reach)
            {
                agent.energy = (agent.energy + FOOD_ENERGY).min(100.0);
                self.food[slot] = Vec2::new(self.rng.f32() * bounds.width, self.rng.f32() * bounds.height);
            }
        }
    }

    #[must_use]
    pub fn alive(&self) -> usize {
        self.agents.iter().filter(|a| a.is_active()).count()
    }
}

/// Per ray: closeness in `[0, 1]` and a signed tag (+ food, - danger).
pub struct Vision;

impl SensoryAdapter for Vision {
    fn fill_inputs(&self, _agent_index: usize, agent: &Agent, rays: &[RayResult], inputs: &mut Vec<f32>) {
        for ray in rays {
            let closeness = if agent.max_ray_distance > 0.0 {
                1.0 - ray.distance / agent.max_ray_distance
            } else {
                0.0
            };
            let tag = match ray.hit_type {
                HitType::Food => 1.0,
                HitType::Agent => 0.5,
                HitType::None => 0.0,
                HitType::Boundary => -0.5,
                HitType::Obstacle => -1.0,
            };
            inputs.push(closeness);
            inputs.push(tag);
        }
        inputs.push(agent.energy / 100.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> WorldParams {
        WorldParams {
            width: 800.0,
            height: 600.0,
            agents: 8,
            food: 20,
            obstacles: 3,
            seed: 1,
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let a = World::generate(params());
        let b = World::generate(params());
        assert_eq!(a.food, b.food);
        assert_eq!(a.agents[5].position, b.agents[5].position);
        assert_eq!(a.entities.len(), 28);
        assert_eq!(a.agents[3].brain.architecture, SCOUT);
        assert_eq!(a.agents[0].brain.architecture, FORAGER);
    }

    #[test]
    fn step_keeps_agents_inside_and_drains_energy() {
        let mut world = World::generate(params());
        for agent in &mut world.agents {
            agent.outputs = vec![1.0, 1.0, 0.0];
        }
        for _ in 0..500 {
            world.step();
        }
        for agent in &world.agents {
            assert!(agent.position.x >= 0.0 && agent.position.x <= 800.0);
            assert!(agent.position.y >= 0.0 && agent.position.y <= 600.0);
        }
        assert!(world.agents.iter().any(|a| a.energy < 100.0));
    }

    #[test]
    fn dead_agents_leave_the_entity_list() {
        let mut world = World::generate(params());
        world.agents[0].energy = 0.0;
        world.refresh_entities();
        assert_eq!(world.entities.len(), 27);
    }

    #[test]
    fn vision_emits_two_values_per_ray_and_energy() {
        let agent = Agent::new(0, Vec2::ZERO, Brain::zeroed(FORAGER));
        let rays = [
            RayResult::miss(200.0),
            RayResult {
                distance: 50.0,
                hit_type: HitType::Food,
                hit_index: Some(0),
                hit_size: FOOD_SIZE,
            },
        ];
        let mut inputs = Vec::new();
        Vision.fill_inputs(0, &agent, &rays, &mut inputs);
        assert_eq!(inputs, vec![0.0, 0.0, 0.75, 1.0, 1.0]);
    }
}
