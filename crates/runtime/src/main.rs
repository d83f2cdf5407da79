#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
//! # Perception Runtime
//!
//! Headless driver for the perception engine. Generates a seeded world, runs
//! it for a number of ticks and prints a JSON summary of how each tick was
//! executed. Logs go to stderr and honour `RUST_LOG`.

mod world;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use perception::{EngineConfig, ExecutionPath, PerceptionEngine};
use tracing_subscriber::EnvFilter;

use crate::world::{Vision, World, WorldParams};

#[derive(Parser, Debug)]
#[command(name = "runtime_main", about = "Runs a headless perception world")]
struct Args {
    #[arg(long, default_value_t = 512)]
    agents: usize,
    #[arg(long, default_value_t = 1024)]
    food: usize,
    #[arg(long, default_value_t = 16)]
    obstacles: usize,
    #[arg(long, default_value_t = 200)]
    ticks: u64,
    #[arg(long, default_value_t = 7)]
    seed: u64,
    #[arg(long, default_value_t = 2000.0)]
    width: f32,
    #[arg(long, default_value_t = 2000.0)]
    height: f32,
    /// JSON file with engine settings; missing fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Never touch an accelerator.
    #[arg(long)]
    cpu_only: bool,
    /// Ticks between deep cleanups.
    #[arg(long, default_value_t = 100)]
    cleanup_every: u64,
}

#[derive(Debug, Default)]
struct PathCounts {
    accelerated: u64,
    cpu: u64,
    fallback: u64,
}

impl PathCounts {
    fn record(&mut self, path: ExecutionPath) {
        match path {
            ExecutionPath::Accelerated => self.accelerated += 1,
            ExecutionPath::Cpu => self.cpu += 1,
            ExecutionPath::Fallback => self.fallback += 1,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "accelerated": self.accelerated,
            "cpu": self.cpu,
            "fallback": self.fallback,
        })
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading engine config {}", path.display()))?;
    let config: EngineConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing engine config {}", path.display()))?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let mut engine = if args.cpu_only {
        PerceptionEngine::new(config, None)?
    } else {
        PerceptionEngine::with_default_backend(config)?
    };

    let mut world = World::generate(WorldParams {
        width: args.width,
        height: args.height,
        agents: args.agents,
        food: args.food,
        obstacles: args.obstacles,
        seed: args.seed,
    });
    tracing::info!(
        agents = args.agents,
        food = args.food,
        obstacles = args.obstacles,
        accelerator = engine.is_available(),
        "world generated"
    );

    let session = Instant::now();
    let mut rays = PathCounts::default();
    let mut inference = PathCounts::default();
    let mut busy = Duration::ZERO;
    let mut slowest = Duration::ZERO;

    for tick in 1..=args.ticks {
        world.refresh_entities();
        let report = pollster::block_on(engine.tick(
            &mut world.agents,
            &world.entities,
            &world.obstacles,
            world.bounds,
            &Vision,
        ));
        world.step();

        rays.record(report.rays);
        inference.record(report.inference.path);
        busy += report.duration;
        slowest = slowest.max(report.duration);

        if tick % 50 == 0 {
            tracing::info!(
                tick,
                alive = world.alive(),
                rays = report.ray_count,
                tick_ms = report.duration.as_secs_f64() * 1e3,
                "progress"
            );
        }
        if args.cleanup_every > 0 && tick % args.cleanup_every == 0 {
            engine.deep_cleanup(session.elapsed().as_secs_f64() / 3600.0);
        }
        if world.alive() == 0 {
            tracing::warn!(tick, "every agent has died, stopping early");
            break;
        }
    }

    let stats = engine.stats();
    let ticks = stats.ticks.max(1);
    let summary = serde_json::json!({
        "ticks": stats.ticks,
        "alive": world.alive(),
        "backend": stats.backend,
        "rays": rays.to_json(),
        "inference": inference.to_json(),
        "ray_state": format!("{:?}", stats.ray_state),
        "inference_state": format!("{:?}", stats.inference_state),
        "weight_uploads": stats.weight_uploads,
        "mean_tick_ms": busy.as_secs_f64() * 1e3 / ticks as f64,
        "slowest_tick_ms": slowest.as_secs_f64() * 1e3,
    });
    println!("{summary}");
    Ok(())
}
