//! Ray intersection primitives shared by both ray casters.
//!
//! These must stay numerically identical to the functions of the same name in
//! `shaders/cast_rays.wgsl`.

use std::f32::consts::TAU;

use compute::gpu_types::RAY_EPSILON;

use crate::types::{Obstacle, Vec2, WorldBounds};

/// Heading of ray `index` out of `count`, spread evenly over `arc` around
/// `angle`.
#[must_use]
pub fn ray_angle(angle: f32, index: u32, count: u32, arc: f32) -> f32 {
    angle + ((index as f32 + 0.5) / count as f32 - 0.5) * arc
}

/// Distance to the first world edge along `dir`. Origins outside the world
/// yield zero on the offending axis.
#[must_use]
pub fn boundary_distance(bounds: WorldBounds, origin: Vec2, dir: Vec2) -> f32 {
    let mut t = f32::MAX;
    for (extent, o, d) in [(bounds.width, origin.x, dir.x), (bounds.height, origin.y, dir.y)] {
        if d > 1e-6 {
            t = t.min(((extent - o) / d).max(0.0));
        } else if d < -1e-6 {
            t = t.min((-o / d).max(0.0));
        }
    }
    t
}

/// Nearest forward intersection of a unit-direction ray with a circle.
#[must_use]
pub fn ray_circle(origin: Vec2, dir: Vec2, center: Vec2, radius: f32) -> Option<f32> {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.dot(oc) - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let s = disc.sqrt();
    [-b - s, -b + s].into_iter().find(|t| *t > RAY_EPSILON)
}

#[must_use]
pub fn ray_segment(origin: Vec2, dir: Vec2, a: Vec2, b: Vec2) -> Option<f32> {
    let v1 = origin - a;
    let v2 = b - a;
    let v3 = Vec2::new(-dir.y, dir.x);
    let denom = v2.dot(v3);
    if denom.abs() < 1e-8 {
        return None;
    }
    let t = (v2.x * v1.y - v2.y * v1.x) / denom;
    let u = v1.dot(v3) / denom;
    (t > RAY_EPSILON && (0.0..=1.0).contains(&u)).then_some(t)
}

/// One polygon edge of a circular obstacle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleSegment {
    pub a: Vec2,
    pub b: Vec2,
    /// Index of the obstacle in the slice passed to the caster.
    pub obstacle: usize,
    pub radius: f32,
}

/// Approximates every obstacle by a regular `sides`-gon inscribed in its
/// circle, first vertex at angle zero. Obstacles with a non-finite center or
/// radius are skipped.
pub fn build_segments(obstacles: &[Obstacle], sides: u32, out: &mut Vec<ObstacleSegment>) {
    out.clear();
    let sides = sides.max(3);
    for (index, obstacle) in obstacles.iter().enumerate() {
        if !obstacle.center.is_finite() || !obstacle.radius.is_finite() {
            continue;
        }
        let vertex = |k: u32| {
            let theta = TAU * k as f32 / sides as f32;
            obstacle.center + Vec2::from_angle(theta) * obstacle.radius
        };
        for k in 0..sides {
            out.push(ObstacleSegment {
                a: vertex(k),
                b: vertex(k + 1),
                obstacle: index,
                radius: obstacle.radius,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EAST: Vec2 = Vec2::new(1.0, 0.0);

    #[test]
    fn rays_are_centered_on_heading() {
        assert_eq!(ray_angle(1.0, 0, 1, std::f32::consts::PI), 1.0);
        let left = ray_angle(0.0, 0, 2, 2.0);
        let right = ray_angle(0.0, 1, 2, 2.0);
        assert!((left + 0.5).abs() < 1e-6 && (right - 0.5).abs() < 1e-6);
    }

    #[test]
    fn boundary_is_measured_along_the_ray() {
        let bounds = WorldBounds::new(100.0, 100.0);
        assert!((boundary_distance(bounds, Vec2::new(40.0, 50.0), EAST) - 60.0).abs() < 1e-5);
        let diagonal = Vec2::from_angle(std::f32::consts::FRAC_PI_4);
        let t = boundary_distance(bounds, Vec2::new(50.0, 90.0), diagonal);
        assert!((t - 10.0 * std::f32::consts::SQRT_2).abs() < 1e-3, "got {t}");
        assert_eq!(boundary_distance(bounds, Vec2::new(150.0, 50.0), EAST), 0.0);
    }

    #[test]
    fn circle_hits_near_side_or_exits_from_inside() {
        let t = ray_circle(Vec2::ZERO, EAST, Vec2::new(10.0, 0.0), 2.0);
        assert_eq!(t, Some(8.0));
        let inside = ray_circle(Vec2::new(10.0, 0.0), EAST, Vec2::new(10.0, 0.0), 2.0);
        assert_eq!(inside, Some(2.0));
        assert_eq!(ray_circle(Vec2::ZERO, EAST, Vec2::new(-10.0, 0.0), 2.0), None);
        assert_eq!(ray_circle(Vec2::ZERO, EAST, Vec2::new(10.0, 5.0), 2.0), None);
    }

    #[test]
    fn segment_hits_only_within_its_extent() {
        let a = Vec2::new(5.0, -1.0);
        let b = Vec2::new(5.0, 1.0);
        let t = ray_segment(Vec2::ZERO, EAST, a, b).unwrap();
        assert!((t - 5.0).abs() < 1e-5);
        assert_eq!(ray_segment(Vec2::new(0.0, 3.0), EAST, a, b), None);
        assert_eq!(ray_segment(Vec2::ZERO, EAST, Vec2::new(1.0, 0.0), Vec2::new(4.0, 0.0)), None);
    }

    #[test]
    fn obstacles_become_closed_polygons() {
        let obstacles = [
            Obstacle {
                center: Vec2::new(10.0, 10.0),
                radius: 5.0,
            },
            Obstacle {
                center: Vec2::new(f32::NAN, 0.0),
                radius: 1.0,
            },
        ];
        let mut segments = Vec::new();
        build_segments(&obstacles, 4, &mut segments);
        assert_eq!(segments.len(), 4);
        assert!((segments[0].a.x - 15.0).abs() < 1e-5);
        assert!((segments[0].a.y - 10.0).abs() < 1e-5);
        let last = segments[3].b;
        assert!((last.x - 15.0).abs() < 1e-4 && (last.y - 10.0).abs() < 1e-4);
        assert!(segments.iter().all(|s| s.obstacle == 0 && s.radius == 5.0));
    }
}
