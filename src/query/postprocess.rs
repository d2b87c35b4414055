// src/query/postprocess.rs
//
// Path shaping after the A*: drop collinear points, shortcut the corridor
// with raycasts, and optionally smooth with a Catmull-Rom spline whose
// samples are validated against the octree.

use glam::Vec3;

use crate::svo::Svo;

use super::PathPoint;

/// Removes every middle point B of a run A-B-C where B lies on the line
/// from A to C.
pub fn clean_up_path(points: &mut Vec<PathPoint>) {
    let mut i = 0;
    while points.len() >= 3 && i + 2 < points.len() {
        let dir_ab = (points[i + 1].location - points[i].location).normalize_or_zero();
        let dir_bc = (points[i + 2].location - points[i + 1].location).normalize_or_zero();

        if dir_ab.abs_diff_eq(dir_bc, 1e-4) {
            points.remove(i + 1);
            // Re-test the same triple; the new neighbor may be collinear too.
        } else {
            i += 1;
        }
    }
}

/// Greedy raycast shortcutting: from each point, find the furthest later
/// point it can see and drop everything between. This is not a funnel
/// algorithm; it only removes redundant corridor points.
pub fn pull_path(octree: &Svo, points: &mut Vec<PathPoint>) {
    let mut i = 0;
    while points.len() >= 3 && i + 1 < points.len() - 1 {
        let from = points[i].location;

        let mut j = points.len() - 1;
        while j > i + 1 {
            if octree.raycast(from, points[j].location).is_none() {
                points.drain(i + 1..j);
                break;
            }
            j -= 1;
        }

        i += 1;
    }
}

/// Catmull-Rom evaluation with explicit knots. Degenerate knot spacing
/// falls back to a straight lerp between the segment endpoints.
fn catmull_rom(
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    p3: Vec3,
    t0: f32,
    t1: f32,
    t2: f32,
    t3: f32,
    t: f32,
) -> Vec3 {
    if !(t1 > t0 && t2 > t1 && t3 > t2) {
        let span = (t2 - t1).max(f32::EPSILON);
        return p1.lerp(p2, (t - t1) / span);
    }

    let a1 = p0 * ((t1 - t) / (t1 - t0)) + p1 * ((t - t0) / (t1 - t0));
    let a2 = p1 * ((t2 - t) / (t2 - t1)) + p2 * ((t - t1) / (t2 - t1));
    let a3 = p2 * ((t3 - t) / (t3 - t2)) + p3 * ((t - t2) / (t3 - t2));

    let b1 = a1 * ((t2 - t) / (t2 - t0)) + a2 * ((t - t0) / (t2 - t0));
    let b2 = a2 * ((t3 - t) / (t3 - t1)) + a3 * ((t - t1) / (t3 - t1));

    b1 * ((t2 - t) / (t2 - t1)) + b2 * ((t - t1) / (t2 - t1))
}

/// Smooths the path with a Catmull-Rom spline. `alpha` picks the
/// parameterization (0 uniform, 0.5 centripetal, 1 chordal); `iterations`
/// is the number of interior samples per segment. A sample is kept only
/// when it maps to a valid link and both its segment endpoints are
/// visible from it.
pub fn smooth_path(octree: &Svo, points: &mut Vec<PathPoint>, alpha: f32, iterations: u8) {
    if points.len() < 3 {
        return;
    }

    let num_points = points.len();
    let last = num_points - 1;

    // Phantom points past each end, extending the first and last segments,
    // so the end segments get full curvature context.
    let first_delta = points[0].location - points[1].location;
    let first_prev = points[0].location + first_delta.normalize_or_zero() * first_delta.length();

    let last_delta = points[last].location - points[last - 1].location;
    let last_next = points[last].location + last_delta.normalize_or_zero() * last_delta.length();

    let mut out: Vec<PathPoint> = Vec::with_capacity(num_points * iterations as usize);

    for i in 0..last {
        let p0 = if i == 0 { first_prev } else { points[i - 1].location };
        let p1 = points[i].location;
        let p2 = points[i + 1].location;
        let p3 = if i == num_points - 2 { last_next } else { points[i + 2].location };

        // Segment start handle; the end handle is the next segment's start.
        out.push(points[i]);

        for iteration in 1..=iterations {
            let t = iteration as f32 / (iterations as f32 + 1.0);

            let t0 = 0.0;
            let t1 = t0 + p0.distance(p1).powf(alpha);
            let t2 = t1 + p1.distance(p2).powf(alpha);
            let t3 = t2 + p2.distance(p3).powf(alpha);

            let sample = catmull_rom(p0, p1, p2, p3, t0, t1, t2, t3, t1 + (t2 - t1) * t);

            let link = octree.link_for_location(sample, false);
            if link.is_valid()
                && octree.raycast(sample, p1).is_none()
                && octree.raycast(sample, p2).is_none()
            {
                out.push(PathPoint {
                    location: sample,
                    node: link,
                });
            }
        }
    }

    out.push(points[num_points - 1]);
    *points = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SvoConfig;
    use crate::svo::node::{NodeLink, NodeState};
    use glam::IVec3;

    fn point(x: f32, y: f32, z: f32) -> PathPoint {
        PathPoint {
            location: Vec3::new(x, y, z),
            node: NodeLink::INVALID,
        }
    }

    fn open_svo() -> Svo {
        let config = SvoConfig::new(Vec3::ZERO, 32.0, 8, 1);
        let mut svo = Svo::new(config);
        let tile = svo.ensure_tile_at_coord(IVec3::ZERO).unwrap();
        tile.node_info_mut().set_node_state(NodeState::Open);
        svo
    }

    #[test]
    fn cleanup_drops_collinear_runs() {
        let mut points = vec![
            point(0.0, 0.0, 0.0),
            point(1.0, 0.0, 0.0),
            point(2.0, 0.0, 0.0),
            point(3.0, 0.0, 0.0),
            point(3.0, 1.0, 0.0),
        ];

        clean_up_path(&mut points);

        assert_eq!(points.len(), 3);
        assert_eq!(points[0].location, Vec3::ZERO);
        assert_eq!(points[1].location, Vec3::new(3.0, 0.0, 0.0));
        assert_eq!(points[2].location, Vec3::new(3.0, 1.0, 0.0));
    }

    #[test]
    fn cleanup_keeps_corners() {
        let mut points = vec![
            point(0.0, 0.0, 0.0),
            point(1.0, 0.0, 0.0),
            point(1.0, 1.0, 0.0),
        ];

        clean_up_path(&mut points);
        assert_eq!(points.len(), 3);
    }

    #[test]
    fn pull_removes_visible_middles() {
        let svo = open_svo();

        // A dogleg inside a fully open tile; everything is visible from
        // everything, so only the endpoints survive.
        let mut points = vec![
            point(32.0, 32.0, 32.0),
            point(64.0, 128.0, 64.0),
            point(128.0, 64.0, 128.0),
            point(224.0, 224.0, 224.0),
        ];

        pull_path(&svo, &mut points);

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].location, Vec3::splat(32.0));
        assert_eq!(points[1].location, Vec3::splat(224.0));
    }

    #[test]
    fn smooth_keeps_endpoints_and_samples_open_space() {
        let svo = open_svo();

        let mut points = vec![
            point(32.0, 32.0, 128.0),
            point(128.0, 128.0, 128.0),
            point(224.0, 32.0, 128.0),
        ];
        let start = points[0].location;
        let end = points[2].location;

        smooth_path(&svo, &mut points, 0.5, 3);

        assert!(points.len() >= 3);
        assert_eq!(points.first().unwrap().location, start);
        assert_eq!(points.last().unwrap().location, end);

        for p in &points[1..points.len() - 1] {
            if p.node.is_valid() {
                assert!(svo.bounds_for_link(p.node).unwrap().contains_point(p.location));
            }
        }
    }
}
