// tests/nav_scenarios.rs
//
// End-to-end navigation scenarios: empty octrees, straight-line paths,
// routing around a wall, partial paths under node caps, reachable-set
// walks, and build/query/serialize round trips through the scheduler.

use std::sync::Arc;

use glam::{IVec3, Vec3};

use svo_nav::{
    find_nav_path, find_path, Aabb, BuildScheduler, DirtyArea, DirtyFlags, EditableSvo,
    GeneratorConfig, GeometrySource, NavPathOptions, NodeLink, NodeQuery, PathQueryResults,
    QueryFilter, QueryStatus, SchedulerConfig, Svo, SvoConfig, Tile, Triangle,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open_tile(config: &SvoConfig, coord: IVec3) -> Tile {
    Tile::new(
        svo_nav::svo::tile::tile_id_for_coord(coord),
        config.tile_layer_idx(),
        coord,
    )
}

/// Editable octree made of fully open tiles at the given coords.
fn open_world(config: SvoConfig, coords: &[IVec3]) -> EditableSvo {
    let mut octree = EditableSvo::new(config.clone());

    octree.begin_batch_edit();
    for &coord in coords {
        let mut tile = open_tile(&config, coord);
        octree.assume_tile(&mut tile, false);
    }
    octree.end_batch_edit();

    octree.verify_node_data(true);
    octree
}

/// A vertical wall at x = `x`, spanning all y and z up to `top_z`, leaving
/// a gap above.
struct WallSource {
    x: f32,
    top_z: f32,
}

impl GeometrySource for WallSource {
    fn gather_triangles(&self, bounds: &Aabb, out: &mut Vec<Triangle>) {
        let quad = [
            Triangle {
                v0: Vec3::new(self.x, -64.0, -64.0),
                v1: Vec3::new(self.x, 576.0, -64.0),
                v2: Vec3::new(self.x, 576.0, self.top_z),
            },
            Triangle {
                v0: Vec3::new(self.x, -64.0, -64.0),
                v1: Vec3::new(self.x, 576.0, self.top_z),
                v2: Vec3::new(self.x, -64.0, self.top_z),
            },
        ];
        for tri in quad {
            if tri.bounds().intersects(bounds) {
                out.push(tri);
            }
        }
    }
}

/// Builds the two-tile wall world through the scheduler: tiles (0,0,0) and
/// (1,0,0) with a wall near their shared face, open only near the top.
fn wall_world() -> EditableSvo {
    let svo_config = SvoConfig::new(Vec3::ZERO, 16.0, 64, 2);
    assert_eq!(svo_config.tile_resolution(), 256.0);

    let gen_config = GeneratorConfig::new(svo_config.clone(), 16.0, 32.0);
    let mut scheduler = BuildScheduler::new(
        gen_config,
        SchedulerConfig::default(),
        Arc::new(WallSource { x: 260.0, top_z: 200.0 }),
    );

    let mut octree = EditableSvo::new(svo_config);

    let world = Aabb::new(Vec3::ZERO, Vec3::new(512.0, 256.0, 256.0));
    scheduler.set_inclusion_bounds(vec![world]);
    scheduler.mark_dirty_areas(
        &octree,
        &[DirtyArea {
            bounds: world,
            flags: DirtyFlags::ALL,
        }],
    );

    scheduler.ensure_build_completion(&mut octree);

    assert_eq!(octree.num_tiles(), 2);
    octree.verify_node_data(true);

    octree
}

// ---------------------------------------------------------------------------
// Scenario 1: empty octree
// ---------------------------------------------------------------------------

#[test]
fn empty_octree_rejects_queries() {
    let config = SvoConfig::new(Vec3::ZERO, 32.0, 64, 3);
    let octree = Svo::new(config);

    assert!(!octree.link_for_location(Vec3::ZERO, false).is_valid());

    let mut filter = QueryFilter::default();
    let result = find_nav_path(
        &octree,
        Vec3::ZERO,
        Vec3::new(100.0, 0.0, 0.0),
        &mut filter,
        &NavPathOptions::default(),
    );

    let err = result.err().expect("no path in empty octree");
    assert!(err.contains(QueryStatus::FAILURE));
}

// ---------------------------------------------------------------------------
// Scenario 2: straight-line path in open space
// ---------------------------------------------------------------------------

#[test]
fn straight_line_path_in_open_tile() {
    let config = SvoConfig::new(Vec3::ZERO, 32.0, 64, 1);
    let octree = open_world(config, &[IVec3::ZERO]);

    let start = Vec3::new(16.0, 16.0, 16.0);
    let end = Vec3::new(112.0, 16.0, 16.0);

    let mut filter = QueryFilter::default();
    let path = find_nav_path(&octree, start, end, &mut filter, &NavPathOptions::default())
        .expect("path through open space");

    assert!(!path.partial);
    assert_eq!(path.points.len(), 2, "interior portals are collinear and cleaned up");
    assert_eq!(path.points[0].location, start);
    assert_eq!(path.points[1].location, end);

    let length: f32 = path
        .points
        .windows(2)
        .map(|w| w[0].location.distance(w[1].location))
        .sum();
    assert!((length - 96.0).abs() < 1.0);
}

#[test]
fn straight_line_path_across_tiles() {
    let config = SvoConfig::new(Vec3::ZERO, 32.0, 64, 1);
    let octree = open_world(config, &[IVec3::ZERO, IVec3::new(1, 0, 0)]);

    let start = Vec3::new(128.0, 128.0, 128.0);
    let end = Vec3::new(384.0, 128.0, 128.0);

    let mut filter = QueryFilter::default();
    let path = find_nav_path(&octree, start, end, &mut filter, &NavPathOptions::default())
        .expect("path across two open tiles");

    assert!(!path.partial);
    assert_eq!(path.points.first().unwrap().location, start);
    assert_eq!(path.points.last().unwrap().location, end);

    // The whole corridor is open: every leg raycasts clean.
    for pair in path.points.windows(2) {
        assert!(octree.raycast(pair[0].location, pair[1].location).is_none());
    }
}

// ---------------------------------------------------------------------------
// Scenario 3: around a wall
// ---------------------------------------------------------------------------

#[test]
fn path_routes_over_wall() {
    let octree = wall_world();

    let start = Vec3::new(64.0, 128.0, 96.0);
    let end = Vec3::new(448.0, 128.0, 96.0);

    // The wall blocks the straight line.
    assert!(octree.raycast(start, end).is_some());

    let mut filter = QueryFilter::default();
    let options = NavPathOptions::default();
    let path = find_nav_path(&octree, start, end, &mut filter, &options).expect("path over wall");

    assert!(!path.partial);

    let length: f32 = path
        .points
        .windows(2)
        .map(|w| w[0].location.distance(w[1].location))
        .sum();
    let straight = start.distance(end);
    assert!(length > straight, "wall forces a detour: {length} vs {straight}");

    // Every leg of the final path is unobstructed.
    for pair in path.points.windows(2) {
        assert!(
            octree.raycast(pair[0].location, pair[1].location).is_none(),
            "leg {:?} -> {:?} blocked",
            pair[0].location,
            pair[1].location
        );
    }
}

// ---------------------------------------------------------------------------
// Scenario 4: partial path under a node cap
// ---------------------------------------------------------------------------

#[test]
fn node_cap_yields_partial_path() {
    let octree = wall_world();

    let start = Vec3::new(64.0, 128.0, 96.0);
    let end = Vec3::new(448.0, 128.0, 96.0);

    let mut filter = QueryFilter {
        max_search_nodes: 16,
        ..Default::default()
    };

    // Partial paths rejected: failure with the out-of-nodes bit.
    let err = find_nav_path(
        &octree,
        start,
        end,
        &mut filter,
        &NavPathOptions {
            allow_partial_paths: false,
            ..Default::default()
        },
    )
    .err()
    .expect("cap of 16 cannot reach the goal");
    assert!(err.contains(QueryStatus::FAILURE));
    assert!(err.ran_out_of_nodes());

    // Partial paths allowed: success, flagged partial, ends short of the
    // goal at the best-heuristic node.
    let mut filter = QueryFilter {
        max_search_nodes: 16,
        ..Default::default()
    };
    let path = find_nav_path(
        &octree,
        start,
        end,
        &mut filter,
        &NavPathOptions {
            allow_partial_paths: true,
            ..Default::default()
        },
    )
    .expect("partial path");

    assert!(path.partial);
    assert!(path.info.base.status.is_partial());
    assert!(path.info.base.status.ran_out_of_nodes());
    assert!(path.points.last().unwrap().location.distance(end) > 1.0);
}

#[test]
fn single_node_pool_fails_unless_trivial() {
    let octree = wall_world();

    let start_link = octree.link_for_location(Vec3::new(64.0, 128.0, 96.0), false);
    let end_link = octree.link_for_location(Vec3::new(448.0, 128.0, 96.0), false);
    assert!(start_link.is_valid() && end_link.is_valid());

    let mut filter = QueryFilter {
        max_search_nodes: 1,
        ..Default::default()
    };
    let mut results = PathQueryResults::default();
    find_path(octree.as_svo(), start_link, end_link, 0.0, &mut filter, &mut results);

    assert!(results.base.status.ran_out_of_nodes());

    // start == goal still succeeds with a one-node pool
    let mut results = PathQueryResults::default();
    assert!(find_path(
        octree.as_svo(),
        start_link,
        start_link,
        0.0,
        &mut filter,
        &mut results
    ));
    assert!(results.base.status.is_success());
}

// ---------------------------------------------------------------------------
// Scenario 5: reachable-set enumeration
// ---------------------------------------------------------------------------

#[test]
fn reachable_set_respects_distance_limit() {
    let config = SvoConfig::new(Vec3::ZERO, 32.0, 64, 1);
    let octree = open_world(
        config,
        &[IVec3::ZERO, IVec3::new(1, 0, 0), IVec3::new(2, 0, 0)],
    );

    let origin = Vec3::splat(128.0);
    let query = NodeQuery::new(octree.as_svo(), 256, Vec3::splat(128.0));

    // Tiny travel budget: only the start node is reachable.
    let mut visited = Vec::new();
    let mut filter = QueryFilter::default();
    let mut results = svo_nav::QueryResults::default();
    query.search_reachable_nodes(
        origin,
        10.0,
        |node_ref| {
            visited.push(NodeLink::from_id(node_ref));
            true
        },
        &mut filter,
        &mut results,
    );
    assert_eq!(visited.len(), 1);

    // Generous budget: every tile in the row gets visited.
    let mut visited = Vec::new();
    let mut filter = QueryFilter::default();
    let mut results = svo_nav::QueryResults::default();
    query.search_reachable_nodes(
        origin,
        10_000.0,
        |node_ref| {
            visited.push(NodeLink::from_id(node_ref));
            true
        },
        &mut filter,
        &mut results,
    );

    let mut tile_ids: Vec<u32> = visited.iter().map(|l| l.tile_id).collect();
    tile_ids.sort_unstable();
    tile_ids.dedup();
    assert_eq!(tile_ids.len(), 3, "all three open tiles reachable");

    // Early termination via callback
    let mut count = 0;
    let mut filter = QueryFilter::default();
    let mut results = svo_nav::QueryResults::default();
    query.search_reachable_nodes(
        origin,
        10_000.0,
        |_| {
            count += 1;
            count < 2
        },
        &mut filter,
        &mut results,
    );
    assert_eq!(count, 2);
}

#[test]
fn closest_and_random_reachable_nodes() {
    let octree = wall_world();
    let query = NodeQuery::new(octree.as_svo(), 512, Vec3::splat(256.0));

    let origin = Vec3::new(64.0, 128.0, 96.0);

    let mut filter = QueryFilter::default();
    let mut results = svo_nav::QueryResults::default();
    let closest = query.find_closest_reachable_node(origin, 500.0, &mut filter, &mut results);
    assert!(closest.is_valid());

    let mut filter = QueryFilter::default();
    let mut results = svo_nav::QueryResults::default();
    let (random_link, random_point) = query
        .find_random_reachable_point(origin, 500.0, &mut filter, &mut results)
        .expect("random reachable point");

    assert!(random_link.is_valid());
    let bounds = octree.bounds_for_link(random_link).unwrap();
    assert!(bounds.contains_point(random_point));
}

// ---------------------------------------------------------------------------
// Raycast behavior over built data
// ---------------------------------------------------------------------------

#[test]
fn raycast_against_built_wall() {
    let octree = wall_world();

    // Straight into the wall: hit before the segment ends.
    let hit = octree
        .raycast(Vec3::new(64.0, 128.0, 96.0), Vec3::new(448.0, 128.0, 96.0))
        .expect("wall hit");
    assert!(hit.time <= 1.0);
    assert!(hit.location.x < 448.0);
    assert!(hit.node.is_valid());

    // Over the top of the wall: clean crossing between tiles, one epsilon
    // nudge of open space is a miss.
    assert!(octree
        .raycast(Vec3::new(64.0, 128.0, 240.0), Vec3::new(448.0, 128.0, 240.0))
        .is_none());

    let p = Vec3::new(64.0, 128.0, 96.0);
    assert!(octree.raycast(p, p + Vec3::X * 0.5).is_none());
}

// ---------------------------------------------------------------------------
// Structure invariants over built data
// ---------------------------------------------------------------------------

#[test]
fn link_location_round_trips_on_built_tiles() {
    let octree = wall_world();

    // Sample points across both tiles: a valid link's bounds contain the
    // query point, and the bounds center resolves back to the same node.
    for x in (16..512).step_by(48) {
        for z in (16..256).step_by(48) {
            let p = Vec3::new(x as f32, 128.0, z as f32);

            let link = octree.link_for_location(p, true);
            if !link.is_valid() {
                continue;
            }

            let bounds = octree.bounds_for_link(link).expect("bounds");
            assert!(bounds.contains_point(p), "bounds of {link:?} must contain {p}");

            let again = octree.link_for_location(bounds.center(), true);
            assert_eq!(again, link);
        }
    }
}

#[test]
fn built_octree_serialization_round_trip() {
    let mut octree = wall_world();

    let bytes = octree.to_bytes();
    let restored = EditableSvo::from_bytes(&bytes).expect("load");

    assert_eq!(restored.num_tiles(), octree.num_tiles());
    restored.verify_node_data(true);

    // Queries behave identically on the restored octree.
    let start = Vec3::new(64.0, 128.0, 96.0);
    let end = Vec3::new(448.0, 128.0, 96.0);

    let mut filter = QueryFilter::default();
    let a = find_nav_path(octree.as_svo(), start, end, &mut filter, &NavPathOptions::default())
        .expect("path on original");

    let mut filter = QueryFilter::default();
    let b = find_nav_path(restored.as_svo(), start, end, &mut filter, &NavPathOptions::default())
        .expect("path on restored");

    assert_eq!(a.points.len(), b.points.len());
}

// ---------------------------------------------------------------------------
// Scenario 6: scheduler under pressure
// ---------------------------------------------------------------------------

#[test]
fn removal_after_build_keeps_structure_consistent() {
    let mut octree = wall_world();

    octree.remove_tile_at_coord(IVec3::new(1, 0, 0));
    assert_eq!(octree.num_tiles(), 1);
    octree.verify_node_data(true);

    // The surviving tile no longer links across the removed face.
    let tile = octree.tile_at_coord(IVec3::ZERO).unwrap();
    let link = octree.neighbor_link(tile.node_info(), svo_nav::Face::PosX);
    assert!(!link.is_valid());
}
