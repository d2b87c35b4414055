// src/query/path.rs
//
// Path queries over the octree: the A* derivative that terminates at a
// goal link, plus the location-level wrapper that resolves endpoints,
// reconstructs the corridor, and post-processes it.

use glam::Vec3;

use crate::svo::node::{Face, NodeLink};
use crate::svo::Svo;

use super::location::NodeQuery;
use super::postprocess;
use super::search::{search_nodes, SearchDriver, Visit};
use super::{PathPoint, PathQueryResults, QueryFilter, QueryStatus};

struct PathDriver {
    goal: NodeLink,
    cost_limit: f32,
}

impl SearchDriver for PathDriver {
    fn can_open_neighbor(&mut self, _face: Face, _link: NodeLink, f_cost: f32, _travel_dist_sq: f32) -> bool {
        !(self.cost_limit > 0.0 && f_cost > self.cost_limit)
    }

    fn on_node_visited(&mut self, link: NodeLink) -> Visit {
        if link == self.goal {
            Visit::StopAsBest
        } else {
            Visit::Continue
        }
    }
}

/// A* between two node links. On success the results carry the interior
/// portal points in forward order; callers prepend/append the exact
/// endpoints. A search that did not reach the goal reports
/// `PARTIAL_PATH` and ends at the best-heuristic node.
pub fn find_path(
    octree: &Svo,
    start: NodeLink,
    goal: NodeLink,
    cost_limit: f32,
    filter: &mut QueryFilter,
    results: &mut PathQueryResults,
) -> bool {
    if !start.is_valid() || !goal.is_valid() {
        results.base.status.insert(QueryStatus::FAILURE | QueryStatus::INVALID_PARAM);
        return false;
    }

    if start == goal {
        results.path_node_count = 1;
        results.base.status.insert(QueryStatus::SUCCESS);
        return true;
    }

    let mut driver = PathDriver { goal, cost_limit };
    let outcome = search_nodes(octree, start, goal, filter, &mut driver, &mut results.base);

    if !outcome.completed {
        return false;
    }

    let mut pool = outcome.pool;
    let Some(best_idx) = outcome.best else {
        results.base.status.insert(QueryStatus::FAILURE);
        return false;
    };

    if pool.get(best_idx).node_link != goal {
        results.base.status.insert(QueryStatus::PARTIAL_PATH);
    }

    results.path_cost = pool.get(best_idx).f_cost;
    results.path_length = pool.get(best_idx).travel_dist_sq.sqrt();

    // Reverse the parent chain in place so it runs start -> goal, counting
    // nodes as we go. A chain longer than the visitation limit means a
    // cycle.
    let node_limit = filter.max_search_nodes.saturating_mul(4);

    let mut prev: u32 = 0; // pool index + 1; 0 = none
    let mut cur = best_idx + 1;

    while cur != 0 {
        let node = pool.get_mut(cur - 1);
        let next = node.parent_idx;
        node.parent_idx = prev;

        prev = cur;
        cur = next;

        results.path_node_count += 1;
        if results.path_node_count >= node_limit {
            results.base.status.insert(QueryStatus::CYCLICAL_PATH);
            break;
        }
    }

    // Emit portal locations. `prev` is now the start node, which has no
    // portal, so begin at its successor.
    results.path_portal_points.reserve(results.path_node_count as usize);

    let mut cur = pool.get(prev - 1).parent_idx;
    while cur != 0 && (results.path_portal_points.len() as u32) < results.path_node_count {
        let node = pool.get(cur - 1);
        results.path_portal_points.push(PathPoint {
            location: node.portal_location,
            node: node.node_link,
        });
        cur = node.parent_idx;
    }

    true
}

/// Like [`find_path`] but only answers whether the goal was reached.
pub fn test_path(
    octree: &Svo,
    start: NodeLink,
    goal: NodeLink,
    cost_limit: f32,
    filter: &mut QueryFilter,
    results: &mut PathQueryResults,
) -> bool {
    if !start.is_valid() || !goal.is_valid() {
        results.base.status.insert(QueryStatus::FAILURE | QueryStatus::INVALID_PARAM);
        return false;
    }

    if start == goal {
        results.base.status.insert(QueryStatus::SUCCESS);
        return true;
    }

    let mut driver = PathDriver { goal, cost_limit };
    let outcome = search_nodes(octree, start, goal, filter, &mut driver, &mut results.base);

    if !outcome.completed {
        return false;
    }

    match outcome.best {
        Some(best_idx) => outcome.pool.get(best_idx).node_link == goal,
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Location-level pathfinding
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct NavPathOptions {
    pub cost_limit: f32,
    pub allow_partial_paths: bool,
    /// Greedy raycast shortcutting of the corridor.
    pub string_pull: bool,
    /// Catmull-Rom smoothing after the pull.
    pub smooth: bool,
    pub smoothing_alpha: f32,
    pub smoothing_iterations: u8,
    /// Half-extent of the closest-node search around each endpoint; zero
    /// means one tile's extent.
    pub query_extent: Vec3,
}

impl Default for NavPathOptions {
    fn default() -> Self {
        NavPathOptions {
            cost_limit: 0.0,
            allow_partial_paths: false,
            string_pull: true,
            smooth: false,
            smoothing_alpha: 0.5,
            smoothing_iterations: 3,
            query_extent: Vec3::ZERO,
        }
    }
}

pub struct NavPath {
    /// Ordered points from start to destination.
    pub points: Vec<PathPoint>,
    pub info: PathQueryResults,
    pub partial: bool,
}

/// Full path pipeline between two world locations: resolve each endpoint
/// to the closest open node, search, then clean up / pull / smooth per
/// the options.
pub fn find_nav_path(
    octree: &Svo,
    start_location: Vec3,
    end_location: Vec3,
    filter: &mut QueryFilter,
    options: &NavPathOptions,
) -> Result<NavPath, QueryStatus> {
    if !octree.is_valid() {
        return Err(QueryStatus::FAILURE | QueryStatus::INVALID_PARAM);
    }

    let query_extent = if options.query_extent == Vec3::ZERO {
        octree.config().tile_extent()
    } else {
        options.query_extent
    };

    let node_query = NodeQuery::new(octree, filter.max_search_nodes, query_extent);

    let mut start_point = start_location;
    let start_link = node_query.find_closest_node(start_location, Some(&mut start_point));
    if !start_link.is_valid() {
        return Err(QueryStatus::FAILURE);
    }

    let mut end_point = end_location;
    let end_link = node_query.find_closest_node(end_location, Some(&mut end_point));
    if !end_link.is_valid() {
        return Err(QueryStatus::FAILURE);
    }

    let mut info = PathQueryResults::default();
    if !find_path(octree, start_link, end_link, options.cost_limit, filter, &mut info) {
        return Err(info.base.status);
    }

    let partial = info.base.status.is_partial();
    if partial && !options.allow_partial_paths {
        return Err(info.base.status | QueryStatus::FAILURE);
    }

    let mut points = Vec::with_capacity(info.path_portal_points.len() + 2);
    points.push(PathPoint {
        location: start_point,
        node: start_link,
    });
    points.extend_from_slice(&info.path_portal_points);

    // A partial path ends wherever the search got to; only complete paths
    // gain the exact destination.
    if !partial {
        points.push(PathPoint {
            location: end_point,
            node: end_link,
        });
    }

    postprocess::clean_up_path(&mut points);

    if options.string_pull {
        postprocess::pull_path(octree, &mut points);
    }

    if options.smooth {
        postprocess::smooth_path(
            octree,
            &mut points,
            options.smoothing_alpha,
            options.smoothing_iterations,
        );
    }

    Ok(NavPath { points, info, partial })
}
