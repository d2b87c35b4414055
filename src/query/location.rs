// src/query/location.rs
//
// Location-centric queries: closest open node around a point (a breadth
// walk over tiles, not an A*), and the reachable-node family built on the
// search core with distance limits, randomized costs, or a per-visit
// callback.

use std::collections::VecDeque;

use glam::Vec3;
use rand::Rng;

use crate::config::VOXELS_PER_LEAF;
use crate::geom::Aabb;
use crate::svo::node::{Face, Node, NodeLink, NodeState};
use crate::svo::Svo;

use super::search::{search_nodes, SearchDriver, TieBreak, Visit};
use super::{QueryFilter, QueryResults};

const PULL_IN_EPSILON: f32 = 0.01;

pub struct NodeQuery<'a> {
    octree: &'a Svo,
    max_search_nodes: u32,
    query_extent: Vec3,
}

impl<'a> NodeQuery<'a> {
    pub fn new(octree: &'a Svo, max_search_nodes: u32, query_extent: Vec3) -> Self {
        NodeQuery {
            octree,
            max_search_nodes,
            query_extent,
        }
    }

    /// Closest unblocked node to `origin` within the query extent. When
    /// the origin already sits in open space that node is returned
    /// directly; otherwise tiles around the origin are walked breadth-
    /// first, nearest tile first. `out_point` receives the closest point
    /// on the winning node, pulled slightly inward so it doesn't sit on
    /// the node's face.
    pub fn find_closest_node(&self, origin: Vec3, mut out_point: Option<&mut Vec3>) -> NodeLink {
        let octree = self.octree;

        if !octree.is_valid() {
            return NodeLink::INVALID;
        }

        let location_link = octree.link_for_location(origin, false);
        if location_link.is_valid() {
            if let Some(out) = out_point {
                *out = origin;
            }
            return location_link;
        }

        if self.max_search_nodes == 0 {
            return NodeLink::INVALID;
        }

        let query_bounds = Aabb::from_center_extent(origin, self.query_extent);

        struct Candidate<'n> {
            link: NodeLink,
            node: &'n Node,
            bounds: Aabb,
        }

        // Tiles in range, nearest center first.
        let mut tiles: Vec<Candidate> = Vec::new();
        octree.tiles_in_bounds(&query_bounds, |tile| {
            tiles.push(Candidate {
                link: tile.self_link(),
                node: tile.node_info(),
                bounds: octree.config().tile_bounds(tile.coord()),
            });
            (tiles.len() as u32) < self.max_search_nodes
        });

        if tiles.is_empty() {
            return NodeLink::INVALID;
        }

        tiles.sort_by(|a, b| {
            let da = a.bounds.center().distance_squared(origin);
            let db = b.bounds.center().distance_squared(origin);
            da.total_cmp(&db)
        });

        let mut queue: VecDeque<Candidate> = tiles.into();

        let mut best = NodeLink::INVALID;
        let mut best_dist_sq = f32::MAX;
        let mut searched = 0u32;

        let mut consider = |link: NodeLink, bounds: &Aabb, best: &mut NodeLink, best_dist_sq: &mut f32, out_point: &mut Option<&mut Vec3>| {
            let closest = bounds.closest_point(origin);
            let dist_sq = origin.distance_squared(closest);

            if dist_sq < *best_dist_sq {
                *best_dist_sq = dist_sq;
                *best = link;

                if let Some(out) = out_point.as_deref_mut() {
                    let inward = (bounds.center() - closest).normalize_or_zero();
                    *out = closest + inward * PULL_IN_EPSILON;
                }
            }
        };

        while let Some(candidate) = queue.pop_front() {
            if searched >= self.max_search_nodes {
                break;
            }
            searched += 1;

            match candidate.node.node_state() {
                NodeState::Open => {
                    consider(candidate.link, &candidate.bounds, &mut best, &mut best_dist_sq, &mut out_point);
                }
                NodeState::PartiallyBlocked if candidate.node.is_leaf() => {
                    let mut voxel_link = candidate.link;
                    for voxel_idx in 0..VOXELS_PER_LEAF {
                        if candidate.node.is_voxel_blocked(voxel_idx) {
                            continue;
                        }

                        voxel_link = voxel_link.with_voxel(voxel_idx);
                        if let Some(voxel_bounds) = octree.bounds_for_link(voxel_link) {
                            if query_bounds.intersects(&voxel_bounds) {
                                consider(voxel_link, &voxel_bounds, &mut best, &mut best_dist_sq, &mut out_point);
                            }
                        }
                    }
                }
                NodeState::PartiallyBlocked => {
                    for child_idx in 0..8u8 {
                        let child_link = candidate.node.child_link(child_idx);
                        let Some(child_node) = octree.node_from_link(child_link) else {
                            continue;
                        };

                        if child_node.node_state() == NodeState::Blocked {
                            continue;
                        }

                        let child_bounds = octree.bounds_for_node(child_node);
                        if query_bounds.intersects(&child_bounds) {
                            queue.push_back(Candidate {
                                link: child_link,
                                node: child_node,
                                bounds: child_bounds,
                            });
                        }
                    }
                }
                NodeState::Blocked => {}
            }
        }

        best
    }

    /// Closest point on the linked node's bounds to `origin`.
    pub fn closest_point_in_node(&self, link: NodeLink, origin: Vec3) -> Option<Vec3> {
        Some(self.octree.bounds_for_link(link)?.closest_point(origin))
    }

    /// Uniform random point inside the linked node's bounds.
    pub fn random_point_in_node(&self, link: NodeLink) -> Option<Vec3> {
        let bounds = self.octree.bounds_for_link(link)?;
        let mut rng = rand::thread_rng();

        Some(Vec3::new(
            rng.gen_range(bounds.min.x..=bounds.max.x),
            rng.gen_range(bounds.min.y..=bounds.max.y),
            rng.gen_range(bounds.min.z..=bounds.max.z),
        ))
    }

    /// Best reachable node from `origin` within a travel-distance limit.
    pub fn find_closest_reachable_node(
        &self,
        origin: Vec3,
        distance_limit: f32,
        filter: &mut QueryFilter,
        results: &mut QueryResults,
    ) -> NodeLink {
        let mut driver: ReachableDriver<fn(u64) -> bool> = ReachableDriver {
            distance_limit_sq: distance_limit * distance_limit,
            randomize_cost: false,
            visit: None,
        };

        self.run_reachable(origin, &mut driver, filter, results)
    }

    /// Random reachable node: the same walk with randomized heuristic and
    /// traversal costs, so the "best" node is an arbitrary reachable one.
    pub fn find_random_reachable_node(
        &self,
        origin: Vec3,
        distance_limit: f32,
        filter: &mut QueryFilter,
        results: &mut QueryResults,
    ) -> NodeLink {
        let mut driver: ReachableDriver<fn(u64) -> bool> = ReachableDriver {
            distance_limit_sq: distance_limit * distance_limit,
            randomize_cost: true,
            visit: None,
        };

        self.run_reachable(origin, &mut driver, filter, results)
    }

    /// Random reachable point: a random reachable node, then a uniform
    /// point inside it.
    pub fn find_random_reachable_point(
        &self,
        origin: Vec3,
        distance_limit: f32,
        filter: &mut QueryFilter,
        results: &mut QueryResults,
    ) -> Option<(NodeLink, Vec3)> {
        let link = self.find_random_reachable_node(origin, distance_limit, filter, results);
        if !link.is_valid() {
            return None;
        }

        let point = self.random_point_in_node(link)?;
        Some((link, point))
    }

    /// Visits every node reachable from `origin` within the distance
    /// limit. The callback receives each visited node's id; returning
    /// false stops the walk.
    pub fn search_reachable_nodes(
        &self,
        origin: Vec3,
        distance_limit: f32,
        visit: impl FnMut(u64) -> bool,
        filter: &mut QueryFilter,
        results: &mut QueryResults,
    ) -> bool {
        let mut driver = ReachableDriver {
            distance_limit_sq: distance_limit * distance_limit,
            randomize_cost: false,
            visit: Some(visit),
        };

        let start = self.find_closest_node(origin, None);
        if !start.is_valid() {
            return false;
        }

        search_nodes(self.octree, start, start, filter, &mut driver, results);
        results.status.is_success()
    }

    fn run_reachable<F: FnMut(u64) -> bool>(
        &self,
        origin: Vec3,
        driver: &mut ReachableDriver<F>,
        filter: &mut QueryFilter,
        results: &mut QueryResults,
    ) -> NodeLink {
        let start = self.find_closest_node(origin, None);
        if !start.is_valid() {
            return NodeLink::INVALID;
        }

        // The start doubles as the heuristic goal: best = nearest to the
        // origin among everything reached.
        let outcome = search_nodes(self.octree, start, start, filter, driver, results);
        if !outcome.completed {
            return NodeLink::INVALID;
        }

        match outcome.best {
            Some(idx) => outcome.pool.get(idx).node_link,
            None => NodeLink::INVALID,
        }
    }
}

struct ReachableDriver<F: FnMut(u64) -> bool> {
    distance_limit_sq: f32,
    randomize_cost: bool,
    visit: Option<F>,
}

impl<F: FnMut(u64) -> bool> SearchDriver for ReachableDriver<F> {
    fn heuristic_scale(&mut self, filter: &QueryFilter) -> f32 {
        if self.randomize_cost {
            rand::thread_rng().gen_range(0.0..100.0)
        } else {
            filter.heuristic_scale
        }
    }

    fn traversal_cost(
        &mut self,
        octree: &Svo,
        filter: &QueryFilter,
        from: NodeLink,
        to: NodeLink,
        portal: Vec3,
    ) -> f32 {
        if self.randomize_cost {
            rand::thread_rng().gen_range(0.0..100.0)
        } else {
            let _ = (from, portal);
            filter.base_traversal_cost
                * (1.0 - octree.resolution_for_link(to) / octree.config().tile_resolution())
        }
    }

    fn tie_break(&self) -> TieBreak {
        TieBreak::Nearest
    }

    fn can_open_neighbor(&mut self, _face: Face, _link: NodeLink, _f_cost: f32, travel_dist_sq: f32) -> bool {
        !(self.distance_limit_sq > 0.0 && travel_dist_sq > self.distance_limit_sq)
    }

    fn on_node_visited(&mut self, link: NodeLink) -> Visit {
        if let Some(visit) = self.visit.as_mut() {
            if !visit(link.id()) {
                return Visit::Stop;
            }
        }
        Visit::Continue
    }
}
