// src/query/search.rs
//
// The shared A* core. Derivative queries (path, closest-reachable,
// random-reachable, reachable-set) plug in through the SearchDriver
// trait; the loop itself is monomorphized over the driver so the hot
// path pays no dynamic dispatch per node visit.
//
// Pool and open list follow the Detour shape: a fixed-capacity node pool
// with a closed-addressing hash over the link id, and a binary min-heap
// keyed on f-cost.

use glam::Vec3;

use crate::geom::{manhattan_distance, Aabb};
use crate::svo::node::{
    touching_neighbor_voxels, Face, Node, NodeLink, NodeState, ALL_FACES, CHILDREN_TOUCHING_FACE,
};
use crate::svo::Svo;

use super::{QueryFilter, QueryResults, QueryStatus};

const FLAG_OPEN: u8 = 1 << 0;
const FLAG_CLOSED: u8 = 1 << 1;

#[derive(Clone, Copy, Debug)]
pub(crate) struct SearchNode {
    pub node_link: NodeLink,
    /// Pool index + 1 of the node this one was reached from; 0 = none.
    pub parent_idx: u32,
    pub flags: u8,
    pub face: Face,
    pub f_cost: f32,
    pub g_cost: f32,
    pub heuristic: f32,
    pub portal_location: Vec3,
    pub travel_dist_sq: f32,
}

impl SearchNode {
    fn new(node_link: NodeLink) -> Self {
        SearchNode {
            node_link,
            parent_idx: 0,
            flags: 0,
            face: Face::PosX,
            f_cost: 0.0,
            g_cost: 0.0,
            heuristic: f32::MAX,
            portal_location: Vec3::ZERO,
            travel_dist_sq: 0.0,
        }
    }
}

const NO_INDEX: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Node pool
// ---------------------------------------------------------------------------

pub(crate) struct NodePool {
    nodes: Vec<SearchNode>,
    first: Vec<u32>,
    next: Vec<u32>,
    max_nodes: u32,
    hash_mask: u32,
}

#[inline]
fn hash_link(link: NodeLink) -> u32 {
    let mut id = link.id();

    id = id.wrapping_add(!(id << 31));
    id ^= id >> 20;
    id = id.wrapping_add(id << 6);
    id ^= id >> 12;
    id = id.wrapping_add(!(id << 22));
    id ^= id >> 32;

    id as u32
}

impl NodePool {
    pub fn new(max_nodes: u32) -> Self {
        let hash_size = (max_nodes / 4).next_power_of_two().max(1);

        NodePool {
            nodes: Vec::with_capacity(max_nodes as usize),
            first: vec![NO_INDEX; hash_size as usize],
            next: Vec::with_capacity(max_nodes as usize),
            max_nodes,
            hash_mask: hash_size - 1,
        }
    }

    #[inline]
    pub fn max_nodes(&self) -> u32 {
        self.max_nodes
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.nodes.len() as u32
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.next.clear();
        self.first.fill(NO_INDEX);
    }

    /// Allocates a fresh search node. Callers look up with [`find`] first;
    /// a duplicate insert makes the older entry unreachable.
    pub fn alloc(&mut self, link: NodeLink) -> Option<u32> {
        if self.count() >= self.max_nodes {
            return None;
        }

        let bucket = (hash_link(link) & self.hash_mask) as usize;
        let idx = self.nodes.len() as u32;

        self.nodes.push(SearchNode::new(link));
        self.next.push(self.first[bucket]);
        self.first[bucket] = idx;

        Some(idx)
    }

    pub fn find(&self, link: NodeLink) -> Option<u32> {
        let bucket = (hash_link(link) & self.hash_mask) as usize;
        let mut idx = self.first[bucket];

        while idx != NO_INDEX {
            if self.nodes[idx as usize].node_link == link {
                return Some(idx);
            }
            idx = self.next[idx as usize];
        }

        None
    }

    #[inline]
    pub fn get(&self, idx: u32) -> &SearchNode {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: u32) -> &mut SearchNode {
        &mut self.nodes[idx as usize]
    }

    pub fn mem_used(&self) -> usize {
        self.max_nodes as usize
            * (std::mem::size_of::<SearchNode>() + std::mem::size_of::<u32>())
            + self.first.len() * std::mem::size_of::<u32>()
    }
}

// ---------------------------------------------------------------------------
// Open list
// ---------------------------------------------------------------------------

pub(crate) struct OpenList {
    heap: Vec<u32>,
}

impl OpenList {
    pub fn new(capacity: u32) -> Self {
        OpenList {
            heap: Vec::with_capacity(capacity as usize),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn push(&mut self, pool: &NodePool, idx: u32) {
        self.heap.push(idx);
        self.bubble_up(pool, self.heap.len() - 1, idx);
    }

    pub fn pop(&mut self, pool: &NodePool) -> Option<u32> {
        let top = *self.heap.first()?;
        let last = self.heap.pop().unwrap();

        if !self.heap.is_empty() {
            self.trickle_down(pool, 0, last);
        }

        Some(top)
    }

    /// Re-sorts an entry whose cost decreased.
    pub fn modify(&mut self, pool: &NodePool, idx: u32) {
        if let Some(pos) = self.heap.iter().position(|&i| i == idx) {
            self.bubble_up(pool, pos, idx);
        }
    }

    fn bubble_up(&mut self, pool: &NodePool, mut pos: usize, idx: u32) {
        let cost = pool.get(idx).f_cost;

        while pos > 0 {
            let parent = (pos - 1) / 2;
            if pool.get(self.heap[parent]).f_cost > cost {
                self.heap[pos] = self.heap[parent];
                pos = parent;
            } else {
                break;
            }
        }

        self.heap[pos] = idx;
    }

    fn trickle_down(&mut self, pool: &NodePool, mut pos: usize, idx: u32) {
        let len = self.heap.len();
        let cost = pool.get(idx).f_cost;

        loop {
            let mut child = pos * 2 + 1;
            if child >= len {
                break;
            }
            if child + 1 < len
                && pool.get(self.heap[child]).f_cost > pool.get(self.heap[child + 1]).f_cost
            {
                child += 1;
            }
            if pool.get(self.heap[child]).f_cost < cost {
                self.heap[pos] = self.heap[child];
                pos = child;
            } else {
                break;
            }
        }

        self.heap[pos] = idx;
    }

    pub fn mem_used(&self) -> usize {
        self.heap.capacity() * std::mem::size_of::<u32>()
    }
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TieBreak {
    /// On equal f-cost prefer the lower g-cost.
    Nearest,
    /// On equal f-cost prefer the higher g-cost.
    Furthest,
}

pub(crate) enum Visit {
    Continue,
    Stop,
    /// Stop and promote the visited node to the best result.
    StopAsBest,
}

/// Capability hooks for a search derivative. Defaults give the plain path
/// behavior; overrides are monomorphized into the loop.
pub(crate) trait SearchDriver {
    fn heuristic_scale(&mut self, filter: &QueryFilter) -> f32 {
        filter.heuristic_scale
    }

    /// Cost of stepping into `to`. Uniform per step, scaled down for
    /// larger nodes so crossing open space isn't penalized by node count.
    fn traversal_cost(
        &mut self,
        octree: &Svo,
        filter: &QueryFilter,
        _from: NodeLink,
        to: NodeLink,
        _portal: Vec3,
    ) -> f32 {
        filter.base_traversal_cost
            * (1.0 - octree.resolution_for_link(to) / octree.config().tile_resolution())
    }

    fn tie_break(&self) -> TieBreak {
        TieBreak::Nearest
    }

    fn can_open_neighbor(
        &mut self,
        _face: Face,
        _link: NodeLink,
        _f_cost: f32,
        _travel_dist_sq: f32,
    ) -> bool {
        true
    }

    fn on_node_visited(&mut self, _link: NodeLink) -> Visit {
        Visit::Continue
    }

    fn on_open_neighbor(&mut self, _from: NodeLink, _to: NodeLink) {}
}

// ---------------------------------------------------------------------------
// Search loop
// ---------------------------------------------------------------------------

pub(crate) struct SearchOutcome {
    pub pool: NodePool,
    /// Pool index of the best node seen (lowest heuristic, or the node a
    /// driver promoted on stop).
    pub best: Option<u32>,
    pub completed: bool,
}

/// Manhattan heuristic in voxel units from the closest point of `link`'s
/// bounds to the goal center; stable across node sizes.
fn heuristic(octree: &Svo, scale: f32, link: NodeLink, goal: NodeLink) -> f32 {
    let voxel = octree.config().voxel_size();

    let (Some(from_bounds), Some(goal_bounds)) =
        (octree.bounds_for_link(link), octree.bounds_for_link(goal))
    else {
        return 0.0;
    };

    let goal_center = goal_bounds.center();
    let closest = from_bounds.closest_point(goal_center);

    let from_coord = octree.config().location_to_coord(closest, voxel);
    let goal_coord = octree.config().location_to_coord(goal_center, voxel);

    manhattan_distance(from_coord, goal_coord) as f32 * scale
}

/// Canonical entry point between two nodes: the center of the smaller of
/// the two faces, constrained to the filter's volumes.
fn portal_location(
    octree: &Svo,
    filter: &QueryFilter,
    from: NodeLink,
    to: NodeLink,
    face: Face,
) -> Option<Vec3> {
    let from_resolution = octree.resolution_for_link(from);
    let to_resolution = octree.resolution_for_link(to);

    // Use the smaller of the two nodes; flip the face when it's the
    // destination so we still name the shared boundary.
    let (link, resolution, face) = if from_resolution < to_resolution {
        (from, from_resolution, face)
    } else {
        (to, to_resolution, face.opposite())
    };

    let location = octree.location_for_link(link)?;
    let mut bounds = Aabb::from_center_extent(location, Vec3::splat(resolution * 0.5));

    if filter.has_constraints() && !filter.constrain_bounds(&mut bounds) {
        return None;
    }

    let axis = face as usize % 3;
    Some(bounds.center() + face.direction().as_vec3() * bounds.extent()[axis])
}

struct Expander<'a, D: SearchDriver> {
    octree: &'a Svo,
    driver: &'a mut D,
    filter: &'a QueryFilter,
    results: &'a mut QueryResults,
    pool: &'a mut NodePool,
    open: &'a mut OpenList,
    goal: NodeLink,
    best: &'a mut Option<u32>,
}

impl<D: SearchDriver> Expander<'_, D> {
    fn open_neighbors(&mut self, from_idx: u32) {
        let from_link = self.pool.get(from_idx).node_link;
        let Some(from_node) = self.octree.node_from_link(from_link) else {
            return;
        };

        for face in ALL_FACES {
            let (link, node) = self.octree.neighbor_of(from_node, from_link, face);
            if !link.is_valid() {
                continue;
            }
            let Some(node) = node else { continue };

            self.open_neighbor_node(from_idx, face, link, node);
        }
    }

    /// Routes one stored neighbor to the right expansion: direct open for
    /// uniform nodes and voxels, face-voxel enumeration for partial
    /// leaves, touching-children descent for partial interior nodes.
    fn open_neighbor_node(&mut self, from_idx: u32, face: Face, link: NodeLink, node: &Node) -> bool {
        if link.is_voxel() {
            if node.is_voxel_blocked(link.voxel_idx()) {
                return false;
            }
            return self.open_neighbor(from_idx, face, link);
        }

        match node.node_state() {
            NodeState::Blocked => false,
            NodeState::Open => self.open_neighbor(from_idx, face, link),
            NodeState::PartiallyBlocked => {
                if link.is_leaf() {
                    // Try every unblocked voxel on the face we touch.
                    let mut opened = false;
                    for &voxel_idx in touching_neighbor_voxels(face) {
                        if !node.is_voxel_blocked(voxel_idx) {
                            opened |= self.open_neighbor(from_idx, face, link.with_voxel(voxel_idx));
                        }
                    }
                    opened
                } else {
                    // Descend only into the 4 children on the touching face.
                    let mut opened = false;
                    for &child_idx in &CHILDREN_TOUCHING_FACE[face.opposite() as usize] {
                        let child_link = node.child_link(child_idx);
                        let Some(child_node) = self.octree.node_from_link(child_link) else {
                            debug_assert!(false, "partial node missing child");
                            continue;
                        };
                        opened |= self.open_neighbor_node(from_idx, face, child_link, child_node);
                    }
                    opened
                }
            }
        }
    }

    fn open_neighbor(&mut self, from_idx: u32, face: Face, to_link: NodeLink) -> bool {
        debug_assert!(to_link.is_valid());

        let from = *self.pool.get(from_idx);

        // Never step back onto ourselves or straight back to the node we
        // came from.
        if from.node_link == to_link {
            return false;
        }
        if from.parent_idx != 0 && self.pool.get(from.parent_idx - 1).node_link == to_link {
            return false;
        }

        let existing = self.pool.find(to_link);
        let (already_open, already_closed) = match existing {
            Some(idx) => {
                let flags = self.pool.get(idx).flags;
                ((flags & FLAG_OPEN) != 0, (flags & FLAG_CLOSED) != 0)
            }
            None => (false, false),
        };

        if already_closed {
            return false;
        }

        let Some(portal) = portal_location(self.octree, self.filter, from.node_link, to_link, face)
        else {
            return false;
        };

        let travel_dist_sq =
            from.travel_dist_sq + (portal - from.portal_location).length_squared();

        let scale = self.driver.heuristic_scale(self.filter);
        let h = heuristic(self.octree, scale, to_link, self.goal);
        let g = from.g_cost
            + self
                .driver
                .traversal_cost(self.octree, self.filter, from.node_link, to_link, portal);
        let f = g + h;

        // Keep whichever path into an already-open node wins; ties go to
        // the driver's preference.
        if already_open {
            let existing_node = self.pool.get(existing.unwrap());
            let cheaper = if existing_node.f_cost == f {
                match self.driver.tie_break() {
                    TieBreak::Nearest => g < existing_node.g_cost,
                    TieBreak::Furthest => g > existing_node.g_cost,
                }
            } else {
                existing_node.f_cost > f
            };

            if !cheaper {
                return false;
            }
        }

        if !self.driver.can_open_neighbor(face, to_link, f, travel_dist_sq) {
            return false;
        }

        let idx = match existing {
            Some(idx) => idx,
            None => match self.pool.alloc(to_link) {
                Some(idx) => idx,
                None => {
                    self.results.status.insert(QueryStatus::OUT_OF_NODES);
                    return false;
                }
            },
        };

        {
            let node = self.pool.get_mut(idx);
            node.parent_idx = from_idx + 1;
            node.f_cost = f;
            node.g_cost = g;
            node.heuristic = h;
            node.face = face;
            node.portal_location = portal;
            node.travel_dist_sq = travel_dist_sq;
            node.flags &= !FLAG_CLOSED;
        }

        if already_open {
            self.open.modify(self.pool, idx);
            self.results.num_nodes_reopened += 1;
        } else {
            self.pool.get_mut(idx).flags |= FLAG_OPEN;
            self.open.push(self.pool, idx);
            self.results.num_nodes_opened += 1;
        }

        // Lowest heuristic ever seen; this is the partial-path answer.
        let is_best = match *self.best {
            Some(best_idx) => self.pool.get(idx).heuristic < self.pool.get(best_idx).heuristic,
            None => true,
        };
        if is_best {
            *self.best = Some(idx);
        }

        self.results.num_nodes_queried = self.pool.count();

        self.driver.on_open_neighbor(from.node_link, to_link);

        true
    }
}

/// Runs the A* loop from `start` toward `goal` (the heuristic target; a
/// driver decides what actually terminates the search). Returns the pool
/// so callers can reconstruct paths from parent indices.
pub(crate) fn search_nodes<D: SearchDriver>(
    octree: &Svo,
    start: NodeLink,
    goal: NodeLink,
    filter: &mut QueryFilter,
    driver: &mut D,
    results: &mut QueryResults,
) -> SearchOutcome {
    let max_nodes = filter.max_search_nodes;
    let mut pool = NodePool::new(max_nodes);
    let mut open = OpenList::new(max_nodes);

    let failed = |pool: NodePool, status: QueryStatus, results: &mut QueryResults| {
        results.status.insert(status);
        SearchOutcome {
            pool,
            best: None,
            completed: false,
        }
    };

    results.mem_used = pool.mem_used() + open.mem_used();

    if max_nodes == 0 {
        return failed(pool, QueryStatus::FAILURE | QueryStatus::OUT_OF_MEMORY, results);
    }

    if !octree.is_valid() || !start.is_valid() {
        return failed(pool, QueryStatus::FAILURE | QueryStatus::INVALID_PARAM, results);
    }

    // Cycle failsafe for malformed neighbor graphs.
    let visit_limit = max_nodes.saturating_mul(4);

    let Some(start_idx) = pool.alloc(start) else {
        return failed(pool, QueryStatus::FAILURE, results);
    };
    {
        let start_node = pool.get_mut(start_idx);
        start_node.flags = FLAG_OPEN;
        start_node.heuristic = f32::MAX;
        // Travel distances accumulate between portals; anchor the chain at
        // the start node's center.
        start_node.portal_location = octree.location_for_link(start).unwrap_or(Vec3::ZERO);
    }

    let mut best = Some(start_idx);

    open.push(&pool, start_idx);

    while let Some(idx) = open.pop(&pool) {
        {
            let node = pool.get_mut(idx);
            node.flags &= !FLAG_OPEN;
            node.flags |= FLAG_CLOSED;
        }

        let link = pool.get(idx).node_link;

        match driver.on_node_visited(link) {
            Visit::Continue => {}
            Visit::Stop => break,
            Visit::StopAsBest => {
                best = Some(idx);
                break;
            }
        }

        if let Some(callback) = filter.on_node_visited.as_mut() {
            if !callback(link.id()) {
                break;
            }
        }

        {
            let mut expander = Expander {
                octree,
                driver: &mut *driver,
                filter: &*filter,
                results: &mut *results,
                pool: &mut pool,
                open: &mut open,
                goal,
                best: &mut best,
            };
            expander.open_neighbors(idx);
        }

        results.num_nodes_visited += 1;
        if results.num_nodes_visited == visit_limit {
            break;
        }
    }

    results.status.insert(QueryStatus::SUCCESS);

    SearchOutcome {
        pool,
        best,
        completed: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(i: u32) -> NodeLink {
        NodeLink::new(7, 1, i)
    }

    #[test]
    fn pool_alloc_and_find() {
        let mut pool = NodePool::new(4);

        assert!(pool.find(link(0)).is_none());

        let a = pool.alloc(link(0)).unwrap();
        let b = pool.alloc(link(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.find(link(0)), Some(a));
        assert_eq!(pool.find(link(1)), Some(b));
        assert_eq!(pool.count(), 2);

        pool.alloc(link(2)).unwrap();
        pool.alloc(link(3)).unwrap();
        assert!(pool.alloc(link(4)).is_none(), "capacity is hard");

        pool.clear();
        assert_eq!(pool.count(), 0);
        assert!(pool.find(link(0)).is_none());
    }

    #[test]
    fn open_list_pops_min_f_cost() {
        let mut pool = NodePool::new(8);
        let mut open = OpenList::new(8);

        let costs = [5.0, 1.0, 3.0, 4.0, 2.0];
        for (i, &cost) in costs.iter().enumerate() {
            let idx = pool.alloc(link(i as u32)).unwrap();
            pool.get_mut(idx).f_cost = cost;
            open.push(&pool, idx);
        }

        let mut popped = Vec::new();
        while let Some(idx) = open.pop(&pool) {
            popped.push(pool.get(idx).f_cost);
        }

        assert_eq!(popped, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn open_list_modify_resorts() {
        let mut pool = NodePool::new(8);
        let mut open = OpenList::new(8);

        let a = pool.alloc(link(0)).unwrap();
        pool.get_mut(a).f_cost = 10.0;
        open.push(&pool, a);

        let b = pool.alloc(link(1)).unwrap();
        pool.get_mut(b).f_cost = 5.0;
        open.push(&pool, b);

        // a's cost drops below b's
        pool.get_mut(a).f_cost = 1.0;
        open.modify(&pool, a);

        assert_eq!(open.pop(&pool), Some(a));
        assert_eq!(open.pop(&pool), Some(b));
    }
}
