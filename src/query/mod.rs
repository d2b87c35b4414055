// src/query/mod.rs
//
// Query surface shared by all search derivatives: the caller-facing
// filter, status bits, and result records.

pub mod location;
pub mod path;
pub mod postprocess;
pub mod search;

use glam::Vec3;

use crate::geom::Aabb;
use crate::svo::node::NodeLink;

// ---------------------------------------------------------------------------
// Status bits
// ---------------------------------------------------------------------------

/// Result flags. Queries never panic on bad input; they come back with
/// `FAILURE | INVALID_PARAM` style bits instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryStatus(pub u16);

impl QueryStatus {
    pub const SUCCESS: QueryStatus = QueryStatus(1 << 0);
    pub const FAILURE: QueryStatus = QueryStatus(1 << 1);
    pub const INVALID_PARAM: QueryStatus = QueryStatus(1 << 2);
    pub const OUT_OF_NODES: QueryStatus = QueryStatus(1 << 3);
    pub const OUT_OF_MEMORY: QueryStatus = QueryStatus(1 << 4);
    pub const PARTIAL_PATH: QueryStatus = QueryStatus(1 << 5);
    pub const CYCLICAL_PATH: QueryStatus = QueryStatus(1 << 6);

    #[inline]
    pub fn insert(&mut self, other: QueryStatus) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn contains(self, other: QueryStatus) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.contains(QueryStatus::SUCCESS)
    }

    #[inline]
    pub fn is_partial(self) -> bool {
        self.contains(QueryStatus::PARTIAL_PATH)
    }

    #[inline]
    pub fn ran_out_of_nodes(self) -> bool {
        self.contains(QueryStatus::OUT_OF_NODES)
    }
}

impl std::ops::BitOr for QueryStatus {
    type Output = QueryStatus;

    fn bitor(self, rhs: QueryStatus) -> QueryStatus {
        QueryStatus(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Per-query node-visited callback; returning false stops the search.
pub type NodeVisitedFn = Box<dyn FnMut(u64) -> bool>;

/// Caller-supplied query parameters: pool size, cost knobs, optional
/// portal constraint volumes, and an optional per-visit callback.
pub struct QueryFilter {
    pub max_search_nodes: u32,
    pub heuristic_scale: f32,
    pub base_traversal_cost: f32,
    /// Portal locations are constrained into these volumes when present.
    pub constraints: Vec<Aabb>,
    pub on_node_visited: Option<NodeVisitedFn>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        QueryFilter {
            max_search_nodes: 2048,
            heuristic_scale: 1.0,
            base_traversal_cost: 1.0,
            constraints: Vec::new(),
            on_node_visited: None,
        }
    }
}

impl QueryFilter {
    #[inline]
    pub fn has_constraints(&self) -> bool {
        !self.constraints.is_empty()
    }

    /// Clips `bounds` into the constraint set. Returns false when the
    /// result would be empty, which rejects the portal entirely.
    pub fn constrain_bounds(&self, bounds: &mut Aabb) -> bool {
        if self.constraints.is_empty() {
            return true;
        }

        for constraint in &self.constraints {
            if constraint.intersects(bounds) {
                *bounds = constraint.overlap(bounds);
                return true;
            }
        }

        false
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
pub struct QueryResults {
    pub status: QueryStatus,
    pub num_nodes_visited: u32,
    pub num_nodes_queried: u32,
    pub num_nodes_opened: u32,
    pub num_nodes_reopened: u32,
    pub mem_used: usize,
}

/// One point of a produced path.
#[derive(Clone, Copy, Debug)]
pub struct PathPoint {
    pub location: Vec3,
    pub node: NodeLink,
}

#[derive(Default)]
pub struct PathQueryResults {
    pub base: QueryResults,
    pub path_node_count: u32,
    pub path_length: f32,
    pub path_cost: f32,
    pub path_portal_points: Vec<PathPoint>,
}

impl std::ops::Deref for PathQueryResults {
    type Target = QueryResults;

    fn deref(&self) -> &QueryResults {
        &self.base
    }
}

impl std::ops::DerefMut for PathQueryResults {
    fn deref_mut(&mut self) -> &mut QueryResults {
        &mut self.base
    }
}
