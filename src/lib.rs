// src/lib.rs
//
// Sparse voxel octree navigation for flying and swimming agents.
//
// The octree partitions space into fixed-size tiles of nodes addressed by
// Morton code, built by voxelizing triangle soup and dilating by the agent
// size. Queries (path, closest node, reachable sets, raycast) run over the
// linked structure; an asynchronous scheduler rebuilds dirty tiles on
// worker threads under per-frame budgets.

pub mod config;
pub mod gen;
pub mod geom;
pub mod morton;
pub mod query;
pub mod sched;
pub mod svo;

pub use config::{CellOffset, SvoConfig};
pub use gen::{GeneratorConfig, TileGenerator};
pub use geom::{Aabb, Blocker, GeometrySource, HalfSpace, Triangle};
pub use query::location::NodeQuery;
pub use query::path::{find_nav_path, find_path, test_path, NavPath, NavPathOptions};
pub use query::{PathPoint, PathQueryResults, QueryFilter, QueryResults, QueryStatus};
pub use sched::{
    generation_boost_mode, set_generation_boost_mode, BuildScheduler, DirtyArea, DirtyFlags,
    SchedulerConfig, SchedulerStats,
};
pub use svo::editable::EditableSvo;
pub use svo::node::{Face, Node, NodeLink, NodeState};
pub use svo::raycast::RaycastHit;
pub use svo::serialize::SerializeError;
pub use svo::tile::Tile;
pub use svo::Svo;
