// src/gen/mod.rs
//
// Tile generation: gather triangles for a batch of tiles, rasterize each
// tile into a voxel bit grid, dilate by the agent size, and collapse the
// grid into an octree tile. A generator is filled on the control thread
// and does its heavy work on a worker; it touches no shared mutable state.

pub mod config;
pub mod pad;
pub mod raster;

pub use config::GeneratorConfig;

use glam::{IVec3, Vec3};
use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::config::VOXEL_GRID_EXTENT;
use crate::geom::{Aabb, Blocker, GeometrySource, Triangle};
use crate::morton::{self, MortonRangeIter};
use crate::svo::node::NodeState;
use crate::svo::tile::{tile_id_for_coord, Tile};
use pad::{build_padding_offsets, leaf_bit_remap, pad_voxels, remap_leaf_word, PaddingOffset, VoxelGrid};

static DEGENERATE_WARNED: AtomicBool = AtomicBool::new(false);

/// Per-tile generation state.
struct TileGenData {
    tile_coord: IVec3,
    tile_min: Vec3,
    // Tile bounds clipped to inclusion volumes, expanded by the agent
    // padding; triangles are gathered from this box.
    gather_bounds: Aabb,
    // Inclusion-overlap regions of the tile, in tile-leaf coords. There
    // can be several when the tile straddles bounds.
    fill_leaf_boxes: Vec<(IVec3, IVec3)>,
    triangles: Vec<Triangle>,
    blockers: Vec<Blocker>,
    gather_deferred: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GeneratorStats {
    pub total_tris: u32,
    pub used_tris: u32,
    pub tiles_built: u32,
}

/// Builds octree tiles for a batch of tile coords. Filled incrementally
/// via [`TileGenerator::add_tile`], run once via [`TileGenerator::do_work`],
/// then drained with [`TileGenerator::next_generated_tile`].
pub struct TileGenerator {
    config: GeneratorConfig,
    geometry: Arc<dyn GeometrySource>,
    inclusion_bounds: Vec<Aabb>,

    tiles: Vec<TileGenData>,
    generated: VecDeque<Tile>,

    padding_offsets: Vec<PaddingOffset>,

    /// Ticks this generator has sat waiting for more tiles.
    pub pending_ticks: u32,
    /// Triangles buffered so far; the scheduler's soft cap reads this.
    pub tri_count: u32,

    pub stats: GeneratorStats,
}

impl TileGenerator {
    pub fn new(config: GeneratorConfig, geometry: Arc<dyn GeometrySource>, inclusion_bounds: Vec<Aabb>) -> Self {
        let padding_offsets =
            build_padding_offsets(config.agent_radius_voxels, config.agent_half_height_voxels);

        TileGenerator {
            config,
            geometry,
            inclusion_bounds,
            tiles: Vec::new(),
            generated: VecDeque::new(),
            padding_offsets,
            pending_ticks: 0,
            tri_count: 0,
            stats: GeneratorStats::default(),
        }
    }

    #[inline]
    pub fn has_tiles(&self) -> bool {
        !self.tiles.is_empty()
    }

    #[inline]
    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile_coords(&self) -> impl Iterator<Item = IVec3> + '_ {
        self.tiles.iter().map(|t| t.tile_coord)
    }

    pub fn contains_tile_in_bounds(&self, min_coord: IVec3, max_coord: IVec3) -> bool {
        self.tiles.iter().any(|t| {
            t.tile_coord.x >= min_coord.x
                && t.tile_coord.x <= max_coord.x
                && t.tile_coord.y >= min_coord.y
                && t.tile_coord.y <= max_coord.y
                && t.tile_coord.z >= min_coord.z
                && t.tile_coord.z <= max_coord.z
        })
    }

    /// Queues a tile for generation, gathering its geometry now (or on the
    /// worker when async gathering is on). Returns false when the tile has
    /// nothing to build, in which case the caller should remove any stale
    /// tile at that coord.
    pub fn add_tile(&mut self, tile_coord: IVec3) -> bool {
        let cfg = &self.config;
        let tile_bounds = cfg.tile_bounds(tile_coord);
        let tile_min = tile_bounds.min;

        // Clip against inclusion volumes; an empty inclusion set means
        // everything is navigable.
        let mut clipped = Aabb::EMPTY;
        let mut fill_leaf_boxes = Vec::new();

        if self.inclusion_bounds.is_empty() {
            clipped = tile_bounds;
            let max_leaf = cfg.actual_leaves_per_axis() as i32 - 1;
            fill_leaf_boxes.push((IVec3::ZERO, IVec3::splat(max_leaf)));
        } else {
            for bounds in &self.inclusion_bounds {
                if !bounds.intersects(&tile_bounds) {
                    continue;
                }

                let overlap = bounds.overlap(&tile_bounds);
                clipped.union(&overlap);
                fill_leaf_boxes.push(self.leaf_box_for_world(&overlap, tile_min));
            }

            if fill_leaf_boxes.is_empty() {
                return false;
            }
        }

        let gather_bounds = clipped.expand_by(cfg.bounds_padding);

        let mut data = TileGenData {
            tile_coord,
            tile_min,
            gather_bounds,
            fill_leaf_boxes,
            triangles: Vec::new(),
            blockers: Vec::new(),
            gather_deferred: cfg.async_geometry_gathering,
        };

        if !data.gather_deferred {
            self.gather_geometry(&mut data);

            if data.triangles.is_empty() && data.blockers.is_empty() {
                return false;
            }
        }

        self.tri_count += data.triangles.len() as u32;
        self.tiles.push(data);
        true
    }

    fn leaf_box_for_world(&self, world: &Aabb, tile_min: Vec3) -> (IVec3, IVec3) {
        let voxel = self.config.voxel_size();
        let max_voxel = self.config.actual_leaves_per_axis() as i32 * VOXEL_GRID_EXTENT - 1;

        let to_voxel = |w: Vec3| -> IVec3 {
            let rel = (w - tile_min) / voxel;
            IVec3::new(rel.x.floor() as i32, rel.y.floor() as i32, rel.z.floor() as i32)
        };

        let min = to_voxel(world.min).clamp(IVec3::ZERO, IVec3::splat(max_voxel));
        let max = (to_voxel(world.max) - IVec3::ONE)
            .max(min)
            .clamp(IVec3::ZERO, IVec3::splat(max_voxel));

        (min / VOXEL_GRID_EXTENT, max / VOXEL_GRID_EXTENT)
    }

    fn gather_geometry(&mut self, data: &mut TileGenData) {
        let mut raw: Vec<Triangle> = Vec::new();
        self.geometry.gather_triangles(&data.gather_bounds, &mut raw);
        self.stats.total_tris += raw.len() as u32;

        let gb = data.gather_bounds;

        // Cheap pre-SAT cull: drop triangles fully beyond one plane of the
        // gather box, along with anything non-finite.
        data.triangles = raw
            .into_par_iter()
            .filter(|tri| {
                if !tri.is_finite() {
                    if !DEGENERATE_WARNED.swap(true, Ordering::Relaxed) {
                        warn!("skipping triangle with non-finite coordinates");
                    }
                    return false;
                }

                for axis in 0..3 {
                    if (tri.v0[axis] < gb.min[axis]
                        && tri.v1[axis] < gb.min[axis]
                        && tri.v2[axis] < gb.min[axis])
                        || (tri.v0[axis] > gb.max[axis]
                            && tri.v1[axis] > gb.max[axis]
                            && tri.v2[axis] > gb.max[axis])
                    {
                        return false;
                    }
                }

                true
            })
            .collect();

        self.stats.used_tris += data.triangles.len() as u32;

        self.geometry.gather_blockers(&data.gather_bounds, &mut data.blockers);
    }

    /// Builds every queued tile. Runs on a worker thread; the only shared
    /// state it reads is the immutable config and the geometry source.
    pub fn do_work(&mut self, cancel: &AtomicBool) {
        let mut tiles = std::mem::take(&mut self.tiles);

        for data in &mut tiles {
            if cancel.load(Ordering::Relaxed) {
                break;
            }

            if data.gather_deferred {
                self.gather_geometry(data);
                self.tri_count += data.triangles.len() as u32;
            }

            let tile = self.build_tile(data, cancel);
            if let Some(tile) = tile {
                self.generated.push_back(tile);
                self.stats.tiles_built += 1;
            }
        }

        self.tiles = tiles;
    }

    /// Completed tiles, one at a time; `None` when the list is drained.
    pub fn next_generated_tile(&mut self) -> Option<Tile> {
        self.generated.pop_front()
    }

    #[inline]
    pub fn has_generated_tiles(&self) -> bool {
        !self.generated.is_empty()
    }

    // -- per-tile pipeline ----------------------------------------------------

    fn build_tile(&self, data: &TileGenData, cancel: &AtomicBool) -> Option<Tile> {
        let cfg = &self.config;
        let leaves = cfg.num_leaf_nodes_per_axis;
        let voxel_size = cfg.voxel_size();
        let grid_min = cfg.grid_min_location(data.tile_min);

        // Rasterize into the raw grid.
        let mut raw = VoxelGrid::new(leaves);

        for tri in &data.triangles {
            let tri_grid = Triangle {
                v0: (tri.v0 - grid_min) / voxel_size,
                v1: (tri.v1 - grid_min) / voxel_size,
                v2: (tri.v2 - grid_min) / voxel_size,
            };

            if !raster::rasterize_triangle(&tri_grid, &mut raw)
                && !DEGENERATE_WARNED.swap(true, Ordering::Relaxed)
            {
                warn!("skipping degenerate triangle during rasterization");
            }
        }

        for blocker in &data.blockers {
            raster::rasterize_blocker(blocker, grid_min, voxel_size, &mut raw);
        }

        if cancel.load(Ordering::Relaxed) {
            return None;
        }

        // Dilate by the agent stencil.
        let mut padded = VoxelGrid::new(leaves);
        pad_voxels(&raw, &self.padding_offsets, &mut padded);

        if cancel.load(Ordering::Relaxed) {
            return None;
        }

        Some(self.collapse_to_tile(data, &padded))
    }

    /// Reads leaf words out of the padded grid and folds them upward into
    /// the octree, materializing children only under partially blocked
    /// parents.
    fn collapse_to_tile(&self, data: &TileGenData, padded: &VoxelGrid) -> Tile {
        let cfg = &self.config;
        let tile_layer = cfg.tile_layer_idx();
        let actual = cfg.actual_leaves_per_axis();
        let num_leaves = (actual as usize).pow(3);
        let pad = IVec3::splat(cfg.min_pad_leaf as i32);

        let remap = leaf_bit_remap();
        let fill_boxes = &data.fill_leaf_boxes;

        // Leaf words in tile-local Morton order. The grid leaves covering
        // the unpadded tile span exactly [min_padded_leaf_code,
        // max_padded_leaf_code]; leaves outside every fill box have no data
        // and read as open space.
        let mut leaf_words = vec![0u64; num_leaves];

        for grid_code in MortonRangeIter::new(cfg.min_padded_leaf_code, cfg.max_padded_leaf_code) {
            let leaf_coord = morton::morton_to_coord(grid_code) - pad;

            let in_fill = fill_boxes.iter().any(|(min, max)| {
                leaf_coord.x >= min.x
                    && leaf_coord.x <= max.x
                    && leaf_coord.y >= min.y
                    && leaf_coord.y <= max.y
                    && leaf_coord.z >= min.z
                    && leaf_coord.z <= max.z
            });
            if !in_fill {
                continue;
            }

            let tile_code = morton::coord_to_morton(leaf_coord);
            leaf_words[tile_code as usize] = remap_leaf_word(padded.leaf_word(grid_code), &remap);
        }

        // Fold states upward layer by layer.
        let state_of_word = |w: u64| match w {
            0 => NodeState::Open,
            u64::MAX => NodeState::Blocked,
            _ => NodeState::PartiallyBlocked,
        };

        let mut states: Vec<Vec<NodeState>> = Vec::with_capacity(tile_layer as usize + 1);
        states.push(leaf_words.iter().map(|&w| state_of_word(w)).collect());

        for layer in 1..=tile_layer {
            let child_states = &states[layer as usize - 1];
            let num = 8usize.pow((tile_layer - layer) as u32);

            let folded: Vec<NodeState> = (0..num)
                .map(|idx| {
                    let children = &child_states[idx * 8..idx * 8 + 8];
                    if children.iter().all(|&s| s == NodeState::Open) {
                        NodeState::Open
                    } else if children.iter().all(|&s| s == NodeState::Blocked) {
                        NodeState::Blocked
                    } else {
                        NodeState::PartiallyBlocked
                    }
                })
                .collect();

            states.push(folded);
        }

        let root_state = states[tile_layer as usize][0];

        let mut tile = Tile::new(tile_id_for_coord(data.tile_coord), tile_layer, data.tile_coord);
        tile.node_info_mut().set_node_state(root_state);

        if root_state == NodeState::PartiallyBlocked {
            tile.allocate_nodes(cfg.num_nodes_per_tile(), tile_layer);
            Self::materialize_children(&mut tile, &states, &leaf_words, tile_layer, 0);
            tile.trim_excess_nodes();
        }

        tile
    }

    /// Creates all 8 children of a partially blocked node, recursing into
    /// the partial ones. Uniform children become childless open/blocked
    /// nodes, which is what keeps the tree sparse.
    fn materialize_children(
        tile: &mut Tile,
        states: &[Vec<NodeState>],
        leaf_words: &[u64],
        layer: u8,
        node_idx: u32,
    ) {
        for child in 0..8u32 {
            let child_layer = layer - 1;
            let child_idx = node_idx * 8 + child;
            let child_state = states[child_layer as usize][child_idx as usize];

            let (node, created) = tile
                .ensure_node_exists(child_layer, child_idx)
                .expect("child slot within pool");
            debug_assert!(created);

            if child_layer == crate::config::LEAF_LAYER {
                node.set_voxels(leaf_words[child_idx as usize]);
            } else {
                node.set_node_state(child_state);

                if child_state == NodeState::PartiallyBlocked {
                    Self::materialize_children(tile, states, leaf_words, child_layer, child_idx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SvoConfig;

    /// A floor quad at a configurable height, or nothing.
    struct FloorSource {
        z: f32,
        extent: f32,
    }

    impl GeometrySource for FloorSource {
        fn gather_triangles(&self, bounds: &Aabb, out: &mut Vec<Triangle>) {
            let e = self.extent;
            let quad = [
                Triangle {
                    v0: Vec3::new(-e, -e, self.z),
                    v1: Vec3::new(e, -e, self.z),
                    v2: Vec3::new(e, e, self.z),
                },
                Triangle {
                    v0: Vec3::new(-e, -e, self.z),
                    v1: Vec3::new(e, e, self.z),
                    v2: Vec3::new(-e, e, self.z),
                },
            ];
            for tri in quad {
                if tri.bounds().intersects(bounds) {
                    out.push(tri);
                }
            }
        }
    }

    struct EmptySource;

    impl GeometrySource for EmptySource {
        fn gather_triangles(&self, _bounds: &Aabb, _out: &mut Vec<Triangle>) {}
    }

    fn gen_config() -> GeneratorConfig {
        let svo = SvoConfig::new(Vec3::ZERO, 32.0, 8, 1);
        GeneratorConfig::new(svo, 32.0, 64.0)
    }

    #[test]
    fn empty_tile_is_rejected() {
        let cfg = gen_config();
        let mut generator = TileGenerator::new(cfg, Arc::new(EmptySource), Vec::new());

        assert!(!generator.add_tile(IVec3::ZERO));
        assert!(!generator.has_tiles());
    }

    #[test]
    fn tile_outside_inclusion_is_rejected() {
        let cfg = gen_config();
        let inclusion = vec![Aabb::new(Vec3::splat(10_000.0), Vec3::splat(11_000.0))];
        let mut generator =
            TileGenerator::new(cfg, Arc::new(FloorSource { z: 100.0, extent: 500.0 }), inclusion);

        assert!(!generator.add_tile(IVec3::ZERO));
    }

    #[test]
    fn floor_tile_builds_partially_blocked() {
        let cfg = gen_config();
        let mut generator = TileGenerator::new(
            cfg.clone(),
            Arc::new(FloorSource { z: 100.0, extent: 500.0 }),
            Vec::new(),
        );

        assert!(generator.add_tile(IVec3::ZERO));
        assert_eq!(generator.num_tiles(), 1);
        assert!(generator.tri_count > 0);

        let cancel = AtomicBool::new(false);
        generator.do_work(&cancel);

        let tile = generator.next_generated_tile().expect("tile");
        assert!(generator.next_generated_tile().is_none());

        assert_eq!(tile.coord(), IVec3::ZERO);
        assert_eq!(tile.node_info().node_state(), NodeState::PartiallyBlocked);
        assert!(tile.has_nodes_allocated());

        // Every partially blocked parent has all 8 children active.
        tile.verify();

        // The floor plane cuts through leaves, so some leaf data survived
        // the collapse.
        assert!(tile.num_nodes(0) > 0);
    }

    #[test]
    fn cancel_discards_remaining_tiles() {
        let cfg = gen_config();
        let mut generator = TileGenerator::new(
            cfg,
            Arc::new(FloorSource { z: 100.0, extent: 500.0 }),
            Vec::new(),
        );

        generator.add_tile(IVec3::ZERO);
        generator.add_tile(IVec3::new(1, 0, 0));

        let cancel = AtomicBool::new(true);
        generator.do_work(&cancel);

        assert!(generator.next_generated_tile().is_none());
    }
}
