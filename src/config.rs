// src/config.rs
//
// Octree configuration and the coordinate conversions everything else is
// built on. A config is immutable once an octree is constructed; workers
// read it without synchronization.

use glam::{IVec3, Vec3};

use crate::geom::Aabb;
use crate::morton::{self, CoordBoxIter};

/// Number of voxels stored per leaf node.
pub const VOXELS_PER_LEAF: u8 = 64;
/// Extent of an octant split (2x2x2 children).
pub const OCTANT_GRID_EXTENT: i32 = 2;
/// Extent of the voxel grid inside a leaf node (4x4x4).
pub const VOXEL_GRID_EXTENT: i32 = 4;
/// Layer index of the leaf layer.
pub const LEAF_LAYER: u8 = 0;
/// Maximum number of layers per tile (8^6 = 262,144 total leaf slots).
pub const MAX_LAYERS: u8 = 6;
/// Maximum node index within a layer (8^6).
pub const MAX_NODES: u32 = 262_144;
/// Maximum node coordinate component within a tile at voxel resolution.
pub const MAX_NODE_COORD: i32 = 63;

/// Sentinel voxel index meaning "no voxel".
pub const NO_VOXEL: u8 = 0x7F;

/// Linear index (x + 4y + 16z) of a voxel coord inside a leaf.
#[inline]
pub fn voxel_index_for_coord(coord: IVec3) -> u8 {
    debug_assert!(is_voxel_coord_valid(coord));
    (coord.x + coord.y * VOXEL_GRID_EXTENT + coord.z * VOXEL_GRID_EXTENT * VOXEL_GRID_EXTENT) as u8
}

#[inline]
pub fn voxel_coord_from_index(index: u8) -> IVec3 {
    let i = index as i32;
    IVec3::new(i % 4, (i / 4) % 4, i / 16)
}

#[inline]
pub fn is_voxel_coord_valid(coord: IVec3) -> bool {
    coord.x >= 0
        && coord.x < VOXEL_GRID_EXTENT
        && coord.y >= 0
        && coord.y < VOXEL_GRID_EXTENT
        && coord.z >= 0
        && coord.z < VOXEL_GRID_EXTENT
}

/// Which point of a cell a coord-to-location conversion should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellOffset {
    Center,
    Min,
    Max,
}

#[derive(Clone, Debug)]
pub struct SvoConfig {
    // Location from which all tile coords are measured.
    seed_location: Vec3,
    // Edge length of a single voxel.
    voxel_size: f32,
    // Initial tile capacity; also the growth increment, or the hard cap when
    // fixed.
    tile_pool_size: u32,
    fixed_tile_pool_size: bool,
    // The octree layer treated as a tile (1..=5).
    tile_layer_idx: u8,

    // Derived
    num_nodes_per_tile: u32,
    tile_resolution: f32,
    leaf_resolution: f32,
}

impl SvoConfig {
    pub fn new(seed_location: Vec3, voxel_size: f32, tile_pool_size: u32, tile_layer_idx: u8) -> Self {
        debug_assert!(voxel_size > 0.0);

        let tile_layer_idx = tile_layer_idx.clamp(1, MAX_LAYERS - 1);

        // Total pool for one tile: every layer below the tile layer.
        let mut num_nodes_per_tile = 0u32;
        for layer in 0..tile_layer_idx {
            num_nodes_per_tile += 8u32.pow(layer as u32 + 1);
        }

        let tile_resolution = resolution_for_layer(tile_layer_idx, voxel_size);
        let leaf_resolution = resolution_for_layer(LEAF_LAYER, voxel_size);

        Self {
            seed_location,
            voxel_size,
            tile_pool_size,
            fixed_tile_pool_size: false,
            tile_layer_idx,
            num_nodes_per_tile,
            tile_resolution,
            leaf_resolution,
        }
    }

    /// Stored data built with an incompatible config must be rebuilt.
    pub fn is_compatible_with(&self, other: &SvoConfig) -> bool {
        self.seed_location == other.seed_location
            && self.voxel_size == other.voxel_size
            && self.tile_layer_idx == other.tile_layer_idx
    }

    #[inline]
    pub fn seed_location(&self) -> Vec3 {
        self.seed_location
    }

    #[inline]
    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    #[inline]
    pub fn voxel_extent(&self) -> Vec3 {
        Vec3::splat(self.voxel_size * 0.5)
    }

    #[inline]
    pub fn tile_pool_size(&self) -> u32 {
        self.tile_pool_size
    }

    pub fn set_tile_pool_size(&mut self, size: u32) {
        self.tile_pool_size = size;
    }

    #[inline]
    pub fn is_tile_pool_size_fixed(&self) -> bool {
        self.fixed_tile_pool_size
    }

    pub fn set_tile_pool_size_fixed(&mut self, fixed: bool) {
        self.fixed_tile_pool_size = fixed;
    }

    #[inline]
    pub fn tile_layer_idx(&self) -> u8 {
        self.tile_layer_idx
    }

    #[inline]
    pub fn num_nodes_per_tile(&self) -> u32 {
        self.num_nodes_per_tile
    }

    #[inline]
    pub fn tile_resolution(&self) -> f32 {
        self.tile_resolution
    }

    #[inline]
    pub fn tile_extent(&self) -> Vec3 {
        Vec3::splat(self.tile_resolution * 0.5)
    }

    #[inline]
    pub fn leaf_resolution(&self) -> f32 {
        self.leaf_resolution
    }

    #[inline]
    pub fn resolution_for_layer(&self, layer_idx: u8) -> f32 {
        resolution_for_layer(layer_idx, self.voxel_size)
    }

    /// Resolution one step below `layer_idx`, bottoming out at the voxel.
    #[inline]
    pub fn child_resolution_for_layer(&self, layer_idx: u8) -> f32 {
        if layer_idx == LEAF_LAYER {
            self.voxel_size
        } else {
            self.resolution_for_layer(layer_idx - 1)
        }
    }

    // -- coord conversions ---------------------------------------------------

    pub fn location_to_coord(&self, location: Vec3, resolution: f32) -> IVec3 {
        let rel = location - self.seed_location;

        // Floor before dividing so tiny offsets next to large magnitudes
        // don't pick up float error from the division.
        let rel = rel.floor();
        let coord = rel / resolution;

        IVec3::new(
            coord.x.floor() as i32,
            coord.y.floor() as i32,
            coord.z.floor() as i32,
        )
    }

    pub fn coord_to_location(&self, coord: IVec3, resolution: f32, offset: CellOffset) -> Vec3 {
        let mut location = self.seed_location + coord.as_vec3() * resolution;
        match offset {
            CellOffset::Center => location += Vec3::splat(resolution * 0.5),
            CellOffset::Max => location += Vec3::splat(resolution),
            CellOffset::Min => {}
        }
        location
    }

    #[inline]
    pub fn tile_coord_to_location(&self, coord: IVec3) -> Vec3 {
        self.coord_to_location(coord, self.tile_resolution, CellOffset::Center)
    }

    #[inline]
    pub fn tile_coord_for_location(&self, location: Vec3) -> IVec3 {
        self.location_to_coord(location, self.tile_resolution)
    }

    pub fn tile_bounds(&self, tile_coord: IVec3) -> Aabb {
        Aabb::from_center_extent(self.tile_coord_to_location(tile_coord), self.tile_extent())
    }

    /// Morton code of `location` at `resolution` relative to a tile's min
    /// corner.
    pub fn location_to_morton(&self, tile_min_location: Vec3, location: Vec3, resolution: f32) -> Option<u32> {
        let location_coord = self.location_to_coord(location, resolution);
        let min_coord = self.location_to_coord(tile_min_location, resolution);
        let rel = location_coord - min_coord;
        morton::is_valid_coord(rel).then(|| morton::coord_to_morton(rel))
    }

    /// Location of the cell a Morton code names, relative to a tile's min
    /// corner.
    pub fn morton_to_location(&self, tile_min_location: Vec3, code: u32, resolution: f32, offset: CellOffset) -> Vec3 {
        let coord = morton::morton_to_coord(code);
        tile_min_location
            + coord.as_vec3() * resolution
            + match offset {
                CellOffset::Center => Vec3::splat(resolution * 0.5),
                CellOffset::Max => Vec3::splat(resolution),
                CellOffset::Min => Vec3::ZERO,
            }
    }

    /// Location of the first child (octant 0) of a node at `node_location`.
    pub fn first_child_location(&self, node_location: Vec3, node_layer_idx: u8, offset: CellOffset) -> Vec3 {
        let node_resolution = self.resolution_for_layer(node_layer_idx);
        let mut out = node_location - Vec3::splat(node_resolution * 0.5);

        if offset != CellOffset::Min {
            let child_resolution = self.child_resolution_for_layer(node_layer_idx);
            if offset == CellOffset::Center {
                out += Vec3::splat(child_resolution * 0.5);
            } else {
                out += Vec3::splat(child_resolution);
            }
        }

        out
    }

    /// Center of a voxel inside a leaf whose center is `leaf_location`.
    pub fn voxel_location(&self, voxel_idx: u8, leaf_location: Vec3) -> Vec3 {
        let first = self.first_child_location(leaf_location, LEAF_LAYER, CellOffset::Center);
        first + voxel_coord_from_index(voxel_idx).as_vec3() * self.voxel_size
    }

    /// Inclusive coord range of the cells at `resolution` a bounds covers.
    ///
    /// A max bound lying exactly on a cell's min face names the cell below
    /// it, not the empty cell beyond.
    pub fn coords_for_bounds(&self, bounds: &Aabb, resolution: f32) -> (IVec3, IVec3) {
        let min_coord = self.location_to_coord(bounds.min, resolution);
        let mut max_coord = self.location_to_coord(bounds.max, resolution);

        if min_coord != max_coord {
            let max_cell_min = self.coord_to_location(max_coord, resolution, CellOffset::Min);

            for axis in 0..3 {
                if bounds.max[axis] <= max_cell_min[axis] && max_coord[axis] > min_coord[axis] {
                    max_coord[axis] -= 1;
                }
            }
        }

        debug_assert!(
            max_coord.x >= min_coord.x && max_coord.y >= min_coord.y && max_coord.z >= min_coord.z
        );

        (min_coord, max_coord)
    }

    pub fn tile_coords_for_bounds(&self, bounds: &Aabb) -> CoordBoxIter {
        let (min, max) = self.coords_for_bounds(bounds, self.tile_resolution);
        CoordBoxIter::new(min, max)
    }
}

/// Node edge length of a layer. A leaf holds a 4x4x4 voxel cube, so layer 0
/// spans four voxels; each layer above doubles.
#[inline]
pub fn resolution_for_layer(layer_idx: u8, voxel_size: f32) -> f32 {
    let layer0 = voxel_size * VOXEL_GRID_EXTENT as f32;
    if layer_idx == LEAF_LAYER {
        layer0
    } else {
        layer0 * (1u32 << layer_idx) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SvoConfig {
        SvoConfig::new(Vec3::ZERO, 32.0, 64, 1)
    }

    #[test]
    fn derived_values() {
        let cfg = config();
        assert_eq!(cfg.leaf_resolution(), 128.0);
        assert_eq!(cfg.tile_resolution(), 256.0);
        assert_eq!(cfg.num_nodes_per_tile(), 8);

        let cfg3 = SvoConfig::new(Vec3::ZERO, 32.0, 64, 3);
        assert_eq!(cfg3.tile_resolution(), 32.0 * 4.0 * 8.0);
        assert_eq!(cfg3.num_nodes_per_tile(), 8 + 64 + 512);
    }

    #[test]
    fn location_coord_round_trip() {
        let cfg = config();
        for coord in [IVec3::new(0, 0, 0), IVec3::new(3, -2, 7), IVec3::new(-1, -1, -1)] {
            let loc = cfg.coord_to_location(coord, cfg.tile_resolution(), CellOffset::Center);
            assert_eq!(cfg.location_to_coord(loc, cfg.tile_resolution()), coord);
        }
    }

    #[test]
    fn negative_locations_floor() {
        let cfg = config();
        assert_eq!(
            cfg.location_to_coord(Vec3::new(-1.0, -1.0, -1.0), cfg.tile_resolution()),
            IVec3::splat(-1)
        );
    }

    #[test]
    fn bounds_on_cell_edge_use_min_side() {
        let cfg = config();
        let res = cfg.tile_resolution();

        // Max at exactly the start of the next cell stays in the lower cell
        let bounds = Aabb::new(Vec3::ZERO, Vec3::splat(res));
        let (min, max) = cfg.coords_for_bounds(&bounds, res);
        assert_eq!(min, IVec3::ZERO);
        assert_eq!(max, IVec3::ZERO);
    }

    #[test]
    fn voxel_index_round_trip() {
        for i in 0..VOXELS_PER_LEAF {
            assert_eq!(voxel_index_for_coord(voxel_coord_from_index(i)), i);
        }
    }

    #[test]
    fn compatibility() {
        let a = config();
        let mut b = config();
        b.set_tile_pool_size(1024);
        assert!(a.is_compatible_with(&b));

        let c = SvoConfig::new(Vec3::ZERO, 16.0, 64, 1);
        assert!(!a.is_compatible_with(&c));
    }
}
