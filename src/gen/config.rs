// src/gen/config.rs
//
// Generation-time derivatives of the octree config: agent size in voxels,
// the power-of-two voxel grid a tile is rasterized into, and the Morton
// range of the grid leaves that actually belong to the tile.

use glam::{IVec3, Vec3};

use crate::config::{SvoConfig, VOXEL_GRID_EXTENT};
use crate::morton;

#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    svo: SvoConfig,

    /// Agent radius, in voxels, rounded up.
    pub agent_radius_voxels: u32,
    /// Agent half height, in voxels, rounded up.
    pub agent_half_height_voxels: u32,

    /// Leaves per grid axis, padding included; always a power of two so the
    /// grid's Morton codes are contiguous.
    pub num_leaf_nodes_per_axis: u32,
    /// Leaves per axis that are padding rather than tile content.
    pub num_padding_leaf_nodes_per_axis: u32,
    /// Grid leaf coord of the tile's first leaf, per axis.
    pub min_pad_leaf: u32,

    /// Morton codes of the grid leaves covering the unpadded tile.
    pub min_padded_leaf_code: u32,
    pub max_padded_leaf_code: u32,

    /// Dirty-area bounds are expanded by this so geometry in neighboring
    /// space still contributes padding to this tile.
    pub bounds_padding: Vec3,

    /// Gather geometry on the worker instead of the control thread.
    /// Limited to one concurrent worker.
    pub async_geometry_gathering: bool,
}

impl std::ops::Deref for GeneratorConfig {
    type Target = SvoConfig;

    #[inline]
    fn deref(&self) -> &SvoConfig {
        &self.svo
    }
}

impl GeneratorConfig {
    pub fn new(svo: SvoConfig, agent_radius: f32, agent_height: f32) -> Self {
        let voxel_size = svo.voxel_size();

        let agent_radius_voxels = (agent_radius / voxel_size).ceil().max(0.0) as u32;
        let agent_half_height_voxels = (agent_height * 0.5 / voxel_size).ceil().max(0.0) as u32;

        // Whichever axis needs the most padding decides, rounded up to a
        // whole leaf.
        let padding_voxels = agent_radius_voxels.max(agent_half_height_voxels);
        let min_padding_leaves = padding_voxels / VOXEL_GRID_EXTENT as u32 + 1;

        let actual_leaves_per_axis =
            (svo.tile_resolution() / svo.leaf_resolution()).round() as u32;

        // Wasteful when only one pad leaf per side is needed, but the Morton
        // range of the grid must be contiguous, hence power of two.
        let num_leaf_nodes_per_axis =
            (actual_leaves_per_axis + min_padding_leaves * 2).next_power_of_two();
        let num_padding_leaf_nodes_per_axis = num_leaf_nodes_per_axis - actual_leaves_per_axis;
        let min_pad_leaf = num_padding_leaf_nodes_per_axis / 2;

        let min_leaf = IVec3::splat(min_pad_leaf as i32);
        let max_leaf = IVec3::splat((min_pad_leaf + actual_leaves_per_axis - 1) as i32);

        let xy_padding = voxel_size * agent_radius_voxels as f32;
        let z_padding = voxel_size * agent_half_height_voxels as f32;

        Self {
            svo,
            agent_radius_voxels,
            agent_half_height_voxels,
            num_leaf_nodes_per_axis,
            num_padding_leaf_nodes_per_axis,
            min_pad_leaf,
            min_padded_leaf_code: morton::coord_to_morton(min_leaf),
            max_padded_leaf_code: morton::coord_to_morton(max_leaf),
            bounds_padding: Vec3::new(xy_padding, xy_padding, z_padding),
            async_geometry_gathering: false,
        }
    }

    #[inline]
    pub fn svo_config(&self) -> &SvoConfig {
        &self.svo
    }

    /// Leaves per axis covered by the tile itself.
    #[inline]
    pub fn actual_leaves_per_axis(&self) -> u32 {
        self.num_leaf_nodes_per_axis - self.num_padding_leaf_nodes_per_axis
    }

    /// Voxels per grid axis.
    #[inline]
    pub fn grid_voxels_per_axis(&self) -> u32 {
        self.num_leaf_nodes_per_axis * VOXEL_GRID_EXTENT as u32
    }

    /// World location of grid voxel (0, 0, 0) for a tile.
    pub fn grid_min_location(&self, tile_min: Vec3) -> Vec3 {
        tile_min - Vec3::splat(self.min_pad_leaf as f32 * self.svo.leaf_resolution())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_sizing_rounds_to_pow2() {
        let svo = SvoConfig::new(Vec3::ZERO, 32.0, 8, 3);
        // Tile layer 3 = 8 leaves per axis; radius 40 => 2 voxels => 1 pad
        // leaf per side => 10, rounded up to 16
        let cfg = GeneratorConfig::new(svo, 40.0, 40.0);

        assert_eq!(cfg.agent_radius_voxels, 2);
        assert_eq!(cfg.agent_half_height_voxels, 1);
        assert_eq!(cfg.actual_leaves_per_axis(), 8);
        assert_eq!(cfg.num_leaf_nodes_per_axis, 16);
        assert_eq!(cfg.min_pad_leaf, 4);
        assert_eq!(cfg.grid_voxels_per_axis(), 64);

        assert_eq!(
            morton::morton_to_coord(cfg.min_padded_leaf_code),
            IVec3::splat(4)
        );
        assert_eq!(
            morton::morton_to_coord(cfg.max_padded_leaf_code),
            IVec3::splat(11)
        );
    }

    #[test]
    fn padding_is_anisotropic() {
        let svo = SvoConfig::new(Vec3::ZERO, 32.0, 8, 1);
        let cfg = GeneratorConfig::new(svo, 64.0, 256.0);

        assert_eq!(cfg.agent_radius_voxels, 2);
        assert_eq!(cfg.agent_half_height_voxels, 4);
        assert_eq!(cfg.bounds_padding, Vec3::new(64.0, 64.0, 128.0));
    }
}
