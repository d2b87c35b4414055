// src/gen/pad.rs
//
// Voxel bit grid and agent-size dilation. The grid stores one u64 per
// leaf, bit index = Morton code of the voxel within its leaf, so a whole
// leaf's voxels read out as a single word and dilation can move between
// voxels with Morton adds instead of per-axis arithmetic.

use glam::IVec3;

use crate::morton::{coord_to_morton, morton_to_coord, morton_offset_code, offset_morton};

/// Cubic voxel bit grid addressed by Morton code.
pub struct VoxelGrid {
    words: Vec<u64>,
    voxels_per_axis: u32,
}

impl VoxelGrid {
    pub fn new(leaves_per_axis: u32) -> Self {
        debug_assert!(leaves_per_axis.is_power_of_two());
        let num_leaves = (leaves_per_axis as usize).pow(3);

        VoxelGrid {
            words: vec![0u64; num_leaves],
            voxels_per_axis: leaves_per_axis * 4,
        }
    }

    #[inline]
    pub fn voxels_per_axis(&self) -> u32 {
        self.voxels_per_axis
    }

    #[inline]
    pub fn in_bounds(&self, coord: IVec3) -> bool {
        let n = self.voxels_per_axis as i32;
        coord.x >= 0 && coord.x < n && coord.y >= 0 && coord.y < n && coord.z >= 0 && coord.z < n
    }

    #[inline]
    pub fn set(&mut self, coord: IVec3) {
        debug_assert!(self.in_bounds(coord));
        let code = coord_to_morton(coord);
        self.words[(code >> 6) as usize] |= 1u64 << (code & 63);
    }

    #[inline]
    pub fn get(&self, coord: IVec3) -> bool {
        debug_assert!(self.in_bounds(coord));
        let code = coord_to_morton(coord);
        (self.words[(code >> 6) as usize] >> (code & 63)) & 1 != 0
    }

    /// All 64 voxel bits of one grid leaf, in Morton bit order.
    #[inline]
    pub fn leaf_word(&self, leaf_code: u32) -> u64 {
        self.words[leaf_code as usize]
    }

    #[inline]
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }
}

/// Remap table from a leaf word in Morton bit order to the linear
/// (x + 4y + 16z) voxel order stored on leaf nodes.
pub fn leaf_bit_remap() -> [u8; 64] {
    let mut map = [0u8; 64];
    for (linear, slot) in map.iter_mut().enumerate() {
        let coord = crate::config::voxel_coord_from_index(linear as u8);
        *slot = coord_to_morton(coord) as u8;
    }
    map
}

/// Converts a Morton-ordered leaf word into linear voxel order.
#[inline]
pub fn remap_leaf_word(word: u64, map: &[u8; 64]) -> u64 {
    if word == 0 {
        return 0;
    }
    if word == u64::MAX {
        return u64::MAX;
    }

    let mut out = 0u64;
    for (linear, &morton_bit) in map.iter().enumerate() {
        out |= ((word >> morton_bit) & 1) << linear;
    }
    out
}

/// One entry of the dilation stencil: the coord offset (for the bounds
/// check) and its precomputed Morton offset code (for the add).
#[derive(Clone, Copy, Debug)]
pub struct PaddingOffset {
    pub delta: IVec3,
    pub code: u32,
}

/// Ellipsoidal stencil covering the agent: radius voxels in X/Y, half
/// height voxels in Z. Includes the zero offset so dilation preserves the
/// original voxel.
pub fn build_padding_offsets(radius_voxels: u32, half_height_voxels: u32) -> Vec<PaddingOffset> {
    let r = radius_voxels as i32;
    let h = half_height_voxels as i32;

    let r2 = (r * r).max(1) as f32;
    let h2 = (h * h).max(1) as f32;

    let mut offsets = Vec::new();

    for dz in -h..=h {
        for dy in -r..=r {
            for dx in -r..=r {
                let radial = (dx * dx + dy * dy) as f32 / r2;
                let vertical = (dz * dz) as f32 / h2;

                if radial + vertical <= 1.0 {
                    let delta = IVec3::new(dx, dy, dz);
                    offsets.push(PaddingOffset {
                        delta,
                        code: morton_offset_code(delta),
                    });
                }
            }
        }
    }

    offsets
}

/// Expands every blocked voxel of `input` by the stencil into `output`.
/// Offsets landing outside the grid are dropped rather than wrapped.
pub fn pad_voxels(input: &VoxelGrid, offsets: &[PaddingOffset], output: &mut VoxelGrid) {
    debug_assert_eq!(input.words.len(), output.words.len());

    let n = input.voxels_per_axis as i32;

    for (word_idx, &word) in input.words.iter().enumerate() {
        if word == 0 {
            continue;
        }

        let leaf_code = (word_idx as u32) << 6;
        let mut bits = word;

        while bits != 0 {
            let bit = bits.trailing_zeros();
            bits &= bits - 1;

            let code = leaf_code | bit;
            let coord = morton_to_coord(code);

            for off in offsets {
                let c = coord + off.delta;
                if c.x >= 0 && c.x < n && c.y >= 0 && c.y < n && c.z >= 0 && c.z < n {
                    let out_code = offset_morton(code, off.code);
                    output.words[(out_code >> 6) as usize] |= 1u64 << (out_code & 63);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_set_get() {
        let mut grid = VoxelGrid::new(2); // 8 voxels per axis
        assert_eq!(grid.voxels_per_axis(), 8);

        let c = IVec3::new(3, 5, 7);
        assert!(!grid.get(c));
        grid.set(c);
        assert!(grid.get(c));
        assert!(!grid.is_empty());
    }

    #[test]
    fn leaf_word_is_contiguous() {
        let mut grid = VoxelGrid::new(2);

        // Fill leaf (1, 0, 0) completely
        for z in 0..4 {
            for y in 0..4 {
                for x in 4..8 {
                    grid.set(IVec3::new(x, y, z));
                }
            }
        }

        let leaf_code = coord_to_morton(IVec3::new(1, 0, 0));
        assert_eq!(grid.leaf_word(leaf_code), u64::MAX);
        assert_eq!(grid.leaf_word(coord_to_morton(IVec3::ZERO)), 0);
    }

    #[test]
    fn remap_matches_linear_indexing() {
        let map = leaf_bit_remap();

        let mut grid = VoxelGrid::new(1);
        let coord = IVec3::new(2, 1, 3);
        grid.set(coord);

        let linear_word = remap_leaf_word(grid.leaf_word(0), &map);
        let linear_idx = crate::config::voxel_index_for_coord(coord);
        assert_eq!(linear_word, 1u64 << linear_idx);
    }

    #[test]
    fn stencil_shape() {
        let offsets = build_padding_offsets(1, 2);
        let deltas: Vec<IVec3> = offsets.iter().map(|o| o.delta).collect();

        assert!(deltas.contains(&IVec3::ZERO));
        assert!(deltas.contains(&IVec3::new(1, 0, 0)));
        assert!(deltas.contains(&IVec3::new(0, 0, 2)));
        // Corner of the bounding box is outside the ellipsoid
        assert!(!deltas.contains(&IVec3::new(1, 1, 2)));
    }

    #[test]
    fn dilation_expands_and_clips() {
        let mut input = VoxelGrid::new(2);
        input.set(IVec3::new(0, 4, 4));

        let offsets = build_padding_offsets(1, 1);
        let mut output = VoxelGrid::new(2);
        pad_voxels(&input, &offsets, &mut output);

        assert!(output.get(IVec3::new(0, 4, 4)));
        assert!(output.get(IVec3::new(1, 4, 4)));
        assert!(output.get(IVec3::new(0, 3, 4)));
        assert!(output.get(IVec3::new(0, 4, 5)));
        // (-1, 4, 4) is off-grid; nothing wrapped around to the far side
        assert!(!output.get(IVec3::new(7, 4, 4)));
    }
}
