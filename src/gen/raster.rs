// src/gen/raster.rs
//
// Triangle and blocker rasterization into the voxel bit grid. Triangles
// are projected along the dominant axis of their normal and scan-converted
// in 2D; each covered cell contributes the depth range the triangle sweeps
// through it.

use glam::{IVec3, Vec3};

use crate::geom::{Blocker, Triangle};
use crate::gen::pad::VoxelGrid;

// Axis permutation that moves the dominant axis into Z, and its inverse.
#[inline]
fn swizzle(v: Vec3, dominant: usize) -> Vec3 {
    match dominant {
        0 => Vec3::new(v.y, v.z, v.x),
        1 => Vec3::new(v.z, v.x, v.y),
        _ => v,
    }
}

#[inline]
fn unswizzle_coord(c: IVec3, dominant: usize) -> IVec3 {
    match dominant {
        0 => IVec3::new(c.z, c.x, c.y),
        1 => IVec3::new(c.y, c.z, c.x),
        _ => c,
    }
}

/// 2D edge function; positive when `p` is on the left of a->b.
#[inline]
fn edge(a: Vec3, b: Vec3, px: f32, py: f32) -> f32 {
    (b.x - a.x) * (py - a.y) - (b.y - a.y) * (px - a.x)
}

/// Rasterizes one triangle, given in grid voxel space (1 unit = 1 voxel,
/// origin at grid voxel 0). Returns false for degenerate triangles, which
/// are skipped without failing the tile.
pub fn rasterize_triangle(tri_grid: &Triangle, grid: &mut VoxelGrid) -> bool {
    let v0 = tri_grid.v0;
    let v1 = tri_grid.v1;
    let v2 = tri_grid.v2;

    let normal = (v1 - v0).cross(v2 - v0);
    if !normal.is_finite() || normal.length_squared() < 1e-12 {
        return false;
    }

    let abs = normal.abs();
    let dominant = if abs.x >= abs.y && abs.x >= abs.z {
        0
    } else if abs.y >= abs.z {
        1
    } else {
        2
    };

    let s0 = swizzle(v0, dominant);
    let s1 = swizzle(v1, dominant);
    let s2 = swizzle(v2, dominant);
    let sn = swizzle(normal, dominant);

    // Plane in swizzled space: sn . p = plane_d, depth solved along Z.
    debug_assert!(sn.z != 0.0);
    let plane_d = sn.dot(s0);
    let inv_nz = 1.0 / sn.z;

    let n = grid.voxels_per_axis() as i32;

    let min_x = (s0.x.min(s1.x).min(s2.x).floor() as i32).max(0);
    let max_x = (s0.x.max(s1.x).max(s2.x).ceil() as i32 - 1).min(n - 1);
    let min_y = (s0.y.min(s1.y).min(s2.y).floor() as i32).max(0);
    let max_y = (s0.y.max(s1.y).max(s2.y).ceil() as i32 - 1).min(n - 1);

    if min_x > max_x || min_y > max_y {
        return true; // outside the grid, nothing to mark
    }

    let tri_min_z = s0.z.min(s1.z).min(s2.z);
    let tri_max_z = s0.z.max(s1.z).max(s2.z);

    // Winding sign so the edge tests work for both orientations.
    let area = edge(s0, s1, s2.x, s2.y);
    let sign = if area >= 0.0 { 1.0 } else { -1.0 };

    for cy in min_y..=max_y {
        for cx in min_x..=max_x {
            let x0 = cx as f32;
            let x1 = x0 + 1.0;
            let y0 = cy as f32;
            let y1 = y0 + 1.0;

            // Conservative cell/triangle overlap: a cell is out only when
            // all four corners are outside one edge.
            let mut outside = false;
            for (a, b) in [(s0, s1), (s1, s2), (s2, s0)] {
                if edge(a, b, x0, y0) * sign < 0.0
                    && edge(a, b, x1, y0) * sign < 0.0
                    && edge(a, b, x0, y1) * sign < 0.0
                    && edge(a, b, x1, y1) * sign < 0.0
                {
                    outside = true;
                    break;
                }
            }
            if outside {
                continue;
            }

            // Depth range the plane sweeps across this cell, clamped to the
            // triangle's own extent.
            let d00 = (plane_d - sn.x * x0 - sn.y * y0) * inv_nz;
            let d10 = (plane_d - sn.x * x1 - sn.y * y0) * inv_nz;
            let d01 = (plane_d - sn.x * x0 - sn.y * y1) * inv_nz;
            let d11 = (plane_d - sn.x * x1 - sn.y * y1) * inv_nz;

            let z_min = d00.min(d10).min(d01).min(d11).max(tri_min_z);
            let z_max = d00.max(d10).max(d01).max(d11).min(tri_max_z);

            let cz_min = (z_min.floor() as i32).max(0);
            let cz_max = (z_max.floor() as i32).min(n - 1);

            for cz in cz_min..=cz_max {
                let coord = unswizzle_coord(IVec3::new(cx, cy, cz), dominant);
                grid.set(coord);
            }
        }
    }

    true
}

/// Marks every voxel whose center lies inside the convex blocker. The
/// blocker is given in world space; `grid_min` and `voxel_size` map grid
/// coords back to world.
pub fn rasterize_blocker(
    blocker: &Blocker,
    grid_min: Vec3,
    voxel_size: f32,
    grid: &mut VoxelGrid,
) {
    let n = grid.voxels_per_axis() as i32;

    let to_cell = |w: f32, base: f32| ((w - base) / voxel_size).floor() as i32;

    let min = IVec3::new(
        to_cell(blocker.bounds.min.x, grid_min.x).max(0),
        to_cell(blocker.bounds.min.y, grid_min.y).max(0),
        to_cell(blocker.bounds.min.z, grid_min.z).max(0),
    );
    let max = IVec3::new(
        to_cell(blocker.bounds.max.x, grid_min.x).min(n - 1),
        to_cell(blocker.bounds.max.y, grid_min.y).min(n - 1),
        to_cell(blocker.bounds.max.z, grid_min.z).min(n - 1),
    );

    for z in min.z..=max.z {
        for y in min.y..=max.y {
            for x in min.x..=max.x {
                let center = grid_min + (Vec3::new(x as f32, y as f32, z as f32) + 0.5) * voxel_size;
                if blocker.contains(center) {
                    grid.set(IVec3::new(x, y, z));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::HalfSpace;

    #[test]
    fn axis_aligned_quad_fills_a_slab() {
        let mut grid = VoxelGrid::new(2); // 8^3 voxels

        // Two triangles forming a z=4 square across the whole grid
        let a = Triangle {
            v0: Vec3::new(0.0, 0.0, 4.5),
            v1: Vec3::new(8.0, 0.0, 4.5),
            v2: Vec3::new(8.0, 8.0, 4.5),
        };
        let b = Triangle {
            v0: Vec3::new(0.0, 0.0, 4.5),
            v1: Vec3::new(8.0, 8.0, 4.5),
            v2: Vec3::new(0.0, 8.0, 4.5),
        };

        assert!(rasterize_triangle(&a, &mut grid));
        assert!(rasterize_triangle(&b, &mut grid));

        for y in 0..8 {
            for x in 0..8 {
                assert!(grid.get(IVec3::new(x, y, 4)), "voxel ({x},{y},4)");
            }
        }
        // Nothing below or above the plane's voxel layer
        assert!(!grid.get(IVec3::new(4, 4, 2)));
        assert!(!grid.get(IVec3::new(4, 4, 6)));
    }

    #[test]
    fn degenerate_triangles_are_skipped() {
        let mut grid = VoxelGrid::new(1);

        let line = Triangle {
            v0: Vec3::ZERO,
            v1: Vec3::new(1.0, 1.0, 1.0),
            v2: Vec3::new(2.0, 2.0, 2.0),
        };
        assert!(!rasterize_triangle(&line, &mut grid));
        assert!(grid.is_empty());

        let nan = Triangle {
            v0: Vec3::new(f32::NAN, 0.0, 0.0),
            v1: Vec3::new(1.0, 0.0, 0.0),
            v2: Vec3::new(0.0, 1.0, 0.0),
        };
        assert!(!rasterize_triangle(&nan, &mut grid));
    }

    #[test]
    fn slanted_triangle_marks_swept_depth() {
        let mut grid = VoxelGrid::new(2);

        // A ramp spanning z 0..8 over x 0..8
        let tri = Triangle {
            v0: Vec3::new(0.0, 0.0, 0.0),
            v1: Vec3::new(8.0, 0.0, 8.0),
            v2: Vec3::new(0.0, 8.0, 0.0),
        };
        assert!(rasterize_triangle(&tri, &mut grid));

        // The diagonal cells must be filled
        assert!(grid.get(IVec3::new(0, 0, 0)));
        assert!(grid.get(IVec3::new(4, 0, 4)));
        // A cell far off the plane is not
        assert!(!grid.get(IVec3::new(0, 0, 7)));
    }

    #[test]
    fn blocker_fills_its_volume() {
        let mut grid = VoxelGrid::new(2);

        // World: voxel size 1, grid min at origin. Box spanning 2..6 per axis.
        let blocker = Blocker {
            planes: vec![
                HalfSpace { normal: Vec3::X, distance: 6.0 },
                HalfSpace { normal: -Vec3::X, distance: -2.0 },
                HalfSpace { normal: Vec3::Y, distance: 6.0 },
                HalfSpace { normal: -Vec3::Y, distance: -2.0 },
                HalfSpace { normal: Vec3::Z, distance: 6.0 },
                HalfSpace { normal: -Vec3::Z, distance: -2.0 },
            ],
            bounds: crate::geom::Aabb::new(Vec3::splat(2.0), Vec3::splat(6.0)),
        };

        rasterize_blocker(&blocker, Vec3::ZERO, 1.0, &mut grid);

        assert!(grid.get(IVec3::new(3, 3, 3)));
        assert!(grid.get(IVec3::new(5, 5, 5)));
        assert!(!grid.get(IVec3::new(1, 3, 3)));
        assert!(!grid.get(IVec3::new(6, 3, 3)));
    }
}
