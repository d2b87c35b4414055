// src/geom.rs
//
// Small geometry kit shared by the octree, the tile generator, and the
// queries: AABBs, the slab ray test, triangle/blocker records, and the
// seam to the host engine's geometry.

use glam::{IVec3, Vec3};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn from_center_extent(center: Vec3, extent: Vec3) -> Self {
        Self {
            min: center - extent,
            max: center + extent,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    #[inline]
    pub fn volume(&self) -> f32 {
        let s = self.size();
        s.x * s.y * s.z
    }

    #[inline]
    pub fn expand_by(&self, amount: Vec3) -> Aabb {
        Aabb {
            min: self.min - amount,
            max: self.max + amount,
        }
    }

    #[inline]
    pub fn union_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    #[inline]
    pub fn union(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    #[inline]
    pub fn contains_point(&self, p: Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    #[inline]
    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Overlap test that ignores contacts where only a face is touching and
    /// nothing else. Tiles and inclusion volumes are laid out edge to edge,
    /// so a pure face contact must not count as an intersection.
    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        if self.min.x > other.max.x || other.min.x > self.max.x {
            return false;
        }
        if self.min.y > other.max.y || other.min.y > self.max.y {
            return false;
        }
        if self.min.z > other.max.z || other.min.z > self.max.z {
            return false;
        }

        if self.min.x == other.max.x || other.min.x == self.max.x {
            return false;
        }
        if self.min.y == other.max.y || other.min.y == self.max.y {
            return false;
        }
        if self.min.z == other.max.z || other.min.z == self.max.z {
            return false;
        }

        true
    }

    /// Intersection box. Only meaningful when an overlap test already passed.
    #[inline]
    pub fn overlap(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    #[inline]
    pub fn closest_point(&self, p: Vec3) -> Vec3 {
        p.clamp(self.min, self.max)
    }
}

#[inline]
pub fn aabb_intersects_any(test: &Aabb, bounds: &[Aabb]) -> bool {
    bounds.iter().any(|b| b.intersects(test))
}

#[inline]
pub fn aabbs_contain_aabb(bounds: &[Aabb], test: &Aabb) -> bool {
    bounds.iter().any(|b| b.contains_aabb(test))
}

/// Slab test returning both parameters along the ray direction.
///
/// https://tavianator.com/fast-branchless-raybounding-box-intersections-part-2-nans/
pub fn ray_aabb_intersect(origin: Vec3, dir: Vec3, aabb: &Aabb) -> Option<(f32, f32)> {
    let t1 = (aabb.min.x - origin.x) * (1.0 / dir.x);
    let t2 = (aabb.max.x - origin.x) * (1.0 / dir.x);

    let mut t_min = t1.min(t2);
    let mut t_max = t1.max(t2);

    for axis in 1..3 {
        if dir[axis] != 0.0 {
            let t1 = (aabb.min[axis] - origin[axis]) * (1.0 / dir[axis]);
            let t2 = (aabb.max[axis] - origin[axis]) * (1.0 / dir[axis]);

            t_min = t_min.max(t1.min(t2));
            t_max = t_max.min(t1.max(t2));
        }
    }

    (t_max > t_min.max(0.0)).then_some((t_min, t_max))
}

#[inline]
pub fn manhattan_distance(a: IVec3, b: IVec3) -> u32 {
    ((a.x - b.x).abs() + (a.y - b.y).abs() + (a.z - b.z).abs()) as u32
}

// ---------------------------------------------------------------------------
// Geometry source seam
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub struct Triangle {
    pub v0: Vec3,
    pub v1: Vec3,
    pub v2: Vec3,
}

impl Triangle {
    #[inline]
    pub fn bounds(&self) -> Aabb {
        Aabb {
            min: self.v0.min(self.v1).min(self.v2),
            max: self.v0.max(self.v1).max(self.v2),
        }
    }

    #[inline]
    pub fn is_finite(&self) -> bool {
        self.v0.is_finite() && self.v1.is_finite() && self.v2.is_finite()
    }
}

/// One half-space of a convex blocker volume. Points with
/// `normal.dot(p) <= distance` are inside.
#[derive(Clone, Copy, Debug)]
pub struct HalfSpace {
    pub normal: Vec3,
    pub distance: f32,
}

/// Convex volume treated as fully blocked, given as half-space planes.
#[derive(Clone, Debug)]
pub struct Blocker {
    pub planes: Vec<HalfSpace>,
    pub bounds: Aabb,
}

impl Blocker {
    #[inline]
    pub fn contains(&self, p: Vec3) -> bool {
        self.planes.iter().all(|h| h.normal.dot(p) <= h.distance)
    }
}

/// The engine-facing geometry collector. Vertices arrive already in octree
/// space; any instance transforms and coordinate conventions are the
/// collector's problem.
pub trait GeometrySource: Send + Sync {
    /// Every triangle whose AABB overlaps `bounds`.
    fn gather_triangles(&self, bounds: &Aabb, out: &mut Vec<Triangle>);

    /// Convex volumes that fully block navigation within `bounds`.
    fn gather_blockers(&self, bounds: &Aabb, out: &mut Vec<Blocker>) {
        let _ = (bounds, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_touching_boxes_do_not_intersect() {
        let a = Aabb::new(Vec3::ZERO, Vec3::splat(1.0));
        let b = Aabb::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));
        let c = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));

        assert!(!a.intersects(&b));
        assert!(a.intersects(&c));
        assert!(b.intersects(&c));
    }

    #[test]
    fn slab_test_hits_and_misses() {
        let aabb = Aabb::new(Vec3::splat(1.0), Vec3::splat(2.0));

        let (t_min, t_max) =
            ray_aabb_intersect(Vec3::new(0.0, 1.5, 1.5), Vec3::X, &aabb).expect("hit");
        assert!((t_min - 1.0).abs() < 1e-5);
        assert!((t_max - 2.0).abs() < 1e-5);

        assert!(ray_aabb_intersect(Vec3::new(0.0, 3.0, 1.5), Vec3::X, &aabb).is_none());

        // Ray pointing away
        assert!(ray_aabb_intersect(Vec3::new(0.0, 1.5, 1.5), -Vec3::X, &aabb).is_none());
    }

    #[test]
    fn blocker_half_spaces() {
        // Unit cube as six half-spaces
        let planes = vec![
            HalfSpace { normal: Vec3::X, distance: 1.0 },
            HalfSpace { normal: -Vec3::X, distance: 0.0 },
            HalfSpace { normal: Vec3::Y, distance: 1.0 },
            HalfSpace { normal: -Vec3::Y, distance: 0.0 },
            HalfSpace { normal: Vec3::Z, distance: 1.0 },
            HalfSpace { normal: -Vec3::Z, distance: 0.0 },
        ];
        let blocker = Blocker {
            planes,
            bounds: Aabb::new(Vec3::ZERO, Vec3::ONE),
        };

        assert!(blocker.contains(Vec3::splat(0.5)));
        assert!(!blocker.contains(Vec3::new(1.5, 0.5, 0.5)));
    }
}
