// src/svo/raycast.rs
//
// Octree raycast. Tiles hit by the ray are walked in entry order; within a
// tile the walk descends into partially blocked nodes, advances across open
// ones, and climbs back up when it steps outside the current octant. Every
// iteration either descends, ascends, or moves the ray parameter forward by
// at least the epsilon, so the walk terminates.

use glam::Vec3;

use crate::config::{is_voxel_coord_valid, voxel_index_for_coord, NO_VOXEL};
use crate::geom::{ray_aabb_intersect, Aabb};
use crate::morton;
use crate::svo::node::{Face, NodeLink, NodeState, FACE_SELF, SIBLING_NEIGHBOR};
use crate::svo::Svo;

/// Push/pull margin for the slab tests, and the minimum forward progress
/// per step.
pub const RAYCAST_EPSILON: f32 = 0.01;

#[derive(Clone, Copy, Debug)]
pub struct RaycastHit {
    /// Normalized hit parameter in [0, 1] along start..end.
    pub time: f32,
    pub location: Vec3,
    pub node: NodeLink,
}

struct TileIntersection {
    min_t: f32,
    max_t: f32,
    min_location: Vec3,
    tile_link: NodeLink,
    tile_min_location: Vec3,
}

struct RayInfo {
    start: Vec3,
    segment: Vec3,
    dir: Vec3,
    length: f32,
}

enum Advance {
    Success,
    Done,
    Error,
}

impl Svo {
    /// First blocked node or voxel along the segment, or `None` when the
    /// ray passes through unobstructed.
    pub fn raycast(&self, ray_start: Vec3, ray_end: Vec3) -> Option<RaycastHit> {
        if !self.is_valid() {
            return None;
        }

        let segment = ray_end - ray_start;
        let length = segment.length();
        if length <= f32::EPSILON {
            return None;
        }
        let dir = segment / length;

        let mut ray_bounds = Aabb::EMPTY;
        ray_bounds.union_point(ray_start);
        ray_bounds.union_point(ray_end);

        // Collect every tile the ray passes through, with its slab range.
        let mut intersections: Vec<TileIntersection> = Vec::new();
        self.tiles_in_bounds(&ray_bounds, |tile| {
            let tile_bounds = self.config.tile_bounds(tile.coord());

            if let Some((min_t, max_t)) = ray_aabb_intersect(ray_start, dir, &tile_bounds) {
                // The slab test can return parameters outside the segment;
                // nudge and clamp them here.
                let min_t = (min_t + RAYCAST_EPSILON).max(RAYCAST_EPSILON);
                let max_t = (max_t - RAYCAST_EPSILON).clamp(RAYCAST_EPSILON, length);

                if max_t > 0.0 && (max_t - min_t) > RAYCAST_EPSILON {
                    intersections.push(TileIntersection {
                        min_t,
                        max_t,
                        min_location: ray_start + dir * min_t,
                        tile_link: tile.self_link(),
                        tile_min_location: tile_bounds.min,
                    });
                }
            }

            true
        });

        if intersections.is_empty() {
            return None;
        }

        intersections.sort_by(|a, b| a.min_t.total_cmp(&b.min_t));

        let info = RayInfo {
            start: ray_start,
            segment,
            dir,
            length,
        };

        for tile_intersection in &intersections {
            if let Some(hit) = self.raycast_tile(&info, tile_intersection) {
                return Some(hit);
            }
        }

        None
    }

    fn advance_ray(
        &self,
        link: NodeLink,
        info: &RayInfo,
        tile_max_t: f32,
        cur_t: &mut f32,
        cur_location: &mut Vec3,
    ) -> Advance {
        // Inflate the node bounds a little so edge and corner grazes still
        // register.
        let Some(bounds) = self.bounds_for_link(link) else {
            return Advance::Error;
        };
        let bounds = bounds.expand_by(Vec3::splat(RAYCAST_EPSILON));

        let intersect = ray_aabb_intersect(info.start, info.dir, &bounds);

        // Force the parameter forward by the epsilon regardless, so a
        // degenerate slab result cannot stall the walk.
        let node_max_t = intersect
            .map(|(_, max_t)| max_t)
            .unwrap_or(*cur_t)
            .clamp(*cur_t + RAYCAST_EPSILON, tile_max_t.max(*cur_t + RAYCAST_EPSILON));

        *cur_t = node_max_t;
        *cur_location = info.start + info.dir * *cur_t;

        if *cur_t >= tile_max_t || *cur_t >= info.length {
            return Advance::Done;
        }

        if intersect.is_none() {
            return Advance::Error;
        }

        Advance::Success
    }

    fn raycast_tile(&self, info: &RayInfo, tile_info: &TileIntersection) -> Option<RaycastHit> {
        let mut cur_t = tile_info.min_t;
        let mut cur_location = tile_info.min_location;
        let mut cur_link = tile_info.tile_link;

        let make_hit = |t: f32, link: NodeLink| -> RaycastHit {
            let time = t / info.length;
            RaycastHit {
                time,
                location: info.start + info.segment * time,
                node: link,
            }
        };

        while cur_link.is_valid() {
            // Out the far side of the tile; the next tile takes over.
            if cur_t >= tile_info.max_t {
                return None;
            }

            let node = self.node_from_link(cur_link)?;
            let tile = self.get_tile(cur_link.tile_id)?;
            let node_location = self.location_for_node(node, tile);
            let node_resolution = self.config.resolution_for_layer(cur_link.layer_idx());
            let node_morton = cur_link.node_idx();
            let node_sibling = morton::child_index(node_morton);

            if node.node_state() == NodeState::Blocked {
                return Some(make_hit(cur_t, cur_link));
            }

            let mut advance = node.node_state() == NodeState::Open;

            if node.node_state() == NodeState::PartiallyBlocked {
                if cur_link.is_leaf() {
                    let voxel_coord = self.relative_child_coord(cur_link, cur_location)?;

                    // Entering the leaf: resolve which voxel the ray is in.
                    // Once the link carries a voxel we are walking voxels.
                    if !cur_link.is_voxel() && is_voxel_coord_valid(voxel_coord) {
                        cur_link = cur_link.with_voxel(voxel_index_for_coord(voxel_coord));
                    }

                    if cur_link.is_voxel() {
                        if node.is_voxel_blocked(cur_link.voxel_idx()) {
                            return Some(make_hit(cur_t, cur_link));
                        }

                        match self.advance_ray(cur_link, info, tile_info.max_t, &mut cur_t, &mut cur_location) {
                            Advance::Done => return None,
                            Advance::Error => {
                                cur_link = node.parent_link();
                                continue;
                            }
                            Advance::Success => {}
                        }

                        let neighbor_voxel_coord = self.relative_child_coord(cur_link, cur_location)?;

                        // The advance pushed past the voxel's exit, so the
                        // coords must differ; if they don't, climb out and
                        // retry from the parent.
                        if neighbor_voxel_coord == voxel_coord {
                            cur_link = node.parent_link();
                            continue;
                        }

                        if is_voxel_coord_valid(neighbor_voxel_coord) {
                            cur_link = cur_link.with_voxel(voxel_index_for_coord(neighbor_voxel_coord));
                        } else {
                            // Left the leaf; continue at leaf scope and let
                            // the neighbor step below find the next node.
                            cur_link = cur_link.with_voxel(NO_VOXEL);
                            advance = true;
                        }
                    }
                } else {
                    // Descend: find which child the ray location names.
                    let child_resolution = self.config.child_resolution_for_layer(cur_link.layer_idx());
                    let child_morton = self.config.location_to_morton(
                        tile_info.tile_min_location,
                        cur_location,
                        child_resolution,
                    );

                    match child_morton {
                        Some(child_morton) if (child_morton >> 3) == node_morton => {
                            cur_link = node.child_link(morton::child_index(child_morton));
                        }
                        _ => {
                            // The location is not under this node; climb
                            // until some ancestor contains it.
                            cur_link = node.parent_link();
                        }
                    }
                }
            }

            if advance {
                match self.advance_ray(cur_link, info, tile_info.max_t, &mut cur_t, &mut cur_location) {
                    Advance::Done => return None,
                    Advance::Error => {
                        cur_link = node.parent_link();
                        continue;
                    }
                    Advance::Success => {}
                }

                let node_coord = self.config.location_to_coord(node_location, node_resolution);
                let neighbor_coord = self.config.location_to_coord(cur_location, node_resolution);

                // The advance guarantees forward progress, so a matching
                // coord means a degenerate step; climb out.
                if neighbor_coord == node_coord {
                    cur_link = node.parent_link();
                    continue;
                }

                // Stepping across tiles can leave the Morton base; no
                // further coords in this tile can be valid then.
                let min_tile_coord = self.config.location_to_coord(tile_info.tile_min_location, node_resolution);
                let neighbor_morton_coord = neighbor_coord - min_tile_coord;
                if !morton::is_valid_coord(neighbor_morton_coord) {
                    return None;
                }

                let neighbor_morton = morton::coord_to_morton(neighbor_morton_coord);

                let face_idx =
                    SIBLING_NEIGHBOR[node_sibling as usize][morton::child_index(neighbor_morton) as usize];

                if face_idx != FACE_SELF {
                    let mut face = Face::from_index(face_idx).unwrap();

                    // Crossing out of the octant flips which face of the
                    // sibling pattern we are looking through.
                    if !morton::are_siblings(node_morton, neighbor_morton) {
                        face = face.opposite();
                    }

                    cur_link = self.neighbor_link(node, face);
                } else {
                    // Diagonal step; not expressible as a face neighbor, so
                    // climb and let a coarser node take it.
                    cur_link = node.parent_link();
                }
            }
        }

        None
    }
}
