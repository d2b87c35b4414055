// src/svo/mod.rs
//
// Sparse voxel octree, read path. Tiles are keyed by a hash of their
// coord; within a tile, nodes are addressed by (layer, Morton index).
//
// Construction references:
//   Schwarz/Seidel, "Fast Parallel Surface and Solid Voxelization on GPUs"
//   Zhou et al., "Data-Parallel Octrees for Surface Reconstruction"
//
// Morton octant order (right-handed, +Z up):
//
//     4-------5     Z
//    /|      /|     |
//   / |     / |     |
//  6-------7  |     o----- X
//  |  0----|--1    /
//  | /     | /    Y
//  2-------3

pub mod editable;
pub mod node;
pub mod raycast;
pub mod serialize;
pub mod tile;

use glam::{IVec3, Vec3};
use rustc_hash::FxHashMap as HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use crate::config::{
    is_voxel_coord_valid, voxel_index_for_coord, CellOffset, SvoConfig, OCTANT_GRID_EXTENT,
};
use crate::geom::Aabb;
use node::{
    neighbor_voxel_index, Face, Node, NodeLink, NodeState, ALL_FACES, CHILDREN_TOUCHING_FACE,
    CHILD_NEIGHBOR_SIBLING, CHILD_TO_PARENT_FACE, FACE_SELF,
};
use tile::{tile_id_for_coord, Tile};

static TILE_POOL_WARNED: AtomicBool = AtomicBool::new(false);

pub struct Svo {
    pub(crate) config: SvoConfig,
    pub(crate) tiles: HashMap<u32, Tile>,
    pub(crate) max_tiles: u32,
}

impl Svo {
    pub fn new(config: SvoConfig) -> Self {
        let max_tiles = config.tile_pool_size();
        let tiles = HashMap::with_capacity_and_hasher(max_tiles as usize, Default::default());

        Svo {
            config,
            tiles,
            max_tiles,
        }
    }

    /// Destroys all data within the octree.
    pub fn reset(&mut self) {
        self.tiles.clear();
    }

    /// An octree with no tiles has not been generated.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.tiles.is_empty()
    }

    #[inline]
    pub fn config(&self) -> &SvoConfig {
        &self.config
    }

    #[inline]
    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    #[inline]
    pub fn max_tiles(&self) -> u32 {
        self.max_tiles
    }

    pub fn tiles(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    /// Union of all active tile bounds.
    pub fn bounds(&self) -> Aabb {
        let mut out = Aabb::EMPTY;
        for tile in self.tiles.values() {
            out.union(&self.config.tile_bounds(tile.coord()));
        }
        out
    }

    // -- tile lookup ----------------------------------------------------------

    #[inline]
    pub fn get_tile(&self, tile_id: u32) -> Option<&Tile> {
        self.tiles.get(&tile_id)
    }

    #[inline]
    pub fn get_tile_mut(&mut self, tile_id: u32) -> Option<&mut Tile> {
        self.tiles.get_mut(&tile_id)
    }

    #[inline]
    pub fn tile_at_coord(&self, coord: IVec3) -> Option<&Tile> {
        self.get_tile(tile_id_for_coord(coord))
    }

    #[inline]
    pub fn has_tile_at_coord(&self, coord: IVec3) -> bool {
        self.tile_at_coord(coord).is_some()
    }

    #[inline]
    pub fn tile_at_location(&self, location: Vec3) -> Option<&Tile> {
        self.tile_at_coord(self.config.tile_coord_for_location(location))
    }

    #[inline]
    pub fn tile_link_at_coord(&self, coord: IVec3) -> NodeLink {
        NodeLink::new(tile_id_for_coord(coord), self.config.tile_layer_idx(), 0)
    }

    #[inline]
    pub fn tile_link_at_location(&self, location: Vec3) -> NodeLink {
        self.tile_link_at_coord(self.config.tile_coord_for_location(location))
    }

    #[inline]
    pub fn contains_location(&self, location: Vec3) -> bool {
        self.tile_at_location(location).is_some()
    }

    /// Calls `f` for each active tile in `bounds`; stop by returning false.
    /// The tile references outlive the call, so callers may collect them.
    pub fn tiles_in_bounds<'a>(&'a self, bounds: &Aabb, mut f: impl FnMut(&'a Tile) -> bool) {
        if !self.is_valid() {
            return;
        }

        for coord in self.config.tile_coords_for_bounds(bounds) {
            if let Some(tile) = self.tile_at_coord(coord) {
                if !f(tile) {
                    return;
                }
            }
        }
    }

    /// Coords of active tiles overlapping any of the given bounds.
    pub fn tile_coords(&self, bounds_list: &[Aabb]) -> Vec<IVec3> {
        let mut out = Vec::new();

        if !self.is_valid() {
            return out;
        }

        for bounds in bounds_list {
            for coord in self.config.tile_coords_for_bounds(bounds) {
                if self.has_tile_at_coord(coord) {
                    out.push(coord);
                }
            }
        }

        out
    }

    // -- node lookup ----------------------------------------------------------

    pub fn node_from_link(&self, link: NodeLink) -> Option<&Node> {
        if !link.is_valid() {
            return None;
        }

        let tile = self.get_tile(link.tile_id)?;

        let found = if link.layer_idx() == self.config.tile_layer_idx() {
            Some(tile.node_info())
        } else {
            tile.get_node(link.layer_idx(), link.node_idx(), true)
        };

        if let Some(node) = found {
            // Voxel bits are irrelevant during node lookup.
            debug_assert_eq!(
                node.self_link().id() | node::LINK_VOXEL_MASK,
                link.id() | node::LINK_VOXEL_MASK
            );
        }

        found
    }

    pub(crate) fn node_from_link_mut(&mut self, link: NodeLink) -> Option<&mut Node> {
        if !link.is_valid() {
            return None;
        }

        let tile_layer = self.config.tile_layer_idx();
        let tile = self.tiles.get_mut(&link.tile_id)?;

        if link.layer_idx() == tile_layer {
            Some(tile.node_info_mut())
        } else {
            tile.get_node_mut(link.layer_idx(), link.node_idx(), true)
        }
    }

    // -- locations and bounds -------------------------------------------------

    /// Center of a node. Self links never carry a voxel index, so this is
    /// always the whole node's center.
    pub(crate) fn location_for_node(&self, node: &Node, tile: &Tile) -> Vec3 {
        let link = node.self_link();
        let tile_bounds = self.config.tile_bounds(tile.coord());

        self.config.morton_to_location(
            tile_bounds.min,
            link.node_idx(),
            self.config.resolution_for_layer(link.layer_idx()),
            CellOffset::Center,
        )
    }

    #[inline]
    pub fn resolution_for_link(&self, link: NodeLink) -> f32 {
        if link.is_voxel() {
            self.config.voxel_size()
        } else {
            self.config.resolution_for_layer(link.layer_idx())
        }
    }

    pub fn location_for_link(&self, link: NodeLink) -> Option<Vec3> {
        if !link.is_valid() {
            return None;
        }

        let tile = self.get_tile(link.tile_id)?;

        if link.layer_idx() == self.config.tile_layer_idx() {
            return Some(self.config.tile_coord_to_location(tile.coord()));
        }

        let node = tile.get_node(link.layer_idx(), link.node_idx(), true)?;
        let mut location = self.location_for_node(node, tile);

        if link.is_voxel() {
            location = self.config.voxel_location(link.voxel_idx(), location);
        }

        Some(location)
    }

    pub fn bounds_for_link(&self, link: NodeLink) -> Option<Aabb> {
        let location = self.location_for_link(link)?;
        let resolution = self.resolution_for_link(link);
        Some(Aabb::from_center_extent(location, Vec3::splat(resolution * 0.5)))
    }

    pub fn bounds_for_node(&self, node: &Node) -> Aabb {
        let link = node.self_link();
        let tile = self.get_tile(link.tile_id).expect("node without tile");
        let location = self.location_for_node(node, tile);
        let resolution = self.config.resolution_for_layer(link.layer_idx());
        Aabb::from_center_extent(location, Vec3::splat(resolution * 0.5))
    }

    /// Location of the first child of the linked node. For voxel links the
    /// first sibling voxel's location is returned instead.
    pub(crate) fn first_child_location(&self, link: NodeLink, offset: CellOffset) -> Option<Vec3> {
        let link = link.with_voxel(crate::config::NO_VOXEL);
        let node_location = self.location_for_link(link)?;
        Some(self.config.first_child_location(node_location, link.layer_idx(), offset))
    }

    /// Coord of `location` relative to the linked node's first child, at
    /// child resolution. May be out of child range; callers handle that.
    pub(crate) fn relative_child_coord(&self, link: NodeLink, location: Vec3) -> Option<IVec3> {
        let first_child = self.first_child_location(link, CellOffset::Center)?;
        let child_resolution = self.config.child_resolution_for_layer(link.layer_idx());

        let first_coord = self.config.location_to_coord(first_child, child_resolution);
        let location_coord = self.config.location_to_coord(location, child_resolution);

        Some(location_coord - first_coord)
    }

    // -- link for location ----------------------------------------------------

    /// Highest-resolution unblocked node containing `location`, or invalid.
    /// With `allow_blocked`, blocked nodes/voxels are returned instead of
    /// invalid.
    pub fn link_for_location(&self, location: Vec3, allow_blocked: bool) -> NodeLink {
        if !self.is_valid() {
            return NodeLink::INVALID;
        }

        let tile_link = self.tile_link_at_location(location);
        let Some(tile) = self.get_tile(tile_link.tile_id) else {
            return NodeLink::INVALID;
        };

        let mut cur_link = tile_link;
        let tile_layer = self.config.tile_layer_idx();

        while cur_link.is_valid() {
            let cur_node = if cur_link.layer_idx() == tile_layer {
                tile.node_info()
            } else {
                match tile.get_node(cur_link.layer_idx(), cur_link.node_idx(), true) {
                    Some(n) => n,
                    None => {
                        warn!(
                            tile_id = cur_link.tile_id,
                            layer = cur_link.layer_idx(),
                            node_idx = cur_link.node_idx(),
                            "link_for_location: node lookup failed"
                        );
                        return NodeLink::INVALID;
                    }
                }
            };

            debug_assert_eq!(cur_node.self_link(), cur_link.with_voxel(crate::config::NO_VOXEL));

            if cur_link.is_leaf() {
                return match cur_node.node_state() {
                    NodeState::Open => cur_node.self_link(),
                    NodeState::Blocked => {
                        if allow_blocked {
                            cur_node.self_link()
                        } else {
                            NodeLink::INVALID
                        }
                    }
                    NodeState::PartiallyBlocked => {
                        let Some(mut voxel_coord) = self.relative_child_coord(cur_link, location)
                        else {
                            return NodeLink::INVALID;
                        };

                        // Float error right on a leaf face can put us one
                        // voxel negative; never by more than one.
                        if !is_voxel_coord_valid(voxel_coord) {
                            if voxel_coord.x < 0 {
                                voxel_coord.x += 1;
                            }
                            if voxel_coord.y < 0 {
                                voxel_coord.y += 1;
                            }
                            if voxel_coord.z < 0 {
                                voxel_coord.z += 1;
                            }
                            debug_assert!(is_voxel_coord_valid(voxel_coord));
                            if !is_voxel_coord_valid(voxel_coord) {
                                return NodeLink::INVALID;
                            }
                        }

                        let voxel_link = cur_link.with_voxel(voxel_index_for_coord(voxel_coord));
                        if !cur_node.is_voxel_blocked(voxel_link.voxel_idx()) || allow_blocked {
                            voxel_link
                        } else {
                            NodeLink::INVALID
                        }
                    }
                };
            }

            match cur_node.node_state() {
                NodeState::PartiallyBlocked => {
                    let Some(child_coord) = self.relative_child_coord(cur_link, location) else {
                        return NodeLink::INVALID;
                    };

                    let in_range = child_coord.x >= 0
                        && child_coord.x < OCTANT_GRID_EXTENT
                        && child_coord.y >= 0
                        && child_coord.y < OCTANT_GRID_EXTENT
                        && child_coord.z >= 0
                        && child_coord.z < OCTANT_GRID_EXTENT;
                    if !in_range {
                        return NodeLink::INVALID;
                    }

                    let child_idx =
                        (child_coord.x + child_coord.y * 2 + child_coord.z * 4) as u8;
                    cur_link = cur_node.child_link(child_idx);
                }
                NodeState::Open => return cur_link,
                NodeState::Blocked => {
                    return if allow_blocked { cur_link } else { NodeLink::INVALID };
                }
            }
        }

        NodeLink::INVALID
    }

    // -- neighbor resolution --------------------------------------------------

    /// Full neighbor link of a node across `face`, reconstructing the
    /// neighbor's tile id from this tile's coord.
    pub fn neighbor_link(&self, node: &Node, face: Face) -> NodeLink {
        let Some(tile) = self.get_tile(node.self_link().tile_id) else {
            return NodeLink::INVALID;
        };
        node.neighbor_link(tile.coord(), face, tile_id_for_coord)
    }

    /// Neighbor of `node_link` across `face`, including voxel-level
    /// stepping inside and across leaves. Returns the neighbor link and its
    /// node (the leaf node for voxel links).
    pub fn neighbor_of<'a>(
        &'a self,
        node: &'a Node,
        node_link: NodeLink,
        face: Face,
    ) -> (NodeLink, Option<&'a Node>) {
        if node_link.is_voxel() {
            let voxel_coord =
                crate::config::voxel_coord_from_index(node_link.voxel_idx()) + face.direction();

            if is_voxel_coord_valid(voxel_coord) {
                // Neighbor voxel is inside the same leaf.
                let link = node_link.with_voxel(voxel_index_for_coord(voxel_coord));
                return (link, Some(node));
            }
        }

        // Crossing the node's face; use the stored neighbor.
        let mut link = self.neighbor_link(node, face);
        let neighbor = self.node_from_link(link);

        // Voxel-to-voxel across a leaf boundary: name the complement voxel
        // when the neighbor leaf is only partially blocked; a uniform leaf
        // is already the highest resolution.
        if node_link.is_voxel() {
            if let Some(neighbor) = neighbor {
                if link.is_leaf() && neighbor.node_state() == NodeState::PartiallyBlocked {
                    link = link.with_voxel(neighbor_voxel_index(node_link.voxel_idx(), face));
                }
            }
        }

        (link, neighbor)
    }

    // -- neighbor linking (build/finalize path) -------------------------------

    /// Computes and stores the neighbor link of one node across one face
    /// using the fixed child tables. Does not touch the back link.
    pub(crate) fn link_neighbor_for_node(&mut self, node_link: NodeLink, face: Face) {
        let tile_layer = self.config.tile_layer_idx();

        if node_link.layer_idx() == tile_layer {
            // Tiles link straight to the tile next door; there is nothing
            // coarser to fall back to.
            let Some(tile) = self.get_tile(node_link.tile_id) else {
                return;
            };
            let neighbor_coord = tile.coord() + face.direction();
            let neighbor_link = self.tile_link_at_coord(neighbor_coord);

            let new_link = if self.get_tile(neighbor_link.tile_id).is_some() {
                neighbor_link
            } else {
                NodeLink::INVALID
            };

            if let Some(tile) = self.get_tile_mut(node_link.tile_id) {
                tile.node_info_mut().set_neighbor_link(face, new_link);
            }
            return;
        }

        let sibling_idx = (node_link.node_idx() % 8) as usize;
        let parent_face = CHILD_TO_PARENT_FACE[sibling_idx][face as usize];
        let neighbor_sibling = CHILD_NEIGHBOR_SIBLING[sibling_idx][face as usize];

        let new_link = if parent_face == FACE_SELF {
            // The neighbor is a sibling in the same octant.
            NodeLink::new(
                node_link.tile_id,
                node_link.layer_idx(),
                (node_link.node_idx() & !7) | neighbor_sibling as u32,
            )
        } else {
            // The neighbor lies across the parent's face. The parent was
            // linked before us (coarse-first ordering), so its slot is
            // authoritative.
            let parent_link = node_link.parent();

            match self.node_from_link(parent_link) {
                Some(parent_node) => {
                    let parent_face = Face::from_index(parent_face).unwrap();
                    let parent_neighbor_link = self.neighbor_link(parent_node, parent_face);

                    if parent_neighbor_link.is_valid() {
                        match self.node_from_link(parent_neighbor_link) {
                            Some(parent_neighbor) if parent_neighbor.has_children() => {
                                parent_neighbor_link.child(neighbor_sibling)
                            }
                            // Coarser neighbor; link to it directly.
                            Some(_) => parent_neighbor_link,
                            None => {
                                debug_assert!(false, "parent neighbor link names no node");
                                NodeLink::INVALID
                            }
                        }
                    } else {
                        NodeLink::INVALID
                    }
                }
                None => NodeLink::INVALID,
            }
        };

        if let Some(node) = self.node_from_link_mut(node_link) {
            node.set_neighbor_link(face, new_link);
        }
    }

    /// Links one face for a node and recurses into the children touching
    /// that face.
    pub(crate) fn link_neighbor_for_node_hierarchically(&mut self, node_link: NodeLink, face: Face) {
        let Some(node) = self.node_from_link(node_link) else {
            return;
        };
        if !node.is_active() {
            return;
        }
        let has_children = node.has_children();

        self.link_neighbor_for_node(node_link, face);

        if has_children {
            for &child_idx in &CHILDREN_TOUCHING_FACE[face as usize] {
                self.link_neighbor_for_node_hierarchically(node_link.child(child_idx), face);
            }
        }
    }

    /// Links every face of a node hierarchically. With `invalid_only`, only
    /// faces whose current link is invalid are recomputed.
    pub(crate) fn link_neighbors_for_node_hierarchically(&mut self, node_link: NodeLink, invalid_only: bool) {
        for face in ALL_FACES {
            let needs_link = if invalid_only {
                match self.node_from_link(node_link) {
                    Some(node) => !self.neighbor_link(node, face).is_valid(),
                    None => false,
                }
            } else {
                true
            };

            if needs_link {
                self.link_neighbor_for_node_hierarchically(node_link, face);
            }
        }
    }

    // -- tile management (shared with the editable octree) --------------------

    /// Returns the tile at `coord`, creating it if necessary. Fails only
    /// when the pool is full and fixed. When the pool is growable it grows
    /// by `tile_pool_size` increments and never shrinks.
    pub(crate) fn ensure_tile_at_coord(&mut self, coord: IVec3) -> Option<&mut Tile> {
        let tile_id = tile_id_for_coord(coord);

        if !self.tiles.contains_key(&tile_id) {
            if self.tiles.len() as u32 == self.max_tiles {
                if !self.config.is_tile_pool_size_fixed() {
                    self.max_tiles += self.config.tile_pool_size();
                    self.tiles.reserve(self.config.tile_pool_size() as usize);
                } else {
                    if !TILE_POOL_WARNED.swap(true, Ordering::Relaxed) {
                        warn!("ensure_tile_at_coord: out of tiles, refusing new tile");
                    }
                    return None;
                }
            }

            let tile = Tile::new(tile_id, self.config.tile_layer_idx(), coord);
            debug_assert!(!tile.node_info().has_children());
            self.tiles.insert(tile_id, tile);
        }

        self.tiles.get_mut(&tile_id)
    }

    pub(crate) fn release_tile_by_link(&mut self, link: NodeLink) {
        if let Some(tile) = self.tiles.get_mut(&link.tile_id) {
            tile.reset();
            self.tiles.remove(&link.tile_id);
        }
    }

    // -- verification ----------------------------------------------------------

    /// Walks every tile's structure; with `verify_external_links` the
    /// mutual-consistency of cross-tile neighbor links is checked too.
    /// Everything here is debug-assert based and free in release builds.
    pub fn verify_node_data(&self, verify_external_links: bool) {
        debug_assert!(self.tiles.len() as u32 <= self.max_tiles);

        for tile in self.tiles.values() {
            tile.verify();
            debug_assert_eq!(tile_id_for_coord(tile.coord()), tile.id());

            if cfg!(debug_assertions) {
                self.verify_tile_neighbors(tile, verify_external_links);
            }
        }
    }

    fn verify_tile_neighbors(&self, tile: &Tile, external: bool) {
        let tile_layer = self.config.tile_layer_idx();

        for layer_idx in (0..tile_layer).rev() {
            for node in tile.nodes_for_layer(layer_idx) {
                for face in ALL_FACES {
                    self.verify_neighbor(node, face, external);
                }
            }
        }
    }

    fn verify_neighbor(&self, node: &Node, face: Face, external: bool) {
        let link = self.neighbor_link(node, face);
        if !link.is_valid() {
            return;
        }

        // A node never links to a finer neighbor.
        debug_assert!(link.layer_idx() >= node.self_link().layer_idx());

        if !external && link.tile_id != node.self_link().tile_id {
            return;
        }

        let Some(neighbor) = self.node_from_link(link) else {
            debug_assert!(false, "neighbor link names no node");
            return;
        };

        if link.layer_idx() != node.self_link().layer_idx() {
            return;
        }

        // Same-layer neighbors point back at us or at one of our parents.
        let back = self.neighbor_link(neighbor, face.opposite());
        debug_assert!(back.is_valid());

        if back != node.self_link() {
            let mut parent = node.parent_link();
            let mut is_parent = false;
            while parent.is_valid() {
                if back == parent {
                    is_parent = true;
                    break;
                }
                parent = match self.node_from_link(parent) {
                    Some(p) => p.parent_link(),
                    None => break,
                };
            }
            debug_assert!(is_parent, "back link is neither self nor a parent");
        }
    }

    pub fn mem_used(&self) -> usize {
        let mut total = std::mem::size_of::<Self>();
        total += self.tiles.capacity() * std::mem::size_of::<(u32, Tile)>();
        for tile in self.tiles.values() {
            total += tile.mem_used();
        }
        total
    }
}
