// src/svo/editable.rs
//
// Mutation layer over the octree. All edits happen inside a reference-
// counted batch; nodes whose neighbor links may have gone stale are
// collected in a dirty set, and the outermost end_batch_edit runs the
// finalize pass that re-links them, coarsest first.

use glam::IVec3;
use rustc_hash::FxHashMap as HashMap;

use crate::svo::node::{Face, FaceFlags, NodeLink, ALL_FACES};
use crate::svo::tile::Tile;
use crate::svo::Svo;

pub struct EditableSvo {
    svo: Svo,
    // Nodes needing their neighbor links refreshed, per stale face.
    dirty_nodes: HashMap<NodeLink, FaceFlags>,
    batch_depth: u32,
}

impl std::ops::Deref for EditableSvo {
    type Target = Svo;

    #[inline]
    fn deref(&self) -> &Svo {
        &self.svo
    }
}

impl std::ops::DerefMut for EditableSvo {
    #[inline]
    fn deref_mut(&mut self) -> &mut Svo {
        &mut self.svo
    }
}

impl EditableSvo {
    pub fn new(config: crate::config::SvoConfig) -> Self {
        EditableSvo {
            svo: Svo::new(config),
            dirty_nodes: HashMap::default(),
            batch_depth: 0,
        }
    }

    pub(crate) fn from_svo(svo: Svo) -> Self {
        EditableSvo {
            svo,
            dirty_nodes: HashMap::default(),
            batch_depth: 0,
        }
    }

    pub fn reset(&mut self) {
        self.svo.reset();
        self.dirty_nodes.clear();
    }

    /// Runs the finalize pass outside the batch protocol; used by
    /// serialization to flush pending links before writing.
    pub(crate) fn finalize_now(&mut self) {
        self.finalize_nodes();
    }

    #[inline]
    pub fn as_svo(&self) -> &Svo {
        &self.svo
    }

    // -- batch protocol -------------------------------------------------------

    pub fn begin_batch_edit(&mut self) {
        self.batch_depth += 1;
    }

    pub fn end_batch_edit(&mut self) {
        debug_assert!(self.batch_depth > 0);
        self.batch_depth = self.batch_depth.saturating_sub(1);

        if self.batch_depth == 0 {
            self.finalize_nodes();
        }
    }

    #[inline]
    pub fn is_batch_editing(&self) -> bool {
        self.batch_depth > 0
    }

    /// True when no dirty nodes are waiting on a finalize.
    #[inline]
    pub fn are_nodes_finalized(&self) -> bool {
        self.dirty_nodes.is_empty()
    }

    // -- mutations ------------------------------------------------------------

    /// Deep-copies a tile into this octree at the source's coord.
    pub fn copy_tile(&mut self, source: &Tile, preserve_neighbor_links: bool) {
        self.begin_batch_edit();

        let tile_link = match self.svo.ensure_tile_at_coord(source.coord()) {
            Some(dest) => {
                let link = dest.self_link();
                dest.copy_from(source);
                Some(link)
            }
            None => None,
        };

        if let Some(tile_link) = tile_link {
            self.svo
                .link_neighbors_for_node_hierarchically(tile_link, preserve_neighbor_links);
            self.mark_neighbors_dirty(tile_link);
        }

        self.end_batch_edit();
    }

    pub fn copy_tiles_from(&mut self, source: &Svo, tile_coords: &[IVec3], preserve_neighbor_links: bool) {
        if !self.svo.config().is_compatible_with(source.config()) {
            return;
        }

        self.begin_batch_edit();
        for &coord in tile_coords {
            if let Some(tile) = source.tile_at_coord(coord) {
                // Clone out so the borrow on `source` doesn't pin us.
                let tile = tile.clone();
                self.copy_tile(&tile, preserve_neighbor_links);
            }
        }
        self.end_batch_edit();
    }

    /// Moves a tile's node pool into this octree; no copy.
    pub fn assume_tile(&mut self, source: &mut Tile, preserve_neighbor_links: bool) {
        self.begin_batch_edit();

        let tile_link = match self.svo.ensure_tile_at_coord(source.coord()) {
            Some(dest) => {
                let link = dest.self_link();
                dest.assume(source);
                Some(link)
            }
            None => None,
        };

        if let Some(tile_link) = tile_link {
            self.svo
                .link_neighbors_for_node_hierarchically(tile_link, preserve_neighbor_links);
            self.mark_neighbors_dirty(tile_link);
        }

        self.end_batch_edit();
    }

    pub fn assume_tiles_from(&mut self, source: &mut Svo, preserve_neighbor_links: bool) {
        if !self.svo.config().is_compatible_with(source.config()) {
            return;
        }

        self.begin_batch_edit();
        let ids: Vec<u32> = source.tiles().map(|t| t.id()).collect();
        for id in ids {
            if let Some(tile) = source.get_tile_mut(id) {
                let mut taken = Tile::new(tile.id(), tile.self_link().layer_idx(), tile.coord());
                taken.assume(tile);
                self.assume_tile(&mut taken, preserve_neighbor_links);
            }
        }
        self.end_batch_edit();
    }

    /// Removes a tile, marking its neighbors dirty so their links back at
    /// the removed tile get cleared during finalize.
    pub fn remove_tile(&mut self, tile_link: NodeLink) {
        if !tile_link.is_valid() {
            return;
        }
        debug_assert_eq!(tile_link.layer_idx(), self.svo.config().tile_layer_idx());

        self.begin_batch_edit();
        {
            self.mark_neighbors_dirty(tile_link);

            // No point refreshing a tile that is going away.
            self.dirty_nodes.remove(&tile_link);

            self.svo.release_tile_by_link(tile_link);
        }
        self.end_batch_edit();
    }

    pub fn remove_tile_at_coord(&mut self, coord: IVec3) {
        let link = self.svo.tile_link_at_coord(coord);
        if self.svo.get_tile(link.tile_id).is_some() {
            self.remove_tile(link);
        }
    }

    pub fn remove_matching_tiles(&mut self, source: &Svo) {
        if !self.svo.config().is_compatible_with(source.config()) {
            return;
        }

        self.begin_batch_edit();
        let coords: Vec<IVec3> = source.tiles().map(|t| t.coord()).collect();
        for coord in coords {
            self.remove_tile_at_coord(coord);
        }
        self.end_batch_edit();
    }

    // -- dirty tracking -------------------------------------------------------

    /// Marks the same-layer neighbors of a node dirty on the face looking
    /// back at it. Coarser neighbors hold a parent link that stays valid,
    /// and finer neighbors cannot exist, so same-layer is the only case
    /// with a potentially stale back link.
    fn mark_neighbors_dirty(&mut self, link: NodeLink) {
        let mut stale: Vec<(NodeLink, Face)> = Vec::new();

        if let Some(node) = self.svo.node_from_link(link) {
            for face in ALL_FACES {
                let neighbor_link = self.svo.neighbor_link(node, face);
                if !neighbor_link.is_valid() {
                    continue;
                }

                debug_assert!(neighbor_link.layer_idx() >= link.layer_idx());

                if neighbor_link.layer_idx() == link.layer_idx() {
                    stale.push((neighbor_link, face.opposite()));
                }
            }
        }

        for (neighbor_link, opposite) in stale {
            self.dirty_nodes.entry(neighbor_link).or_default().set(opposite);
        }
    }

    /// Re-links every dirty node, coarsest layers first so parents are
    /// authoritative before their children are touched.
    fn finalize_nodes(&mut self) {
        if self.dirty_nodes.is_empty() {
            return;
        }

        let mut dirty: Vec<(NodeLink, FaceFlags)> = self.dirty_nodes.drain().collect();
        dirty.sort_by(|a, b| b.0.layer_idx().cmp(&a.0.layer_idx()));

        for (link, flags) in dirty {
            debug_assert!(!flags.is_empty());

            for face in ALL_FACES {
                if flags.contains(face) {
                    self.svo.link_neighbor_for_node_hierarchically(link, face);
                }
            }
        }
    }
}
