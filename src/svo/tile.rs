// src/svo/tile.rs
//
// A tile is the top-level octree cell. It owns a contiguous node pool laid
// out as layers in descending resolution; a node's index within its layer
// is its Morton code, so lookup is pure arithmetic.

use glam::IVec3;

use crate::config::LEAF_LAYER;
use crate::svo::node::{Node, NodeLink, NodeState};

/// Deterministic 32-bit id for a tile coord. Stable across runs so
/// serialized octrees keep their keys.
#[inline]
pub fn tile_id_for_coord(coord: IVec3) -> u32 {
    let mut h = (coord.x as u32).wrapping_mul(0x8da6_b343);
    h = h.wrapping_add((coord.y as u32).wrapping_mul(0xd816_3841));
    h = h.wrapping_add((coord.z as u32).wrapping_mul(0xcb1a_b31f));
    // fmix32 finalizer
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Layer {
    pub start_node: u32,
    pub num_nodes: u32,
    pub max_nodes: u32,
}

#[derive(Clone, Debug)]
pub struct Tile {
    // The tile-layer root node, kept outside the pool.
    node_info: Node,
    // Coordinate relative to the seed location.
    coord: IVec3,
    pool: Vec<Node>,
    // Indexed by layer (0 = leaf).
    layers: Vec<Layer>,
}

impl Tile {
    pub fn new(tile_id: u32, tile_layer_idx: u8, coord: IVec3) -> Self {
        let mut node_info = Node::default();
        node_info.init(NodeLink::new(tile_id, tile_layer_idx, 0), true);

        Tile {
            node_info,
            coord,
            pool: Vec::new(),
            layers: Vec::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.node_info.self_link().tile_id
    }

    #[inline]
    pub fn self_link(&self) -> NodeLink {
        self.node_info.self_link()
    }

    #[inline]
    pub fn coord(&self) -> IVec3 {
        self.coord
    }

    #[inline]
    pub fn node_info(&self) -> &Node {
        &self.node_info
    }

    #[inline]
    pub fn node_info_mut(&mut self) -> &mut Node {
        &mut self.node_info
    }

    #[inline]
    pub fn has_nodes_allocated(&self) -> bool {
        !self.pool.is_empty()
    }

    /// Preallocates the full node pool and carves it into layers, top layer
    /// (8 nodes) first down to the leaf layer (largest).
    pub fn allocate_nodes(&mut self, num_nodes: u32, num_layers: u8) {
        self.pool.clear();
        self.layers.clear();

        if num_nodes == 0 {
            return;
        }

        self.pool.resize(num_nodes as usize, Node::default());
        self.layers.resize(num_layers as usize, Layer::default());

        let top_layer = num_layers as usize - 1;
        let mut start = 0u32;

        for i in 0..num_layers as usize {
            let layer = &mut self.layers[top_layer - i];
            layer.start_node = start;
            layer.max_nodes = 8u32.pow(i as u32 + 1);
            start += layer.max_nodes;
        }

        debug_assert_eq!(start, num_nodes);
    }

    pub fn release_memory(&mut self) {
        self.pool = Vec::new();
        self.layers = Vec::new();
    }

    pub fn reset(&mut self) {
        self.node_info.reset();
        self.release_memory();
    }

    #[inline]
    pub fn num_layers(&self) -> u8 {
        self.layers.len() as u8
    }

    pub fn max_nodes(&self, layer_idx: u8) -> u32 {
        self.layers.get(layer_idx as usize).map_or(0, |l| l.max_nodes)
    }

    pub fn num_nodes(&self, layer_idx: u8) -> u32 {
        self.layers.get(layer_idx as usize).map_or(0, |l| l.num_nodes)
    }

    pub fn layer(&self, layer_idx: u8) -> Option<&Layer> {
        self.layers.get(layer_idx as usize)
    }

    pub fn get_node(&self, layer_idx: u8, node_idx: u32, active_only: bool) -> Option<&Node> {
        if let Some(layer) = self.layers.get(layer_idx as usize) {
            if node_idx < layer.max_nodes {
                let node = &self.pool[(layer.start_node + node_idx) as usize];
                if !active_only || node.is_active() {
                    return Some(node);
                }
            }
            None
        } else if layer_idx == self.node_info.self_link().layer_idx() {
            // The tile layer itself; there is exactly one node.
            debug_assert_eq!(node_idx, 0);
            Some(&self.node_info)
        } else {
            None
        }
    }

    pub fn get_node_mut(&mut self, layer_idx: u8, node_idx: u32, active_only: bool) -> Option<&mut Node> {
        if let Some(layer) = self.layers.get(layer_idx as usize) {
            if node_idx < layer.max_nodes {
                let node = &mut self.pool[(layer.start_node + node_idx) as usize];
                if !active_only || node.is_active() {
                    return Some(node);
                }
            }
            None
        } else if layer_idx == self.node_info.self_link().layer_idx() {
            debug_assert_eq!(node_idx, 0);
            Some(&mut self.node_info)
        } else {
            None
        }
    }

    /// Activates the node at (layer, idx) if it isn't already. Returns the
    /// node and whether it was created by this call.
    pub fn ensure_node_exists(&mut self, layer_idx: u8, node_idx: u32) -> Option<(&mut Node, bool)> {
        let tile_id = self.id();
        let layer = self.layers.get_mut(layer_idx as usize)?;
        if node_idx >= layer.max_nodes {
            return None;
        }

        let slot = (layer.start_node + node_idx) as usize;
        let created = !self.pool[slot].is_active();
        if created {
            self.pool[slot].init(NodeLink::new(tile_id, layer_idx, node_idx), false);
            layer.num_nodes += 1;
        }

        Some((&mut self.pool[slot], created))
    }

    /// Active nodes of one layer, in pool (Morton) order.
    pub fn nodes_for_layer(&self, layer_idx: u8) -> impl Iterator<Item = &Node> {
        let range = self
            .layers
            .get(layer_idx as usize)
            .filter(|l| l.num_nodes > 0)
            .map(|l| l.start_node as usize..(l.start_node + l.max_nodes) as usize)
            .unwrap_or(0..0);

        self.pool[range].iter().filter(|n| n.is_active())
    }

    /// Frees trailing inactive slots per layer and shifts lower layers'
    /// start so the pool stays contiguous. Call only once the tile is
    /// effectively read-only.
    pub fn trim_excess_nodes(&mut self) {
        // A fully open or blocked tile needs no nodes at all.
        if self.node_info.node_state() != NodeState::PartiallyBlocked {
            self.release_memory();
            return;
        }

        for i in 0..self.layers.len() {
            let layer = self.layers[i];
            let layer_start = layer.start_node as usize;
            let layer_end = (layer.start_node + layer.max_nodes) as usize;

            let mut to_remove = 0usize;
            for node_idx in (layer_start..layer_end).rev() {
                if self.pool[node_idx].is_active() {
                    break;
                }
                to_remove += 1;
            }

            if to_remove == 0 {
                continue;
            }

            self.pool.drain(layer_end - to_remove..layer_end);
            self.layers[i].max_nodes -= to_remove as u32;
            debug_assert!(self.layers[i].num_nodes <= self.layers[i].max_nodes);

            // Lower layers sit after this one in the pool.
            for j in (0..i).rev() {
                self.layers[j].start_node -= to_remove as u32;
            }
        }

        self.pool.shrink_to_fit();
    }

    /// Deep copy of another tile's contents into this one.
    pub fn copy_from(&mut self, source: &Tile) {
        self.node_info = *source.node_info();
        self.coord = source.coord;
        self.pool = source.pool.clone();
        self.layers = source.layers.clone();
    }

    /// Moves another tile's pool and layer table into this one; no copy.
    pub fn assume(&mut self, source: &mut Tile) {
        self.release_memory();

        self.node_info = *source.node_info();
        self.coord = source.coord;
        self.pool = std::mem::take(&mut source.pool);
        self.layers = std::mem::take(&mut source.layers);

        if self.pool.is_empty() && self.node_info.node_state() == NodeState::PartiallyBlocked {
            self.node_info.set_node_state(NodeState::Open);
        }
    }

    /// Installs a deserialized pool and layer table wholesale.
    pub(crate) fn restore_storage(&mut self, pool: Vec<Node>, layers: Vec<Layer>) {
        self.pool = pool;
        self.layers = layers;
    }

    pub fn mem_used(&self) -> usize {
        self.pool.capacity() * std::mem::size_of::<Node>()
            + self.layers.capacity() * std::mem::size_of::<Layer>()
    }

    // -- verification ---------------------------------------------------------

    /// Structural checks; debug builds only, compiled out in release.
    pub fn verify(&self) {
        debug_assert!(self.node_info.is_active());
        debug_assert!(!self.node_info.parent_link().is_valid());
        debug_assert!(self.self_link().is_valid());

        if self.node_info.has_children() {
            self.verify_children(&self.node_info);
        }

        #[cfg(debug_assertions)]
        for i in (0..self.layers.len()).rev() {
            let layer = &self.layers[i];
            debug_assert!((layer.start_node + layer.max_nodes) as usize <= self.pool.len());

            let active = self.nodes_for_layer(i as u8).count() as u32;
            debug_assert_eq!(active, layer.num_nodes);

            if i > 0 {
                let next = &self.layers[i - 1];
                debug_assert_eq!(layer.start_node + layer.max_nodes, next.start_node);
            }
        }
    }

    fn verify_children(&self, node: &Node) {
        for child_idx in 0..8u8 {
            let child_link = node.child_link(child_idx);
            debug_assert!(child_link.is_valid());

            let child = self.get_node(child_link.layer_idx(), child_link.node_idx(), true);
            debug_assert!(child.is_some(), "partially blocked node missing child");

            if let Some(child) = child {
                debug_assert_eq!(child.self_link(), child_link);
                if child.has_children() {
                    self.verify_children(child);
                }
            }
        }
    }

    /// True if the tile holds any leaf-layer data at all.
    pub fn has_leaf_nodes(&self) -> bool {
        self.num_nodes(LEAF_LAYER) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SvoConfig;
    use glam::Vec3;

    fn test_tile() -> Tile {
        let cfg = SvoConfig::new(Vec3::ZERO, 1.0, 8, 2);
        let coord = IVec3::new(1, 2, 3);
        let mut tile = Tile::new(tile_id_for_coord(coord), cfg.tile_layer_idx(), coord);
        tile.allocate_nodes(cfg.num_nodes_per_tile(), cfg.tile_layer_idx());
        tile
    }

    #[test]
    fn layer_layout_descends_from_top() {
        let tile = test_tile();

        // Tile layer 2: layers 1 (8 nodes) then 0 (64 nodes)
        assert_eq!(tile.max_nodes(1), 8);
        assert_eq!(tile.max_nodes(0), 64);
        assert_eq!(tile.layer(1).unwrap().start_node, 0);
        assert_eq!(tile.layer(0).unwrap().start_node, 8);
    }

    #[test]
    fn ensure_and_lookup() {
        let mut tile = test_tile();

        assert!(tile.get_node(0, 5, true).is_none());

        let (_, created) = tile.ensure_node_exists(0, 5).unwrap();
        assert!(created);
        let (_, created_again) = tile.ensure_node_exists(0, 5).unwrap();
        assert!(!created_again);

        assert_eq!(tile.num_nodes(0), 1);
        let node = tile.get_node(0, 5, true).unwrap();
        assert_eq!(node.self_link().node_idx(), 5);
        assert_eq!(node.self_link().tile_id, tile.id());

        // Tile-layer lookup returns the root info node
        assert!(std::ptr::eq(tile.get_node(2, 0, true).unwrap(), tile.node_info()));
    }

    #[test]
    fn trim_removes_trailing_slots_only() {
        let mut tile = test_tile();
        tile.node_info_mut().set_node_state(NodeState::PartiallyBlocked);

        // Activate children 0..8 of parent 0 plus leaf 9; leaves 10..64 stay
        // empty and should be trimmed.
        tile.ensure_node_exists(1, 0);
        for i in 0..10u32 {
            tile.ensure_node_exists(0, i).unwrap();
        }

        tile.trim_excess_nodes();

        assert_eq!(tile.max_nodes(1), 1);
        assert_eq!(tile.max_nodes(0), 10);
        assert_eq!(tile.layer(0).unwrap().start_node, 1);

        // Lookup still works after the shift
        assert!(tile.get_node(0, 9, true).is_some());
        assert!(tile.get_node(0, 10, true).is_none());

        tile.verify();
    }

    #[test]
    fn trim_releases_uniform_tiles() {
        let mut tile = test_tile();
        tile.ensure_node_exists(0, 0);
        // Tile root says Open, so the whole pool goes away.
        tile.trim_excess_nodes();
        assert!(!tile.has_nodes_allocated());
    }

    #[test]
    fn assume_moves_pool() {
        let mut src = test_tile();
        src.node_info_mut().set_node_state(NodeState::PartiallyBlocked);
        src.ensure_node_exists(1, 3);

        let mut dst = Tile::new(src.id(), 2, src.coord());
        dst.assume(&mut src);

        assert!(!src.has_nodes_allocated());
        assert!(dst.get_node(1, 3, true).is_some());
        assert_eq!(dst.num_nodes(1), 1);
    }

    #[test]
    fn tile_ids_are_stable_and_spread() {
        let a = tile_id_for_coord(IVec3::new(0, 0, 0));
        let b = tile_id_for_coord(IVec3::new(1, 0, 0));
        let c = tile_id_for_coord(IVec3::new(0, 1, 0));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(a, tile_id_for_coord(IVec3::new(0, 0, 0)));
    }
}
