// src/svo/node.rs
//
// Node identity and the 64-byte node record. A node link packs
// (tile, layer, morton index, voxel) into 64 bits; the node itself is one
// cache line: self link, six neighbor slots, reserved padding, and either
// a voxel bitfield (leaves) or tile/state flags (everything else).

use bytemuck::{Pod, Zeroable};
use glam::IVec3;

use crate::config::{LEAF_LAYER, MAX_LAYERS, NO_VOXEL, VOXELS_PER_LEAF};

pub const INVALID_NODE_ID: u32 = 0xFFFF_FFFF;
pub const INVALID_LINK_ID: u64 = 0xFFFF_FFFF_FFFF_FFFF;

// Bit layout of a NodeLinkBase
const LAYER_BITS: u32 = 3;
const NODE_IDX_BITS: u32 = 18;
const VOXEL_IDX_BITS: u32 = 7;

const NODE_IDX_SHIFT: u32 = LAYER_BITS;
const VOXEL_IDX_SHIFT: u32 = LAYER_BITS + NODE_IDX_BITS;
const USERDATA_SHIFT: u32 = LAYER_BITS + NODE_IDX_BITS + VOXEL_IDX_BITS;

const LAYER_MASK: u32 = (1 << LAYER_BITS) - 1;
const NODE_IDX_MASK: u32 = (1 << NODE_IDX_BITS) - 1;
const VOXEL_IDX_MASK: u32 = (1 << VOXEL_IDX_BITS) - 1;

/// Masks the voxel bits out of a 64-bit link id.
pub const LINK_VOXEL_MASK: u64 = 0x0000_0000_0FE0_0000;
/// Masks the user-data bits of a 64-bit link id.
pub const LINK_USERDATA_MASK: u64 = 0x0000_0000_F000_0000;

// ---------------------------------------------------------------------------
// Faces
// ---------------------------------------------------------------------------

/// The six face directions a node can have a neighbor across.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Face {
    PosX = 0,
    PosY = 1,
    PosZ = 2,
    NegX = 3,
    NegY = 4,
    NegZ = 5,
}

/// User-data value marking a neighbor that lives in the same tile.
pub const FACE_SELF: u8 = 6;

pub const ALL_FACES: [Face; 6] = [Face::PosX, Face::PosY, Face::PosZ, Face::NegX, Face::NegY, Face::NegZ];

impl Face {
    #[inline]
    pub fn from_index(idx: u8) -> Option<Face> {
        (idx < 6).then(|| ALL_FACES[idx as usize])
    }

    #[inline]
    pub fn opposite(self) -> Face {
        ALL_FACES[((self as u8 + 3) % 6) as usize]
    }

    #[inline]
    pub fn direction(self) -> IVec3 {
        FACE_DIRECTION[self as usize]
    }
}

const FACE_DIRECTION: [IVec3; 6] = [
    IVec3::new(1, 0, 0),
    IVec3::new(0, 1, 0),
    IVec3::new(0, 0, 1),
    IVec3::new(-1, 0, 0),
    IVec3::new(0, -1, 0),
    IVec3::new(0, 0, -1),
];

/// Bitset over faces, used by the editable octree's dirty tracking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaceFlags(pub u8);

impl FaceFlags {
    pub const NONE: FaceFlags = FaceFlags(0);

    #[inline]
    pub fn set(&mut self, face: Face) {
        self.0 |= 1 << face as u8;
    }

    #[inline]
    pub fn contains(self, face: Face) -> bool {
        (self.0 & (1 << face as u8)) != 0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// ---------------------------------------------------------------------------
// Fixed tables
// ---------------------------------------------------------------------------

/// The four children (of 8) that touch each face.
pub const CHILDREN_TOUCHING_FACE: [[u8; 4]; 6] = [
    [1, 3, 5, 7], // +X
    [2, 3, 6, 7], // +Y
    [4, 5, 6, 7], // +Z
    [0, 2, 4, 6], // -X
    [0, 1, 4, 5], // -Y
    [0, 1, 2, 3], // -Z
];

/// `SIBLING_NEIGHBOR[a][b]`: the face of sibling `a` across which sibling
/// `b` lies, or [`FACE_SELF`] when they are not face-adjacent.
pub const SIBLING_NEIGHBOR: [[u8; 8]; 8] = [
    [6, 0, 1, 6, 2, 6, 6, 6],
    [3, 6, 6, 1, 6, 2, 6, 6],
    [4, 6, 6, 0, 6, 6, 2, 6],
    [6, 4, 3, 6, 6, 6, 6, 2],
    [5, 6, 6, 6, 6, 0, 1, 6],
    [6, 5, 6, 6, 3, 6, 6, 1],
    [6, 6, 5, 6, 4, 6, 6, 0],
    [6, 6, 6, 5, 6, 4, 3, 6],
];

/// For a child at sibling index `s`, which parent face its neighbor across
/// face `f` lies behind; [`FACE_SELF`] means the neighbor is a sibling.
pub const CHILD_TO_PARENT_FACE: [[u8; 6]; 8] = [
    // +X +Y +Z -X -Y -Z
    [6, 6, 6, 3, 4, 5], // child 0
    [0, 6, 6, 6, 4, 5], // child 1
    [6, 1, 6, 3, 6, 5], // child 2
    [0, 1, 6, 6, 6, 5], // child 3
    [6, 6, 2, 3, 4, 6], // child 4
    [0, 6, 2, 6, 4, 6], // child 5
    [6, 1, 2, 3, 6, 6], // child 6
    [0, 1, 2, 6, 6, 6], // child 7
];

/// For a child at sibling index `s`, the sibling index of its neighbor
/// across face `f`. When the neighbor crosses the parent's face this wraps
/// around and names the child of the parent's neighbor.
pub const CHILD_NEIGHBOR_SIBLING: [[u8; 6]; 8] = [
    // +X +Y +Z -X -Y -Z
    [1, 2, 4, 1, 2, 4],
    [0, 3, 5, 0, 3, 5],
    [3, 0, 6, 3, 0, 6],
    [2, 1, 7, 2, 1, 7],
    [5, 6, 0, 5, 6, 0],
    [4, 7, 1, 4, 7, 1],
    [7, 4, 2, 7, 4, 2],
    [6, 5, 3, 6, 5, 3],
];

/// The 16 voxel indices forming each face of a leaf's 4x4x4 grid.
pub const LEAF_FACE_VOXELS: [[u8; 16]; 6] = [
    // +X
    [3, 7, 11, 15, 19, 23, 27, 31, 35, 39, 43, 47, 51, 55, 59, 63],
    // +Y
    [12, 13, 14, 15, 28, 29, 30, 31, 44, 45, 46, 47, 60, 61, 62, 63],
    // +Z
    [48, 49, 50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 63],
    // -X
    [0, 4, 8, 12, 16, 20, 24, 28, 32, 36, 40, 44, 48, 52, 56, 60],
    // -Y
    [0, 1, 2, 3, 16, 17, 18, 19, 32, 33, 34, 35, 48, 49, 50, 51],
    // -Z
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
];

/// Index delta from a voxel on one leaf face to the complement voxel on the
/// touching face of the adjacent leaf.
pub const OPPOSITE_FACE_VOXEL_OFFSET: [i8; 6] = [-3, -12, -48, 3, 12, 48];

/// Voxels on the face of a leaf touching `face`'s opposite side; these are
/// the entry voxels when stepping across `face` into a neighbor leaf.
#[inline]
pub fn touching_neighbor_voxels(face: Face) -> &'static [u8; 16] {
    &LEAF_FACE_VOXELS[face.opposite() as usize]
}

/// Complement voxel index across a leaf boundary, e.g. a +X-face voxel maps
/// to the -X-face voxel of the next leaf over.
#[inline]
pub fn neighbor_voxel_index(voxel_idx: u8, face: Face) -> u8 {
    (voxel_idx as i16 + OPPOSITE_FACE_VOXEL_OFFSET[face as usize] as i16) as u8
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// 32-bit intra-tile node reference: layer, Morton node index, voxel index,
/// and four user-data bits that are not part of identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct NodeLinkBase(pub u32);

impl NodeLinkBase {
    pub const INVALID: NodeLinkBase = NodeLinkBase(INVALID_NODE_ID);

    #[inline]
    pub fn new(layer_idx: u8, node_idx: u32, voxel_idx: u8) -> Self {
        debug_assert!(u32::from(layer_idx) <= LAYER_MASK);
        debug_assert!(node_idx <= NODE_IDX_MASK);
        NodeLinkBase(
            (layer_idx as u32 & LAYER_MASK)
                | ((node_idx & NODE_IDX_MASK) << NODE_IDX_SHIFT)
                | ((voxel_idx as u32 & VOXEL_IDX_MASK) << VOXEL_IDX_SHIFT),
        )
    }

    #[inline]
    pub fn layer_idx(self) -> u8 {
        (self.0 & LAYER_MASK) as u8
    }

    #[inline]
    pub fn node_idx(self) -> u32 {
        (self.0 >> NODE_IDX_SHIFT) & NODE_IDX_MASK
    }

    #[inline]
    pub fn voxel_idx(self) -> u8 {
        ((self.0 >> VOXEL_IDX_SHIFT) & VOXEL_IDX_MASK) as u8
    }

    #[inline]
    pub fn user_data(self) -> u8 {
        (self.0 >> USERDATA_SHIFT) as u8
    }

    #[inline]
    pub fn with_user_data(self, user_data: u8) -> Self {
        NodeLinkBase((self.0 & !(0xF << USERDATA_SHIFT)) | ((user_data as u32 & 0xF) << USERDATA_SHIFT))
    }

    #[inline]
    pub fn with_voxel(self, voxel_idx: u8) -> Self {
        NodeLinkBase((self.0 & !(VOXEL_IDX_MASK << VOXEL_IDX_SHIFT)) | ((voxel_idx as u32 & VOXEL_IDX_MASK) << VOXEL_IDX_SHIFT))
    }

    /// Valid ignoring user data.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.layer_idx() < MAX_LAYERS
            && (self.voxel_idx() < VOXELS_PER_LEAF || self.voxel_idx() == NO_VOXEL)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        self.layer_idx() == LEAF_LAYER
    }

    #[inline]
    pub fn is_voxel(self) -> bool {
        self.is_leaf() && self.voxel_idx() != NO_VOXEL
    }
}

/// 64-bit node reference: a tile id plus a [`NodeLinkBase`]. Identity
/// ignores user data (it is forced high in [`NodeLink::id`]).
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct NodeLink {
    pub base: NodeLinkBase,
    pub tile_id: u32,
}

impl NodeLink {
    pub const INVALID: NodeLink = NodeLink {
        base: NodeLinkBase::INVALID,
        tile_id: INVALID_NODE_ID,
    };

    #[inline]
    pub fn new(tile_id: u32, layer_idx: u8, node_idx: u32) -> Self {
        NodeLink {
            base: NodeLinkBase::new(layer_idx, node_idx, NO_VOXEL),
            tile_id,
        }
    }

    #[inline]
    pub fn with_voxel(self, voxel_idx: u8) -> Self {
        NodeLink {
            base: self.base.with_voxel(voxel_idx),
            tile_id: self.tile_id,
        }
    }

    #[inline]
    pub fn from_parts(tile_id: u32, base: NodeLinkBase) -> Self {
        NodeLink { base, tile_id }
    }

    /// Unique id with the user-data bits forced high.
    #[inline]
    pub fn id(self) -> u64 {
        ((self.tile_id as u64) << 32) | (self.base.0 as u64 | LINK_USERDATA_MASK)
    }

    #[inline]
    pub fn from_id(id: u64) -> Self {
        NodeLink {
            base: NodeLinkBase(id as u32),
            tile_id: (id >> 32) as u32,
        }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.base.is_valid()
    }

    #[inline]
    pub fn layer_idx(self) -> u8 {
        self.base.layer_idx()
    }

    #[inline]
    pub fn node_idx(self) -> u32 {
        self.base.node_idx()
    }

    #[inline]
    pub fn voxel_idx(self) -> u8 {
        self.base.voxel_idx()
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        self.base.is_leaf()
    }

    #[inline]
    pub fn is_voxel(self) -> bool {
        self.base.is_voxel()
    }

    /// Parent link. The caller is responsible for not asking a tile-layer
    /// link for its parent.
    #[inline]
    pub fn parent(self) -> NodeLink {
        if self.is_valid() {
            NodeLink::new(self.tile_id, self.layer_idx() + 1, self.node_idx() >> 3)
        } else {
            NodeLink::INVALID
        }
    }

    #[inline]
    pub fn child(self, child_idx: u8) -> NodeLink {
        debug_assert!(self.layer_idx() > 0 && child_idx < 8);
        if self.is_valid() {
            NodeLink::new(self.tile_id, self.layer_idx() - 1, (self.node_idx() << 3) + child_idx as u32)
        } else {
            NodeLink::INVALID
        }
    }
}

impl PartialEq for NodeLink {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NodeLink {}

impl std::hash::Hash for NodeLink {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

// ---------------------------------------------------------------------------
// Node record
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    /// Nothing blocked inside; highest-resolution node for this region.
    Open = 0,
    /// Some space blocked; recurse into children (or voxels) to find out
    /// which.
    PartiallyBlocked = 1,
    /// Completely filled; no children.
    Blocked = 2,
}

// data-word layout for non-leaf nodes: byte 0 = is-tile flag, byte 1 = state
const DATA_IS_TILE_MASK: u64 = 0xFF;
const DATA_STATE_SHIFT: u64 = 8;

/// One octree node, exactly one cache line.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Node {
    self_link: NodeLink,
    neighbor_links: [NodeLinkBase; 6],
    // Reserved for future per-node data.
    padding: [u8; 24],
    // Leaf nodes: 64 voxel-blocked bits. Non-leaf: is-tile flag + state.
    data: u64,
}

const _: () = assert!(std::mem::size_of::<NodeLink>() == 8);
const _: () = assert!(std::mem::size_of::<Node>() == 64);

impl Default for Node {
    fn default() -> Self {
        Node {
            self_link: NodeLink::INVALID,
            neighbor_links: [NodeLinkBase::INVALID; 6],
            padding: [0; 24],
            data: 0,
        }
    }
}

impl Node {
    /// A node takes part in queries only while active.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.self_link.is_valid()
    }

    #[inline]
    pub fn self_link(&self) -> NodeLink {
        self.self_link
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.self_link.is_leaf()
    }

    #[inline]
    pub fn is_tile(&self) -> bool {
        !self.is_leaf() && (self.data & DATA_IS_TILE_MASK) != 0
    }

    /// Parent link, or invalid for tiles (tiles have no parent).
    #[inline]
    pub fn parent_link(&self) -> NodeLink {
        if self.self_link.is_valid() && (self.is_leaf() || !self.is_tile()) {
            self.self_link.parent()
        } else {
            NodeLink::INVALID
        }
    }

    /// Node state. Never stored for leaves; derived from the voxel bits.
    #[inline]
    pub fn node_state(&self) -> NodeState {
        if self.is_leaf() {
            match self.data {
                0 => NodeState::Open,
                u64::MAX => NodeState::Blocked,
                _ => NodeState::PartiallyBlocked,
            }
        } else {
            match (self.data >> DATA_STATE_SHIFT) as u8 {
                0 => NodeState::Open,
                1 => NodeState::PartiallyBlocked,
                _ => NodeState::Blocked,
            }
        }
    }

    #[inline]
    pub fn has_children(&self) -> bool {
        !self.is_leaf() && self.node_state() == NodeState::PartiallyBlocked
    }

    #[inline]
    pub fn child_link(&self, child_idx: u8) -> NodeLink {
        debug_assert!(self.has_children() && child_idx < 8);
        self.self_link.child(child_idx)
    }

    // -- leaf voxels ---------------------------------------------------------

    #[inline]
    pub fn voxels(&self) -> u64 {
        debug_assert!(self.is_leaf());
        self.data
    }

    #[inline]
    pub fn is_voxel_blocked(&self, voxel_idx: u8) -> bool {
        debug_assert!(self.is_leaf() && voxel_idx < VOXELS_PER_LEAF);
        (self.data & (1u64 << voxel_idx)) != 0
    }

    #[inline]
    pub fn set_voxel_blocked(&mut self, voxel_idx: u8) {
        debug_assert!(self.is_leaf() && voxel_idx < VOXELS_PER_LEAF);
        self.data |= 1u64 << voxel_idx;
    }

    #[inline]
    pub fn set_voxels(&mut self, voxels: u64) {
        debug_assert!(self.is_leaf());
        self.data = voxels;
    }

    // -- build-side mutation -------------------------------------------------

    pub fn init(&mut self, self_link: NodeLink, is_tile: bool) {
        debug_assert!(self_link.is_valid());
        self.self_link = self_link;
        self.data = 0;
        if !self.is_leaf() {
            self.data = is_tile as u64;
        }
    }

    pub fn reset(&mut self) {
        self.self_link = NodeLink::INVALID;
        self.neighbor_links = [NodeLinkBase::INVALID; 6];
        self.data = 0;
    }

    #[inline]
    pub fn set_node_state(&mut self, state: NodeState) {
        debug_assert!(!self.is_leaf());
        self.data = (self.data & DATA_IS_TILE_MASK) | ((state as u64) << DATA_STATE_SHIFT);
    }

    // -- neighbors -----------------------------------------------------------

    /// Stores a neighbor link. The slot's user data records whether the
    /// neighbor lives in this tile ([`FACE_SELF`]) or across the recorded
    /// face, which lets a reader rebuild the neighbor's tile id from this
    /// tile's coord without storing it.
    pub fn set_neighbor_link(&mut self, face: Face, neighbor: NodeLink) {
        let slot = &mut self.neighbor_links[face as usize];

        if neighbor.is_valid() {
            let user = if neighbor.tile_id == self.self_link.tile_id {
                FACE_SELF
            } else {
                face as u8
            };
            *slot = neighbor.base.with_user_data(user);
        } else {
            *slot = NodeLinkBase::INVALID;
        }
    }

    #[inline]
    pub fn raw_neighbor(&self, face: Face) -> NodeLinkBase {
        self.neighbor_links[face as usize]
    }

    #[inline]
    pub fn set_raw_neighbor(&mut self, face: Face, base: NodeLinkBase) {
        self.neighbor_links[face as usize] = base;
    }

    /// Reconstructs the full neighbor link from the stored slot plus the
    /// owning tile's identity.
    pub fn neighbor_link(&self, own_tile_coord: IVec3, face: Face, tile_id_of: impl Fn(IVec3) -> u32) -> NodeLink {
        let base = self.neighbor_links[face as usize];

        if !base.is_valid() {
            return NodeLink::INVALID;
        }

        let tile_id = if base.user_data() == FACE_SELF {
            self.self_link.tile_id
        } else {
            debug_assert_eq!(base.user_data(), face as u8);
            tile_id_of(own_tile_coord + face.direction())
        };

        NodeLink::from_parts(tile_id, base.with_user_data(0))
    }

    // -- serialization support ----------------------------------------------

    #[inline]
    pub fn data_word(&self) -> u64 {
        self.data
    }

    #[inline]
    pub fn set_data_word(&mut self, data: u64) {
        self.data = data;
    }

    #[inline]
    pub fn set_self_link(&mut self, link: NodeLink) {
        self.self_link = link;
    }

    /// Rebuilds the non-leaf flags from the pre-v10 encoding, which kept
    /// them as voxel bits 0 (is-tile) and 1 (has-children).
    pub fn upgrade_legacy_props(&mut self) {
        if !self.is_leaf() {
            let is_tile = (self.data & (1 << 0)) != 0;
            let has_children = (self.data & (1 << 1)) != 0;

            self.data = is_tile as u64;
            self.set_node_state(if has_children {
                NodeState::PartiallyBlocked
            } else {
                NodeState::Open
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_base_packing() {
        let base = NodeLinkBase::new(3, 0x2_5A5A, 17);
        assert_eq!(base.layer_idx(), 3);
        assert_eq!(base.node_idx(), 0x2_5A5A);
        assert_eq!(base.voxel_idx(), 17);
        assert_eq!(base.user_data(), 0);
        assert!(base.is_valid());
        assert!(!base.is_leaf());

        assert!(!NodeLinkBase::INVALID.is_valid());
    }

    #[test]
    fn link_identity_ignores_user_data() {
        let a = NodeLink::new(42, 1, 7);
        let b = NodeLink::from_parts(42, a.base.with_user_data(0x5));
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());

        let decoded = NodeLink::from_id(a.id());
        assert_eq!(decoded.tile_id, 42);
        assert_eq!(decoded.layer_idx(), 1);
        assert_eq!(decoded.node_idx(), 7);
    }

    #[test]
    fn parent_child_arithmetic() {
        let parent = NodeLink::new(9, 2, 5);
        let child = parent.child(3);
        assert_eq!(child.layer_idx(), 1);
        assert_eq!(child.node_idx(), 5 * 8 + 3);
        assert_eq!(child.parent(), parent);
    }

    #[test]
    fn leaf_state_is_derived() {
        let mut node = Node::default();
        node.init(NodeLink::new(1, LEAF_LAYER, 0), false);

        assert_eq!(node.node_state(), NodeState::Open);

        node.set_voxel_blocked(5);
        assert_eq!(node.node_state(), NodeState::PartiallyBlocked);
        assert!(node.is_voxel_blocked(5));
        assert!(!node.is_voxel_blocked(6));

        node.set_voxels(u64::MAX);
        assert_eq!(node.node_state(), NodeState::Blocked);
    }

    #[test]
    fn nonleaf_state_round_trip() {
        let mut node = Node::default();
        node.init(NodeLink::new(1, 2, 0), true);

        assert!(node.is_tile());
        assert_eq!(node.node_state(), NodeState::Open);

        node.set_node_state(NodeState::PartiallyBlocked);
        assert!(node.has_children());
        assert!(node.is_tile());

        node.set_node_state(NodeState::Blocked);
        assert_eq!(node.node_state(), NodeState::Blocked);
    }

    #[test]
    fn legacy_props_upgrade() {
        let mut node = Node::default();
        node.init(NodeLink::new(1, 2, 0), false);
        node.set_data_word(0b11); // legacy: is-tile + has-children
        node.upgrade_legacy_props();

        assert!(node.is_tile());
        assert_eq!(node.node_state(), NodeState::PartiallyBlocked);
    }

    #[test]
    fn neighbor_slot_user_data_encoding() {
        let mut node = Node::default();
        node.init(NodeLink::new(10, 1, 0), false);

        // Same-tile neighbor
        node.set_neighbor_link(Face::PosX, NodeLink::new(10, 1, 1));
        assert_eq!(node.raw_neighbor(Face::PosX).user_data(), FACE_SELF);

        // Cross-tile neighbor records the face
        node.set_neighbor_link(Face::NegY, NodeLink::new(77, 1, 3));
        assert_eq!(node.raw_neighbor(Face::NegY).user_data(), Face::NegY as u8);

        // Reconstruction
        let own_coord = IVec3::new(2, 2, 2);
        let same = node.neighbor_link(own_coord, Face::PosX, |_| 99);
        assert_eq!(same.tile_id, 10);

        let cross = node.neighbor_link(own_coord, Face::NegY, |c| {
            assert_eq!(c, own_coord + Face::NegY.direction());
            77
        });
        assert_eq!(cross.tile_id, 77);
        assert_eq!(cross.node_idx(), 3);

        // Invalid slot
        assert!(!node.neighbor_link(own_coord, Face::PosZ, |_| 0).is_valid());
    }

    #[test]
    fn face_tables_are_mutually_consistent() {
        // Walking to a sibling and back lands on the starting sibling.
        for s in 0..8u8 {
            for f in 0..6usize {
                let n = CHILD_NEIGHBOR_SIBLING[s as usize][f];
                if CHILD_TO_PARENT_FACE[s as usize][f] == FACE_SELF {
                    let back = Face::from_index(f as u8).unwrap().opposite();
                    assert_eq!(CHILD_NEIGHBOR_SIBLING[n as usize][back as usize], s);
                    assert_eq!(SIBLING_NEIGHBOR[s as usize][n as usize], f as u8);
                }
            }
        }
    }

    #[test]
    fn leaf_face_offsets_connect_faces() {
        // Every +X-face voxel maps onto a -X-face voxel of the next leaf.
        for &v in &LEAF_FACE_VOXELS[Face::PosX as usize] {
            let n = neighbor_voxel_index(v, Face::PosX);
            assert!(LEAF_FACE_VOXELS[Face::NegX as usize].contains(&n));
        }
        for &v in &LEAF_FACE_VOXELS[Face::NegZ as usize] {
            let n = neighbor_voxel_index(v, Face::NegZ);
            assert!(LEAF_FACE_VOXELS[Face::PosZ as usize].contains(&n));
        }
    }
}
