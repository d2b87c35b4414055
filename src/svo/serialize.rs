// src/svo/serialize.rs
//
// Versioned byte stream for the octree. The header carries a format GUID
// and a version integer; loads accept every known version and upgrade
// legacy layouts in place, saves always write the latest.

use glam::{IVec3, Vec3};
use thiserror::Error;

use crate::config::SvoConfig;
use crate::svo::node::{Face, Node, NodeLink, NodeLinkBase, FACE_SELF, ALL_FACES};
use crate::svo::tile::{Layer, Tile};
use crate::svo::{editable::EditableSvo, Svo};

/// Format GUID; identifies this stream regardless of version.
pub const FORMAT_GUID: [u8; 16] = [
    0x9b, 0x1c, 0x5e, 0x2f, 0x64, 0x7a, 0x41, 0xd3, 0x8c, 0x02, 0xe6, 0x55, 0x30, 0x91, 0xaf, 0x68,
];

/// First version of the rebooted format.
pub const VERSION_INITIAL: u32 = 9;
/// Non-leaf node properties moved out of the voxel bits.
pub const VERSION_NODE_PROPS_CHANGED: u32 = 10;
/// Neighbor links shrank to 32-bit bases; tiles store their coord.
pub const VERSION_NODE_LINK_BASE_ADDED: u32 = 11;

pub const VERSION_LATEST: u32 = VERSION_NODE_LINK_BASE_ADDED;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("stream is not octree data (bad GUID)")]
    BadGuid,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("corrupt stream: {0}")]
    Corrupt(&'static str),
}

// ---------------------------------------------------------------------------
// Little-endian cursor helpers
// ---------------------------------------------------------------------------

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SerializeError> {
        let end = self.pos.checked_add(n).ok_or(SerializeError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(SerializeError::UnexpectedEof);
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, SerializeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, SerializeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, SerializeError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, SerializeError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, SerializeError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn ivec3(&mut self) -> Result<IVec3, SerializeError> {
        Ok(IVec3::new(self.i32()?, self.i32()?, self.i32()?))
    }

    fn vec3(&mut self) -> Result<Vec3, SerializeError> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }
}

struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Writer { bytes: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.bytes.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn ivec3(&mut self, v: IVec3) {
        self.i32(v.x);
        self.i32(v.y);
        self.i32(v.z);
    }

    fn vec3(&mut self, v: Vec3) {
        self.f32(v.x);
        self.f32(v.y);
        self.f32(v.z);
    }
}

// ---------------------------------------------------------------------------
// Node / tile bodies
// ---------------------------------------------------------------------------

fn write_node(w: &mut Writer, node: &Node) {
    let link = node.self_link();
    w.u32(link.tile_id);
    w.u32(link.base.0);

    for face in ALL_FACES {
        w.u32(node.raw_neighbor(face).0);
    }

    w.u64(node.data_word());
}

fn read_node(r: &mut Reader, version: u32) -> Result<Node, SerializeError> {
    let tile_id = r.u32()?;
    let base = NodeLinkBase(r.u32()?);

    let mut node = Node::default();
    node.set_self_link(NodeLink::from_parts(tile_id, base));

    if version < VERSION_NODE_LINK_BASE_ADDED {
        // Legacy 64-bit neighbor encoding: (tile id, node id) pairs. The
        // tile id becomes the user-data marker of the 32-bit base.
        for face in ALL_FACES {
            let neighbor_tile_id = r.u32()?;
            let neighbor_base = NodeLinkBase(r.u32()?);

            let user = if neighbor_tile_id == tile_id {
                FACE_SELF
            } else {
                face as u8
            };
            node.set_raw_neighbor(
                face,
                if neighbor_base.is_valid() {
                    neighbor_base.with_user_data(user)
                } else {
                    NodeLinkBase::INVALID
                },
            );
        }
    } else {
        for face in ALL_FACES {
            node.set_raw_neighbor(face, NodeLinkBase(r.u32()?));
        }
    }

    node.set_data_word(r.u64()?);

    if version < VERSION_NODE_PROPS_CHANGED {
        node.upgrade_legacy_props();
    }

    Ok(node)
}

fn write_tile(w: &mut Writer, tile: &Tile) {
    write_node(w, tile.node_info());
    w.ivec3(tile.coord());

    let num_layers = tile.num_layers();

    let pool_len: u32 = (0..num_layers).map(|l| tile.max_nodes(l)).sum();
    w.u32(pool_len);
    for layer_idx in (0..num_layers).rev() {
        // Pool order: top layer first.
        let layer = tile.layer(layer_idx).unwrap();
        for node_idx in 0..layer.max_nodes {
            write_node(w, tile.get_node(layer_idx, node_idx, false).unwrap());
        }
    }

    w.u32(num_layers as u32);
    for layer_idx in 0..num_layers {
        let layer = tile.layer(layer_idx).unwrap();
        w.u32(layer.start_node);
        w.u32(layer.num_nodes);
        w.u32(layer.max_nodes);
    }
}

fn read_tile(r: &mut Reader, version: u32, config: &SvoConfig) -> Result<Tile, SerializeError> {
    let node_info = read_node(r, version)?;
    if !node_info.self_link().is_valid() {
        return Err(SerializeError::Corrupt("tile root link invalid"));
    }

    let coord = if version < VERSION_NODE_LINK_BASE_ADDED {
        // Legacy tiles stored their center location instead of the coord.
        let location = r.vec3()?;
        config.location_to_coord(location, config.tile_resolution())
    } else {
        r.ivec3()?
    };

    let mut tile = Tile::new(node_info.self_link().tile_id, node_info.self_link().layer_idx(), coord);
    *tile.node_info_mut() = node_info;

    let pool_len = r.u32()? as usize;
    let mut pool = Vec::with_capacity(pool_len);
    for _ in 0..pool_len {
        pool.push(read_node(r, version)?);
    }

    let num_layers = r.u32()? as usize;
    if num_layers >= crate::config::MAX_LAYERS as usize {
        return Err(SerializeError::Corrupt("too many layers"));
    }
    let mut layers = Vec::with_capacity(num_layers);
    for _ in 0..num_layers {
        layers.push(Layer {
            start_node: r.u32()?,
            num_nodes: r.u32()?,
            max_nodes: r.u32()?,
        });
    }

    for layer in &layers {
        let end = layer.start_node as usize + layer.max_nodes as usize;
        if end > pool.len() {
            return Err(SerializeError::Corrupt("layer range outside pool"));
        }
    }

    tile.restore_storage(pool, layers);

    Ok(tile)
}

// ---------------------------------------------------------------------------
// Octree stream
// ---------------------------------------------------------------------------

fn write_config(w: &mut Writer, config: &SvoConfig) {
    w.vec3(config.seed_location());
    w.f32(config.voxel_size());
    w.u8(config.tile_layer_idx());
    w.u32(config.tile_pool_size());
    w.u8(config.is_tile_pool_size_fixed() as u8);
}

fn read_config(r: &mut Reader) -> Result<SvoConfig, SerializeError> {
    let seed = r.vec3()?;
    let voxel_size = r.f32()?;
    let tile_layer = r.u8()?;
    let pool_size = r.u32()?;
    let fixed = r.u8()? != 0;

    if !(voxel_size.is_finite() && voxel_size > 0.0) {
        return Err(SerializeError::Corrupt("bad voxel size"));
    }

    let mut config = SvoConfig::new(seed, voxel_size, pool_size, tile_layer);
    config.set_tile_pool_size_fixed(fixed);
    Ok(config)
}

impl Svo {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();

        w.bytes.extend_from_slice(&FORMAT_GUID);
        w.u32(VERSION_LATEST);

        write_config(&mut w, &self.config);
        w.u32(self.max_tiles);

        w.u32(self.tiles.len() as u32);
        for tile in self.tiles.values() {
            w.u32(tile.id());
            write_tile(&mut w, tile);
        }

        w.bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Svo, SerializeError> {
        let mut r = Reader::new(bytes);

        if r.take(16)? != FORMAT_GUID {
            return Err(SerializeError::BadGuid);
        }

        let version = r.u32()?;
        if !(VERSION_INITIAL..=VERSION_LATEST).contains(&version) {
            return Err(SerializeError::UnsupportedVersion(version));
        }

        let config = read_config(&mut r)?;
        let max_tiles = r.u32()?;

        let mut svo = Svo::new(config);
        svo.max_tiles = max_tiles.max(svo.max_tiles);

        let num_tiles = r.u32()?;
        for _ in 0..num_tiles {
            let tile_id = r.u32()?;
            let tile = read_tile(&mut r, version, &svo.config)?;
            if tile.id() != tile_id {
                return Err(SerializeError::Corrupt("tile id mismatch"));
            }
            svo.tiles.insert(tile_id, tile);
        }

        svo.verify_node_data(false);

        Ok(svo)
    }
}

impl EditableSvo {
    /// Serializes after forcing a finalize so neighbor links land on disk
    /// fully resolved.
    pub fn to_bytes(&mut self) -> Vec<u8> {
        if !self.are_nodes_finalized() {
            self.finalize_now();
        }
        self.as_svo().to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<EditableSvo, SerializeError> {
        let svo = Svo::from_bytes(bytes)?;
        Ok(EditableSvo::from_svo(svo))
    }
}
