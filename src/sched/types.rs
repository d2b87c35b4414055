// src/sched/types.rs

use std::sync::{atomic::AtomicBool, Arc};

use glam::IVec3;

use crate::geom::Aabb;
use crate::gen::TileGenerator;

/// What changed inside a dirty area.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DirtyFlags(pub u8);

impl DirtyFlags {
    pub const GEOMETRY: DirtyFlags = DirtyFlags(1 << 0);
    pub const NAVIGATION_BOUNDS: DirtyFlags = DirtyFlags(1 << 1);
    pub const ALL: DirtyFlags = DirtyFlags(0b11);

    #[inline]
    pub fn contains(self, other: DirtyFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// An AABB whose geometry or bounds changed; overlapping tiles must be
/// rebuilt.
#[derive(Clone, Copy, Debug)]
pub struct DirtyArea {
    pub bounds: Aabb,
    pub flags: DirtyFlags,
}

/// A tile waiting to be handed to a generator, with its cached squared
/// distance to the nearest player.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingTile {
    pub coord: IVec3,
    pub seed_distance_sq: f32,
}

pub(crate) struct BuildJob {
    pub generator: Box<TileGenerator>,
    pub cancel: Arc<AtomicBool>,
}

pub(crate) struct BuildDone {
    pub generator: Box<TileGenerator>,
    pub canceled: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    pub tiles_installed: u32,
    pub tasks_submitted: u32,
    pub tasks_completed: u32,
    pub tasks_canceled: u32,
}
