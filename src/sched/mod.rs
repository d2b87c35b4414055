// src/sched/mod.rs
//
// Tile build scheduling. Dirty areas turn into a pending-tile list sorted
// by player distance; pending tiles accumulate into a generator up to a
// triangle cap; generators run on the worker pool; completed tiles drain
// into the editable octree inside a per-frame time budget.

mod types;
mod workers;

pub use types::{DirtyArea, DirtyFlags, SchedulerStats};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use glam::{IVec3, Vec3};
use rustc_hash::FxHashSet as HashSet;
use tracing::debug;

use crate::gen::{GeneratorConfig, TileGenerator};
use crate::geom::{aabb_intersects_any, aabbs_contain_aabb, Aabb, GeometrySource};
use crate::svo::editable::EditableSvo;
use types::{BuildDone, BuildJob, PendingTile};

// Boost mode trades framerate for build throughput during load screens.
static GENERATION_BOOST_MODE: AtomicBool = AtomicBool::new(false);

pub fn set_generation_boost_mode(enabled: bool) {
    GENERATION_BOOST_MODE.store(enabled, Ordering::Relaxed);
}

pub fn generation_boost_mode() -> bool {
    GENERATION_BOOST_MODE.load(Ordering::Relaxed)
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Worker threads for tile generation.
    pub max_tile_generation_jobs: u32,
    /// Max generator tasks submitted per tick. At least 2 is ideal so one
    /// task can gather triangles while another crunches on a worker.
    pub max_tasks: u32,
    pub boost_max_tasks: u32,
    /// Soft cap on triangles buffered per task; a dense tile can push a
    /// task a ways over.
    pub max_tris_per_task: u32,
    /// Ticks a task may sit gathering more tiles before it is forced to
    /// start.
    pub max_pending_ticks: u32,
    /// Control-thread budget per tick.
    pub max_time_per_tick: Duration,
    pub boost_max_time_per_tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_tile_generation_jobs: 2,
            max_tasks: 2,
            boost_max_tasks: 4,
            max_tris_per_task: 10_000,
            max_pending_ticks: 5,
            max_time_per_tick: Duration::from_micros(500),
            boost_max_time_per_tick: Duration::from_millis(5),
        }
    }
}

pub struct BuildScheduler {
    config: GeneratorConfig,
    sched: SchedulerConfig,
    geometry: Arc<dyn GeometrySource>,

    inclusion_bounds: Vec<Aabb>,
    player_locations: Vec<Vec3>,

    // Sorted by descending player distance so the nearest tile sits at the
    // back and pops first.
    pending_tiles: Vec<PendingTile>,
    pending_generator: Option<Box<TileGenerator>>,
    completed: VecDeque<Box<TileGenerator>>,

    // Coords owned by generators currently on workers.
    running_coords: HashSet<IVec3>,
    num_running: usize,

    tx_job: Sender<BuildJob>,
    rx_done: Receiver<BuildDone>,
    cancel: Arc<AtomicBool>,

    pub stats: SchedulerStats,
}

impl BuildScheduler {
    pub fn new(config: GeneratorConfig, sched: SchedulerConfig, geometry: Arc<dyn GeometrySource>) -> Self {
        let cap = (sched.max_tile_generation_jobs as usize * 8).max(16);
        let (tx_job, rx_job) = bounded::<BuildJob>(cap);
        let (tx_done, rx_done) = bounded::<BuildDone>(cap);

        workers::spawn_workers(sched.max_tile_generation_jobs.max(1) as usize, rx_job, tx_done);

        BuildScheduler {
            config,
            sched,
            geometry,
            inclusion_bounds: Vec::new(),
            player_locations: Vec::new(),
            pending_tiles: Vec::new(),
            pending_generator: None,
            completed: VecDeque::new(),
            running_coords: HashSet::default(),
            num_running: 0,
            tx_job,
            rx_done,
            cancel: Arc::new(AtomicBool::new(false)),
            stats: SchedulerStats::default(),
        }
    }

    #[inline]
    pub fn generator_config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// World AABBs where nav data is authorized to exist.
    pub fn set_inclusion_bounds(&mut self, bounds: Vec<Aabb>) {
        self.inclusion_bounds = bounds;
    }

    /// Player positions used to prioritize pending tiles.
    pub fn set_player_locations(&mut self, locations: &[Vec3]) {
        self.player_locations.clear();
        self.player_locations.extend_from_slice(locations);
    }

    // -- build status ---------------------------------------------------------

    pub fn is_build_in_progress(&self) -> bool {
        self.num_running > 0
            || !self.completed.is_empty()
            || self.pending_generator.is_some()
            || !self.pending_tiles.is_empty()
    }

    pub fn num_remaining_build_tasks(&self) -> usize {
        self.pending_tiles.len() + self.pending_generator.is_some() as usize + self.num_running
    }

    pub fn num_running_build_tasks(&self) -> usize {
        self.num_running
    }

    /// True when any tile overlapping `bounds` is still pending or in
    /// flight.
    pub fn has_dirty_areas(&self, octree: &EditableSvo, bounds: &Aabb) -> bool {
        if !self.is_build_in_progress() {
            return false;
        }
        if !bounds.is_valid() {
            return false;
        }

        let (min_coord, max_coord) = octree
            .config()
            .coords_for_bounds(bounds, octree.config().tile_resolution());

        if self
            .pending_tiles
            .iter()
            .any(|t| coord_in_box(t.coord, min_coord, max_coord))
        {
            return true;
        }

        self.is_coord_generating(min_coord, max_coord)
    }

    fn is_coord_generating(&self, min_coord: IVec3, max_coord: IVec3) -> bool {
        if let Some(generator) = &self.pending_generator {
            if generator.contains_tile_in_bounds(min_coord, max_coord) {
                return true;
            }
        }

        if self
            .running_coords
            .iter()
            .any(|&c| coord_in_box(c, min_coord, max_coord))
        {
            return true;
        }

        // Completed generators count until their tiles are installed.
        self.completed
            .iter()
            .any(|g| g.contains_tile_in_bounds(min_coord, max_coord))
    }

    // -- dirty marking --------------------------------------------------------

    /// Turns dirty areas into pending tiles: expand by the gather padding,
    /// clip to inclusion/octree bounds, dedupe against the existing
    /// pending set, and re-sort by player distance.
    pub fn mark_dirty_areas(&mut self, octree: &EditableSvo, dirty_areas: &[DirtyArea]) {
        let octree_has_tiles = octree.num_tiles() != 0;
        let has_inclusion = !self.inclusion_bounds.is_empty();

        // Nothing to build and nothing to clear.
        if !has_inclusion && !octree_has_tiles {
            return;
        }

        let octree_bounds = octree.bounds();

        let mut total_nav_bounds = Aabb::EMPTY;
        for b in &self.inclusion_bounds {
            total_nav_bounds.union(b);
        }

        let mut dirty_coords: HashSet<IVec3> = HashSet::default();

        for area in dirty_areas {
            let is_navigation_bounds = area.flags.contains(DirtyFlags::NAVIGATION_BOUNDS);

            let mut adjusted = area.bounds.expand_by(self.config.bounds_padding);
            let mut needs_tile_intersection_test = false;

            if is_navigation_bounds {
                if !aabb_intersects_any(&adjusted, &self.inclusion_bounds) {
                    // Bounds that are gone; only tiles the octree actually
                    // has are worth clearing.
                    if !octree_has_tiles {
                        continue;
                    }
                    if !octree_bounds.intersects(&adjusted) {
                        continue;
                    }
                    adjusted = octree_bounds.overlap(&adjusted);
                }
            } else {
                if !has_inclusion || !total_nav_bounds.intersects(&adjusted) {
                    continue;
                }
                adjusted = total_nav_bounds.overlap(&adjusted);

                if !aabb_intersects_any(&adjusted, &self.inclusion_bounds) {
                    continue;
                }

                // Areas not fully inside an inclusion volume need per-tile
                // tests; there can be empty tiles under them.
                needs_tile_intersection_test = !aabbs_contain_aabb(&self.inclusion_bounds, &adjusted);
            }

            if adjusted.volume() <= 0.0 {
                continue;
            }

            let (min_coord, max_coord) = self
                .config
                .coords_for_bounds(&adjusted, self.config.tile_resolution());

            for coord in crate::morton::CoordBoxIter::new(min_coord, max_coord) {
                if dirty_coords.contains(&coord) {
                    continue;
                }

                if needs_tile_intersection_test {
                    let tile_bounds = self.config.tile_bounds(coord);
                    if !aabb_intersects_any(&tile_bounds, &self.inclusion_bounds) {
                        continue;
                    }
                }

                dirty_coords.insert(coord);
            }
        }

        if dirty_coords.is_empty() {
            return;
        }

        // Merge the current pending list into the new set, then rebuild it.
        for tile in &self.pending_tiles {
            dirty_coords.insert(tile.coord);
        }

        self.pending_tiles.clear();
        self.pending_tiles.extend(dirty_coords.into_iter().map(|coord| PendingTile {
            coord,
            seed_distance_sq: f32::MAX,
        }));

        self.sort_pending_tiles();

        debug!(pending = self.pending_tiles.len(), "marked dirty tiles");
    }

    fn sort_pending_tiles(&mut self) {
        let seeds: &[Vec3] = if self.player_locations.is_empty() {
            &[Vec3::ZERO]
        } else {
            &self.player_locations
        };

        for tile in &mut self.pending_tiles {
            let center = self.config.tile_coord_to_location(tile.coord);

            tile.seed_distance_sq = seeds
                .iter()
                .map(|s| s.distance_squared(center))
                .fold(f32::MAX, f32::min);
        }

        // Nearest tiles at the end of the list, where they pop first.
        self.pending_tiles
            .sort_by(|a, b| b.seed_distance_sq.total_cmp(&a.seed_distance_sq));
    }

    // -- per-frame tick -------------------------------------------------------

    /// One scheduler step: drain completed generators into the octree,
    /// feed and dispatch the pending generator, all inside the per-tick
    /// budget. Returns the number of tiles installed.
    pub fn tick(&mut self, octree: &mut EditableSvo) -> u32 {
        let boost = generation_boost_mode();

        let mut max_tasks = if boost {
            self.sched.boost_max_tasks
        } else {
            self.sched.max_tasks
        };

        // Gathering on the worker reads the geometry source concurrently
        // with the control thread; cap to one task in flight in that mode.
        if self.config.async_geometry_gathering {
            max_tasks = max_tasks.min(1);
        }
        let budget = if boost {
            self.sched.boost_max_time_per_tick
        } else {
            self.sched.max_time_per_tick
        };

        let tasks_to_submit = (max_tasks as usize).saturating_sub(self.num_running) as u32;
        let deadline = Instant::now() + budget;

        self.tick_inner(octree, tasks_to_submit, deadline)
    }

    fn tick_inner(&mut self, octree: &mut EditableSvo, max_tasks_to_submit: u32, deadline: Instant) -> u32 {
        debug_assert!(!octree.is_batch_editing());
        octree.begin_batch_edit();

        if let Some(generator) = &mut self.pending_generator {
            generator.pending_ticks += 1;
        }

        // Harvest worker completions.
        while let Ok(done) = self.rx_done.try_recv() {
            self.num_running = self.num_running.saturating_sub(1);

            for coord in done.generator.tile_coords() {
                self.running_coords.remove(&coord);
            }

            if done.canceled {
                self.stats.tasks_canceled += 1;
                continue;
            }

            self.stats.tasks_completed += 1;
            self.completed.push_back(done.generator);
        }

        // Move completed tiles into the octree. The first generator always
        // lands at least one tile even when over budget, so a tight budget
        // cannot stall the pipeline.
        let mut installed = 0u32;

        while let Some(mut generator) = self.completed.pop_front() {
            while let Some(mut tile) = generator.next_generated_tile() {
                octree.assume_tile(&mut tile, true);
                installed += 1;
                self.stats.tiles_installed += 1;

                if Instant::now() >= deadline {
                    break;
                }
            }

            if generator.has_generated_tiles() {
                // Budget ran out mid-generator; it resumes next tick and
                // still counts as generating until drained.
                self.completed.push_front(generator);
                break;
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        // Feed pending tiles into a generator and dispatch. Runs after the
        // merge so completed work lands before new work is kicked off.
        self.process_pending_tiles(octree, max_tasks_to_submit, deadline);

        debug_assert!(octree.is_batch_editing());
        octree.end_batch_edit();

        installed
    }

    fn process_pending_tiles(&mut self, octree: &mut EditableSvo, max_tasks_to_submit: u32, deadline: Instant) {
        let mut num_submitted = 0u32;
        let mut num_building = 0usize;

        let mut idx = self.pending_tiles.len();
        while idx > 0 {
            idx -= 1;

            let pending_full = self
                .pending_generator
                .as_ref()
                .is_some_and(|g| g.tri_count >= self.sched.max_tris_per_task);

            // A full generator with no dispatch budget left means no more
            // tiles can go anywhere this tick.
            if pending_full && num_submitted >= max_tasks_to_submit {
                break;
            }

            let coord = self.pending_tiles[idx].coord;

            // Already being generated; it re-queues if still dirty after
            // that build lands.
            if self.is_coord_generating(coord, coord) {
                num_building += 1;
                continue;
            }

            if self.pending_generator.is_none() {
                self.pending_generator = Some(Box::new(TileGenerator::new(
                    self.config.clone(),
                    self.geometry.clone(),
                    self.inclusion_bounds.clone(),
                )));
            }

            if !pending_full {
                let generator = self.pending_generator.as_mut().unwrap();

                if !generator.add_tile(coord) {
                    // Nothing to build here; make sure stale data goes too.
                    octree.remove_tile_at_coord(coord);
                }

                self.pending_tiles.remove(idx);
            }

            if Instant::now() >= deadline {
                break;
            }

            if num_submitted < max_tasks_to_submit && self.try_run_pending_generator(false) {
                num_submitted += 1;
            }

            if num_submitted >= max_tasks_to_submit {
                break;
            }
        }

        if num_submitted < max_tasks_to_submit {
            // Everything left may already be building elsewhere; don't let
            // a partially filled generator starve.
            let all_pending_building = self.pending_tiles.len() == num_building;
            self.try_run_pending_generator(all_pending_building);
        }
    }

    fn try_run_pending_generator(&mut self, force_start: bool) -> bool {
        let Some(generator) = self.pending_generator.as_ref() else {
            return false;
        };

        if !generator.has_tiles() {
            self.pending_generator = None;
            return false;
        }

        let ready = force_start
            || generator.tri_count >= self.sched.max_tris_per_task
            || self.pending_tiles.is_empty()
            || generator.pending_ticks > self.sched.max_pending_ticks;

        if !ready {
            return false;
        }

        let generator = self.pending_generator.take().unwrap();
        for coord in generator.tile_coords() {
            self.running_coords.insert(coord);
        }

        self.stats.tasks_submitted += 1;
        self.num_running += 1;

        self.tx_job
            .send(BuildJob {
                generator,
                cancel: self.cancel.clone(),
            })
            .expect("build workers alive");

        true
    }

    // -- blocking operations --------------------------------------------------

    /// Drops all queued work and blocks until in-flight workers finish,
    /// discarding their output. Safe to call at any time.
    pub fn cancel_build(&mut self) {
        self.pending_tiles.clear();
        self.pending_generator = None;

        self.cancel.store(true, Ordering::Relaxed);

        while self.num_running > 0 {
            let done = self.rx_done.recv().expect("build workers alive");
            self.num_running -= 1;
            self.stats.tasks_canceled += 1;
            drop(done);
        }

        self.running_coords.clear();
        self.completed.clear();

        // Fresh token for future jobs.
        self.cancel = Arc::new(AtomicBool::new(false));
    }

    /// Runs the build to completion, blocking on workers as needed.
    pub fn ensure_build_completion(&mut self, octree: &mut EditableSvo) {
        loop {
            let far_deadline = Instant::now() + Duration::from_secs(3600);
            self.tick_inner(octree, 16, far_deadline);

            if !self.is_build_in_progress() {
                break;
            }

            if self.num_running > 0 {
                // Block for one completion, then let the next tick merge it.
                let done = self.rx_done.recv().expect("build workers alive");
                self.num_running -= 1;

                for coord in done.generator.tile_coords() {
                    self.running_coords.remove(&coord);
                }

                if done.canceled {
                    self.stats.tasks_canceled += 1;
                } else {
                    self.stats.tasks_completed += 1;
                    self.completed.push_back(done.generator);
                }
            }
        }
    }
}

#[inline]
fn coord_in_box(coord: IVec3, min: IVec3, max: IVec3) -> bool {
    coord.x >= min.x
        && coord.x <= max.x
        && coord.y >= min.y
        && coord.y <= max.y
        && coord.z >= min.z
        && coord.z <= max.z
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SvoConfig;
    use crate::geom::Triangle;

    struct FloorSource;

    impl GeometrySource for FloorSource {
        fn gather_triangles(&self, bounds: &Aabb, out: &mut Vec<Triangle>) {
            let e = 2000.0;
            let quads = [
                Triangle {
                    v0: Vec3::new(-e, -e, 100.0),
                    v1: Vec3::new(e, -e, 100.0),
                    v2: Vec3::new(e, e, 100.0),
                },
                Triangle {
                    v0: Vec3::new(-e, -e, 100.0),
                    v1: Vec3::new(e, e, 100.0),
                    v2: Vec3::new(-e, e, 100.0),
                },
            ];
            for tri in quads {
                if tri.bounds().intersects(bounds) {
                    out.push(tri);
                }
            }
        }
    }

    fn setup() -> (BuildScheduler, EditableSvo) {
        let svo_config = SvoConfig::new(Vec3::ZERO, 32.0, 64, 1);
        let gen_config = GeneratorConfig::new(svo_config.clone(), 32.0, 64.0);
        let scheduler = BuildScheduler::new(gen_config, SchedulerConfig::default(), Arc::new(FloorSource));
        let octree = EditableSvo::new(svo_config);
        (scheduler, octree)
    }

    fn dirty_everything(scheduler: &mut BuildScheduler, octree: &EditableSvo, bounds: Aabb) {
        scheduler.set_inclusion_bounds(vec![bounds]);
        scheduler.mark_dirty_areas(
            octree,
            &[DirtyArea {
                bounds,
                flags: DirtyFlags::ALL,
            }],
        );
    }

    #[test]
    fn build_installs_tiles() {
        let (mut scheduler, mut octree) = setup();

        let bounds = Aabb::new(Vec3::new(0.0, 0.0, 0.0), Vec3::splat(512.0));
        dirty_everything(&mut scheduler, &octree, bounds);

        assert!(scheduler.is_build_in_progress());

        scheduler.ensure_build_completion(&mut octree);

        assert!(!scheduler.is_build_in_progress());
        assert!(octree.num_tiles() > 0);
        octree.verify_node_data(true);

        // The floor at z=100 cuts through tile (0,0,0): its contents must
        // not be uniformly open.
        let tile = octree.tile_at_coord(IVec3::ZERO).expect("tile built");
        assert_eq!(
            tile.node_info().node_state(),
            crate::svo::node::NodeState::PartiallyBlocked
        );
    }

    #[test]
    fn zero_budget_still_makes_progress() {
        let (mut scheduler, mut octree) = setup();
        scheduler.sched.max_time_per_tick = Duration::ZERO;

        let bounds = Aabb::new(Vec3::ZERO, Vec3::splat(512.0));
        dirty_everything(&mut scheduler, &octree, bounds);

        // Tick until the workers have had a chance to run; a zero budget
        // must still land at least one tile per tick once work completes.
        let mut installed = 0;
        for _ in 0..200 {
            installed += scheduler.tick(&mut octree);
            if !scheduler.is_build_in_progress() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(installed > 0);
        octree.verify_node_data(true);
    }

    #[test]
    fn cancel_is_safe_at_any_time() {
        let (mut scheduler, mut octree) = setup();

        let bounds = Aabb::new(Vec3::ZERO, Vec3::splat(1024.0));
        dirty_everything(&mut scheduler, &octree, bounds);

        scheduler.tick(&mut octree);
        scheduler.cancel_build();

        assert!(!scheduler.is_build_in_progress());
        octree.verify_node_data(true);

        // A fresh build still works after cancellation.
        dirty_everything(&mut scheduler, &octree, bounds);
        scheduler.ensure_build_completion(&mut octree);
        assert!(octree.num_tiles() > 0);
    }

    #[test]
    fn dirty_areas_outside_inclusion_are_dropped() {
        let (mut scheduler, octree) = setup();

        scheduler.set_inclusion_bounds(vec![Aabb::new(Vec3::ZERO, Vec3::splat(256.0))]);
        scheduler.mark_dirty_areas(
            &octree,
            &[DirtyArea {
                bounds: Aabb::new(Vec3::splat(10_000.0), Vec3::splat(11_000.0)),
                flags: DirtyFlags::GEOMETRY,
            }],
        );

        assert!(!scheduler.is_build_in_progress());
    }

    #[test]
    fn nearest_tiles_pop_first() {
        let (mut scheduler, octree) = setup();

        scheduler.set_player_locations(&[Vec3::new(1000.0, 0.0, 0.0)]);
        scheduler.set_inclusion_bounds(vec![Aabb::new(Vec3::ZERO, Vec3::new(2048.0, 256.0, 256.0))]);
        scheduler.mark_dirty_areas(
            &octree,
            &[DirtyArea {
                bounds: Aabb::new(Vec3::ZERO, Vec3::new(2048.0, 256.0, 256.0)),
                flags: DirtyFlags::ALL,
            }],
        );

        let last = scheduler.pending_tiles.last().expect("pending tiles");
        let first = scheduler.pending_tiles.first().unwrap();

        // Back of the list (popped first) is nearest to the player.
        assert!(last.seed_distance_sq <= first.seed_distance_sq);
    }
}
