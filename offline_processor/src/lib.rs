//! Headless chunk processing for a whole space.
//!
//! Unlike the editor, the offline processor walks every chunk of a space, so
//! it unloads rows it is done with as the save batch moves across the grid,
//! and treats a space with too many bound chunks as low on memory.
//!
//! A space can be split over a cluster of machines. Each member only edits
//! the grid columns it owns: column `x` belongs to member
//! `x mod cluster_size`.

#[macro_use]
extern crate log;
extern crate chunk_processing;
extern crate fnv;
extern crate parking_lot;

use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashSet;
use parking_lot::Mutex;

pub use chunk_processing::*;

/// Bound chunks allowed before memory counts as low.
pub const DEFAULT_MEMORY_BUDGET: usize = 4096;

/// How long to wait for the last tasks of a space before stopping workers.
const FINISH_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfflineConfig {
    /// Bound chunks allowed before memory counts as low.
    pub memory_budget: usize,
    /// Machines sharing the space.
    pub cluster_size: usize,
    /// This machine's place in the cluster, from 0.
    pub cluster_index: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        OfflineConfig {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            cluster_size: 1,
            cluster_index: 0,
        }
    }
}

pub struct OfflineHooks {
    pub memory_budget: usize,
    cluster_size: usize,
    cluster_index: usize,
    clean_list: Arc<Mutex<Vec<String>>>,
}

impl OfflineHooks {
    /// A cluster size of 0 counts as 1, and the index is clamped to the
    /// last member.
    pub fn new(config: &OfflineConfig) -> Self {
        let cluster_size = config.cluster_size.max(1);
        let cluster_index = config.cluster_index.min(cluster_size - 1);
        if cluster_index != config.cluster_index {
            warn!(
                "cluster index {} out of range for {} members, using {}",
                config.cluster_index, cluster_size, cluster_index
            );
        }
        OfflineHooks {
            memory_budget: config.memory_budget,
            cluster_size,
            cluster_index,
            clean_list: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether grid column `x` belongs to this cluster member.
    pub fn owns_column(&self, x: i16) -> bool {
        i64::from(x).rem_euclid(self.cluster_size as i64) == self.cluster_index as i64
    }

    /// The identifiers most recently written as clean.
    pub fn written_clean_list(&self) -> Arc<Mutex<Vec<String>>> {
        self.clean_list.clone()
    }
}

impl ProcessorHooks for OfflineHooks {
    fn is_memory_low(&self, world: &ChunkWorld) -> bool {
        world.count_in_state(LoadState::Bound) > self.memory_budget
    }

    /// Indoor chunks go with the cell their centre lies in.
    fn is_chunk_editable(&self, chunk: &Chunk) -> bool {
        let grid = chunk.grid().unwrap_or_else(|| grid_of(chunk.centre()));
        self.owns_column(grid.x)
    }

    fn unload_chunks_outside_grid_box(
        &mut self,
        world: &mut ChunkWorld,
        locked: &LockedChunks,
        grid_box: GridBox,
        keep: &FnvHashSet<ChunkId>,
    ) {
        let marked = world.mark_removable_outside(grid_box, keep);
        let unloaded = world.unload_removable(locked);
        debug!(
            "outside rows {}..={}: {} marked, {} unloaded",
            grid_box.min_z, grid_box.max_z, marked, unloaded
        );
    }

    fn write_clean_list(&mut self, clean: &CleanChunkList) {
        let identifiers: Vec<String> = clean.identifiers().into_iter().map(str::to_string).collect();
        info!("{} chunks clean", identifiers.len());
        *self.clean_list.lock() = identifiers;
    }
}

pub struct OfflineProcessor {
    manager: ChunkProcessorManager,
    clean_list: Arc<Mutex<Vec<String>>>,
    threads: usize,
}

impl OfflineProcessor {
    pub fn new(world: ChunkWorld, config: ManagerConfig, offline: OfflineConfig) -> Self {
        let hooks = OfflineHooks::new(&offline);
        let clean_list = hooks.written_clean_list();
        let threads = config.threads;
        OfflineProcessor {
            manager: ChunkProcessorManager::with_hooks(world, config, Box::new(hooks)),
            clean_list,
            threads,
        }
    }

    pub fn manager(&self) -> &ChunkProcessorManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ChunkProcessorManager {
        &mut self.manager
    }

    /// Identifiers written out as clean by the last batch.
    pub fn clean_chunks(&self) -> Vec<String> {
        self.clean_list.lock().clone()
    }

    /// Bring every chunk of the space this member owns up to date and save
    /// it, then stop the workers.
    ///
    /// With `overwrite`, navmeshes are rebuilt everywhere, not only where
    /// they are dirty. Returns false if cancelled or if anything failed.
    pub fn process_space(
        &mut self,
        chunk_saver: &mut dyn ChunkSaver,
        thumbnail_saver: &mut dyn ChunkSaver,
        progress: &mut dyn Progress,
        overwrite: bool,
    ) -> Result<bool> {
        let running = self.manager.num_running_threads();
        if running < self.threads {
            self.manager.start_num_threads(self.threads - running);
        }
        if overwrite && !self.manager.invalidate_all_chunks(progress, true) {
            info!("processing cancelled while invalidating");
            return Ok(false);
        }
        let chunks = self.manager.world().gather_chunks();
        info!("processing {} chunks", chunks.len());
        let saved = self
            .manager
            .save_chunks(&chunks, chunk_saver, thumbnail_saver, progress, true);
        let finished = self.manager.drain(FINISH_TIMEOUT);
        self.manager.stop_all(false, true);
        let saved = saved? && finished;
        if !saved {
            warn!("space processed with errors");
        }
        Ok(saved)
    }
}
