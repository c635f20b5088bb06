//! Save batches.
//!
//! Dirty outdoor chunks are worked through row by row, a few at a time:
//! each active chunk is loaded, locked and recalculated, and whatever the
//! finished chunks left unsaved is written out as soon as one of them is
//! clean. Indoor chunks wait until an outdoor chunk they overlap is done.
//! With progressive unloading, rows well behind the current one are handed
//! to `ProcessorHooks::unload_chunks_outside_grid_box`.

use std::collections::{BTreeSet, VecDeque};
use std::thread;
use std::time::Duration;

use fnv::FnvHashSet;

use super::schedule::needs_processing;
use super::ChunkProcessorManager;
use crate::error::Result;
use crate::holder::ScopedLockedChunkHolder;
use crate::unsaved::{ChunkSaver, NullProgress, Progress};
use crate::world::GridBox;
use crate::ChunkId;

/// Passes with nothing loading, running, starting or finishing before a
/// batch gives up.
const SAVE_STALL_LIMIT: usize = 1000;

impl ChunkProcessorManager {
    /// Process and save the named chunks. Chunks in the clean list are
    /// skipped without being loaded.
    ///
    /// Returns false if anything failed to save or a chunk never finished
    /// processing. Cancelling through `progress` stops early and isn't a
    /// failure.
    pub fn save_chunks(
        &mut self,
        chunks_to_save: &BTreeSet<String>,
        chunk_saver: &mut dyn ChunkSaver,
        thumbnail_saver: &mut dyn ChunkSaver,
        progress: &mut dyn Progress,
        progressive_unloading: bool,
    ) -> Result<bool> {
        self.check_main_thread()?;
        let mut ok = true;

        // already resident (or locked by running work): never unloaded early
        let mut keep = FnvHashSet::default();
        for identifier in chunks_to_save {
            match self.world.find(identifier) {
                Some(id) => {
                    let c = self.world.chunk(id);
                    if c.file_exists() && c.is_resident() && !self.clean_list.is_clean(identifier) {
                        keep.insert(id);
                    }
                }
                None => {
                    warn!("cannot save unknown chunk '{}'", identifier);
                    ok = false;
                }
            }
        }
        keep.extend(self.locked.snapshot());

        self.clean_list.sync(&self.world, &self.dirty_lists, progress);
        if progress.is_cancelled() {
            self.write_clean_list();
            return Ok(ok);
        }

        let (outdoor, mut pending_indoor) = self.find_dirty_chunks(chunks_to_save);
        let mut pending: VecDeque<ChunkId> = self.world.sorted_by_scanline(outdoor).into_iter().collect();

        let max_jobs = self.num_running_threads() + self.config.save_batch_slack;
        let total = pending.len() + pending_indoor.len();
        progress.name("Saving chunks");
        progress.length(total);
        info!("saving {} chunks, {} of them indoor", total, pending_indoor.len());

        let mut active = ScopedLockedChunkHolder::new(self.locked.clone());
        let mut current_z = i32::min_value();
        let mut stalled = 0;
        let mut cancelled = false;

        while !pending.is_empty() || !active.is_empty() {
            let mut progressed = self.tick();
            self.hooks.tick_saving_chunks();
            if progress.is_cancelled() {
                info!("save cancelled with {} chunks left", pending.len() + active.len());
                cancelled = true;
                break;
            }
            progress.set(total.saturating_sub(pending.len() + pending_indoor.len() + active.len()));

            if self.needs_unload() {
                self.unload_removable_chunks();
            }

            if self.num_bg_tasks_left() > max_jobs {
                thread::sleep(Duration::from_millis(1));
                continue;
            }

            if active.len() < max_jobs && !pending.is_empty() {
                ok &= self.take_chunk_lock(&mut pending, &mut active);
                progressed = true;
            }

            let (all_dirty, started) = self.process_active_chunks(&active);
            progressed |= started;
            if !all_dirty {
                ok &= self.save_all_unsaved(chunk_saver, thumbnail_saver);
            }

            progressed |= self.process_pending_indoor_chunks(&active, &mut pending, &mut pending_indoor) > 0;

            if progressive_unloading {
                self.unload_behind_scanline(&active, &mut current_z, &keep);
            }

            progressed |= self.remove_finished_chunks(&mut active) > 0;

            if progressed {
                stalled = 0;
            } else if self.has_tasks() {
                thread::sleep(Duration::from_millis(1));
            } else {
                stalled += 1;
                if stalled >= SAVE_STALL_LIMIT {
                    warn!("save batch stalled with {} chunks still dirty", active.len());
                    ok = false;
                    break;
                }
            }
        }

        for &indoor in &pending_indoor {
            warn!(
                "unreferenced indoor chunk '{}' found, consider deleting it",
                self.world.chunk(indoor).identifier()
            );
        }
        if !cancelled && !self.unsaved.is_empty() {
            ok &= self.save_all_unsaved(chunk_saver, thumbnail_saver);
        }
        self.write_clean_list();
        Ok(ok)
    }

    /// Split the named chunks that may need work into outdoor and indoor.
    pub(crate) fn find_dirty_chunks(&self, chunks_to_save: &BTreeSet<String>) -> (Vec<ChunkId>, Vec<ChunkId>) {
        let mut outdoor = Vec::new();
        let mut indoor = Vec::new();
        for identifier in chunks_to_save {
            let id = match self.world.find(identifier) {
                Some(id) => id,
                None => continue,
            };
            let c = self.world.chunk(id);
            if !c.file_exists() || self.clean_list.is_clean(identifier) || !self.is_chunk_editable(id) {
                continue;
            }
            if c.is_outside_chunk() {
                outdoor.push(id);
            } else {
                indoor.push(id);
            }
        }
        (outdoor, indoor)
    }

    /// Move the next pending chunk into the active set. Returns false if it
    /// couldn't be loaded and locked.
    pub(crate) fn take_chunk_lock(&mut self, pending: &mut VecDeque<ChunkId>, active: &mut ScopedLockedChunkHolder) -> bool {
        match pending.pop_front() {
            Some(chunk) if !self.load_and_lock_chunk_in_memory(chunk, active) => {
                warn!("cannot load {} for saving", self.world.chunk(chunk).identifier());
                false
            }
            _ => true,
        }
    }

    /// Start recalculating every loaded active chunk. Returns whether all of
    /// them are still dirty, and whether anything was started.
    pub(crate) fn process_active_chunks(&mut self, active: &ScopedLockedChunkHolder) -> (bool, bool) {
        let mut all_dirty = true;
        let mut started = false;
        let chunks: Vec<ChunkId> = active.iter().cloned().collect();
        for chunk in chunks {
            if !self.world.chunk(chunk).is_ready() {
                continue;
            }
            started |= self.process_active_chunk(chunk);
            all_dirty &= self.world.chunk(chunk).dirty();
        }
        (all_dirty, started)
    }

    pub(crate) fn process_active_chunk(&mut self, chunk: ChunkId) -> bool {
        let mut started = false;
        for index in self.cache_indices(chunk) {
            started |= self
                .with_cache_mut(chunk, index, |cache, manager| {
                    if !needs_processing(cache) || cache.is_being_calculated() {
                        return false;
                    }
                    cache.load_chunk_for_calculate(manager, chunk);
                    cache.ready_to_calculate(manager, chunk) && cache.recalc(manager, chunk)
                })
                .unwrap_or(false);
        }
        started
    }

    /// Promote pending indoor chunks overlapping a finished outdoor chunk to
    /// the front of the queue. Returns how many moved.
    pub(crate) fn process_pending_indoor_chunks(
        &self,
        active: &ScopedLockedChunkHolder,
        pending: &mut VecDeque<ChunkId>,
        pending_indoor: &mut Vec<ChunkId>,
    ) -> usize {
        let mut promoted = 0;
        for &chunk in active {
            let c = self.world.chunk(chunk);
            if !c.is_outside_chunk() || !c.is_bound() || c.dirty() {
                continue;
            }
            for overlapper in c.overlappers() {
                if let Some(position) = pending_indoor.iter().position(|p| p == overlapper) {
                    pending_indoor.remove(position);
                    pending.push_front(*overlapper);
                    promoted += 1;
                }
            }
        }
        promoted
    }

    fn unload_behind_scanline(
        &mut self,
        active: &ScopedLockedChunkHolder,
        current_z: &mut i32,
        keep: &FnvHashSet<ChunkId>,
    ) {
        let world = &self.world;
        let next = active.iter().filter_map(|&chunk| {
            let c = world.chunk(chunk);
            match c.grid() {
                Some(grid) if c.is_bound() && !c.dirty() && i32::from(grid.y) > *current_z => {
                    Some(i32::from(grid.y))
                }
                _ => None,
            }
        });
        let z = match next.min() {
            Some(z) => z,
            None => return,
        };

        *current_z = z;
        let bounds = self.world.bounds();
        let grid_box = GridBox::new(bounds.min_x, bounds.max_x, z - 1, bounds.max_z);
        debug!("save scanline reached row {}", z);
        self.hooks
            .unload_chunks_outside_grid_box(&mut self.world, &self.locked, grid_box, keep);
    }

    /// Drop active chunks that are bound and clean. Returns how many.
    pub(crate) fn remove_finished_chunks(&mut self, active: &mut ScopedLockedChunkHolder) -> usize {
        let finished: Vec<ChunkId> = active
            .iter()
            .cloned()
            .filter(|&chunk| {
                let c = self.world.chunk(chunk);
                c.is_bound() && !c.dirty()
            })
            .collect();
        for &chunk in &finished {
            if let Err(e) = active.erase(chunk) {
                error!("finishing {}: {}", self.world.chunk(chunk).identifier(), e);
            }
            if self.is_chunk_editable(chunk) {
                self.on_chunk_dirty_status_changed(chunk);
            }
        }
        finished.len()
    }

    /// Write every unsaved terrain block, chunk and cdata, then forget them
    /// all, failed or not. Cdata of chunks written in full isn't written
    /// again.
    pub fn save_all_unsaved(&mut self, chunk_saver: &mut dyn ChunkSaver, thumbnail_saver: &mut dyn ChunkSaver) -> bool {
        let mut progress = NullProgress;
        let mut ok = self.unsaved.terrain_blocks.save(&mut progress);
        ok &= self.unsaved.chunks.save(&mut self.world, chunk_saver, &mut progress, &[]);
        self.unsaved.cdatas.filter(&self.unsaved.chunks);
        ok &= self.unsaved.cdatas.save(&mut self.world, thumbnail_saver, &mut progress, &[]);
        if !ok {
            warn!("some unsaved chunk data failed to write and was dropped");
        }
        self.clear_unsaved_data();
        ok
    }
}
