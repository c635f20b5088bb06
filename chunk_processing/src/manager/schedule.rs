//! Picking which dirty cache to recalculate next.

use std::thread;
use std::time::Duration;

use cgmath::InnerSpace;
use fnv::FnvHashSet;

use super::ChunkProcessorManager;
use crate::cache::{CacheIndex, ChunkCache};
use crate::error::Result;
use crate::unsaved::Progress;
use crate::{ChunkId, Coord};

/// Passes `process_chunk` makes with nothing loading, running or starting
/// before it gives up on a chunk.
const PROCESS_CHUNK_STALL_LIMIT: usize = 64;

/// How long `process_chunk` waits for outstanding tasks once the chunk is
/// clean.
const PROCESS_CHUNK_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy)]
enum Wants {
    Background,
    MainThread,
}

fn eligible(cache: &dyn ChunkCache, wants: Wants, manager: &ChunkProcessorManager, chunk: ChunkId) -> bool {
    let wanted = match wants {
        Wants::Background => cache.require_processing_in_background(),
        Wants::MainThread => cache.require_processing_in_main_thread(),
    };
    cache.dirty() && wanted && cache.ready_to_calculate(manager, chunk) && !cache.is_being_calculated()
}

pub(super) fn needs_processing(cache: &dyn ChunkCache) -> bool {
    cache.dirty() && (cache.require_processing_in_background() || cache.require_processing_in_main_thread())
}

impl ChunkProcessorManager {
    fn eligible_caches(&self, chunk: ChunkId, wants: Wants) -> Vec<CacheIndex> {
        let c = self.world.chunk(chunk);
        self.cache_indices(chunk)
            .into_iter()
            .filter(|&index| c.cache(index).map_or(false, |cache| eligible(cache, wants, self, chunk)))
            .collect()
    }

    fn is_schedulable(&self, chunk: ChunkId) -> bool {
        self.world.chunk(chunk).is_bound() && self.is_chunk_editable(chunk)
    }

    /// Recalculate the first dirty main-thread cache that is ready and not
    /// already being calculated. Returns whether one was started.
    pub fn process_main_thread_task(&mut self) -> bool {
        let lists = self.dirty_lists.clone();
        let _held = lists.hold();
        for chunk in lists.main_thread_candidates() {
            if !self.is_schedulable(chunk) {
                continue;
            }
            if let Some(&index) = self.eligible_caches(chunk, Wants::MainThread).first() {
                trace!("main thread recalc of {}", self.world.chunk(chunk).identifier());
                self.with_cache_mut(chunk, index, |cache, manager| cache.recalc(manager, chunk));
                return true;
            }
        }
        false
    }

    /// Recalculate the background caches of the dirty chunk nearest to
    /// `focus`. Outdoor chunks are ranked by horizontal distance only.
    /// Returns whether anything was started.
    pub fn process_background_task(&mut self, focus: Coord, excluded: &FnvHashSet<ChunkId>) -> bool {
        let lists = self.dirty_lists.clone();
        let _held = lists.hold();

        let mut nearest = None;
        let mut best = ::std::f32::MAX;
        for chunk in lists.background_candidates() {
            let c = self.world.chunk(chunk);
            let offset = c.centre() - focus;
            let distance = if c.is_outside_chunk() {
                offset.x * offset.x + offset.z * offset.z
            } else {
                offset.magnitude2()
            };
            if distance >= best || excluded.contains(&chunk) || !self.is_schedulable(chunk) {
                continue;
            }
            if !self.eligible_caches(chunk, Wants::Background).is_empty() {
                best = distance;
                nearest = Some(chunk);
            }
        }

        let chunk = match nearest {
            Some(chunk) => chunk,
            None => return false,
        };
        debug!("background recalc of {}", self.world.chunk(chunk).identifier());
        let mut started = false;
        for index in self.eligible_caches(chunk, Wants::Background) {
            started |= self
                .with_cache_mut(chunk, index, |cache, manager| cache.recalc(manager, chunk))
                .unwrap_or(false);
        }
        started
    }

    /// Load `chunk`, recalculate its caches until they are all clean, wait
    /// for every task and queue the chunk for saving.
    ///
    /// Returns false if the chunk couldn't be bound, stopped making
    /// progress or its tasks didn't finish in time.
    pub fn process_chunk(&mut self, chunk: ChunkId) -> Result<bool> {
        self.check_main_thread()?;
        if !self.world.chunk(chunk).is_ready() {
            self.world.load_now(chunk);
            self.world.process_pending_loads();
        }
        if !self.world.chunk(chunk).is_bound() {
            warn!(
                "chunk {} is marked as dirty, but isn't bound",
                self.world.chunk(chunk).identifier()
            );
            return Ok(false);
        }

        let mut stalled = 0;
        loop {
            let mut dirty = false;
            let mut started = false;
            for index in self.cache_indices(chunk) {
                let (cache_dirty, cache_started) = self
                    .with_cache_mut(chunk, index, |cache, manager| {
                        if !needs_processing(cache) {
                            return (false, false);
                        }
                        let start = !cache.is_being_calculated()
                            && cache.load_chunk_for_calculate(manager, chunk)
                            && cache.ready_to_calculate(manager, chunk);
                        (true, start && cache.recalc(manager, chunk))
                    })
                    .unwrap_or((false, false));
                dirty |= cache_dirty;
                started |= cache_started;
            }
            let ticked = self.tick();
            if !dirty {
                break;
            }

            if ticked || started {
                stalled = 0;
            } else if self.has_tasks() {
                thread::sleep(Duration::from_millis(1));
            } else {
                stalled += 1;
                if stalled >= PROCESS_CHUNK_STALL_LIMIT {
                    warn!(
                        "giving up on {}: its caches stay dirty",
                        self.world.chunk(chunk).identifier()
                    );
                    return Ok(false);
                }
            }
        }

        self.unsaved.chunks.add(chunk);
        Ok(self.drain(PROCESS_CHUNK_DRAIN_TIMEOUT))
    }

    /// Mark every cache of every editable chunk in the space out of date.
    /// With `navmesh_only`, only the configured navmesh cache is touched.
    ///
    /// Returns false if cancelled through `progress`.
    pub fn invalidate_all_chunks(&mut self, progress: &mut dyn Progress, navmesh_only: bool) -> bool {
        let identifiers = self.world.gather_chunks();
        progress.name("Invalidating all chunks");
        progress.length(identifiers.len());

        for (position, identifier) in identifiers.iter().enumerate() {
            let chunk = match self.world.find(identifier) {
                Some(chunk) => chunk,
                None => continue,
            };
            if self.is_chunk_editable(chunk) {
                if progress.is_cancelled() {
                    info!("invalidating chunks cancelled after {}", position);
                    return false;
                }
                let indices: Vec<CacheIndex> = if navmesh_only {
                    let has = |index: &CacheIndex| self.world.chunk(chunk).cache(*index).is_some();
                    self.config.navmesh_cache.into_iter().filter(has).collect()
                } else {
                    self.cache_indices(chunk)
                };
                for index in indices {
                    self.invalidate_cache(chunk, index, false, None);
                }
                self.clean_list.update(identifier, true);
            }
            progress.set(position + 1);
        }
        true
    }
}
