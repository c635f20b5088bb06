//! Neighbour discovery: grid expansion around outdoor chunks and portal
//! traversal between chunks. Main thread only.

use std::collections::{BTreeSet, VecDeque};

use fnv::FnvHashSet;

use super::ChunkProcessorManager;
use crate::cache::CacheIndex;
use crate::error::{ChunkError, Result};
use crate::holder::ScopedLockedChunkHolder;
use crate::world::{Chunk, ChunkKind};
use crate::ChunkId;

impl ChunkProcessorManager {
    /// The outdoor chunks within `expand_x`/`expand_z` cells of `chunk`, and
    /// every indoor chunk overlapping them. An indoor `chunk` expands around
    /// each outdoor chunk it overlaps.
    pub fn grid_neighbour_set(&self, chunk: ChunkId, expand_x: i32, expand_z: i32) -> BTreeSet<ChunkId> {
        let mut set = BTreeSet::new();
        let c = self.world.chunk(chunk);
        match c.kind() {
            ChunkKind::Outdoor(grid) => {
                for cell in self.world.grid_neighbourhood(grid, expand_x, expand_z) {
                    set.insert(cell);
                    set.extend(self.world.chunk(cell).overlappers().iter().cloned());
                }
            }
            ChunkKind::Indoor => {
                set.insert(chunk);
                for &outdoor in c.overlapped() {
                    set.extend(self.grid_neighbour_set(outdoor, expand_x, expand_z));
                }
            }
        }
        set
    }

    /// Chunks reachable from `chunk` through at most `portal_depth` portals,
    /// crossing only into chunks accepted by `passable`. A negative depth is
    /// unbounded. Breadth first, in portal order.
    pub(crate) fn portal_neighbour_set<F>(&self, chunk: ChunkId, portal_depth: i32, passable: F) -> Vec<ChunkId>
    where
        F: Fn(&Chunk) -> bool,
    {
        let mut visited = FnvHashSet::default();
        let mut found = Vec::new();
        let mut queue = VecDeque::new();
        visited.insert(chunk);
        queue.push_back((chunk, portal_depth));

        while let Some((id, depth)) = queue.pop_front() {
            found.push(id);
            if depth == 0 {
                continue;
            }
            for &next in self.world.chunk(id).portals() {
                if !passable(self.world.chunk(next)) || !visited.insert(next) {
                    continue;
                }
                queue.push_back((next, depth - 1));
            }
        }
        found
    }

    /// Whether `chunk` and everything in its grid neighbourhood is fully
    /// loaded. Doesn't change any state.
    pub fn is_chunk_ready_to_process(&self, chunk: ChunkId, expand_x: i32, expand_z: i32) -> bool {
        self.grid_neighbour_set(chunk, expand_x, expand_z)
            .iter()
            .all(|&id| self.world.chunk(id).is_ready())
    }

    pub fn is_chunk_ready_to_process_portals(&self, chunk: ChunkId, portal_depth: i32) -> bool {
        self.portal_neighbour_set(chunk, portal_depth, |_| true)
            .iter()
            .all(|&id| self.world.chunk(id).is_ready())
    }

    /// Start loading `chunk` and its grid neighbourhood. Returns whether
    /// every chunk is loaded or now loading, not whether loading finished.
    pub fn load_chunk_for_processing(&mut self, chunk: ChunkId, expand_x: i32, expand_z: i32) -> Result<bool> {
        self.check_main_thread()?;
        let set = self.grid_neighbour_set(chunk, expand_x, expand_z);
        Ok(self.request_loads(set))
    }

    pub fn load_chunk_for_processing_portals(&mut self, chunk: ChunkId, portal_depth: i32) -> Result<bool> {
        self.check_main_thread()?;
        let mut set: BTreeSet<ChunkId> = self
            .portal_neighbour_set(chunk, portal_depth, |_| true)
            .into_iter()
            .collect();
        let overlappers: Vec<ChunkId> = set
            .iter()
            .flat_map(|&id| self.world.chunk(id).overlappers().iter().cloned())
            .collect();
        set.extend(overlappers);
        Ok(self.request_loads(set))
    }

    fn request_loads<I: IntoIterator<Item = ChunkId>>(&mut self, chunks: I) -> bool {
        let mut issued = true;
        for id in chunks {
            issued &= self.world.request_load(id);
        }
        issued
    }

    /// Lock `chunk` and its grid neighbourhood into `holder`.
    ///
    /// Every outdoor chunk in the neighbourhood must be loaded or loading;
    /// indoor overlappers that aren't are skipped. Nothing is locked on
    /// error.
    pub fn lock_chunk_in_memory(
        &self,
        chunk: ChunkId,
        expand_x: i32,
        expand_z: i32,
        holder: &mut ScopedLockedChunkHolder,
    ) -> Result<()> {
        self.check_main_thread()?;
        let mut to_lock = Vec::new();
        for id in self.grid_neighbour_set(chunk, expand_x, expand_z) {
            let c = self.world.chunk(id);
            if c.is_resident() {
                to_lock.push(id);
            } else if c.is_outside_chunk() || id == chunk {
                error!("cannot lock {} for processing: it isn't loaded", c.identifier());
                return Err(ChunkError::NotResident(id));
            }
        }
        for id in to_lock {
            holder.lock(&self.world, id)?;
        }
        Ok(())
    }

    /// Lock `chunk` and what lies within `portal_depth` loaded portals of it.
    pub fn lock_chunk_in_memory_portals(
        &self,
        chunk: ChunkId,
        portal_depth: i32,
        holder: &mut ScopedLockedChunkHolder,
    ) -> Result<()> {
        self.check_main_thread()?;
        if !self.world.chunk(chunk).is_resident() {
            return Err(ChunkError::NotResident(chunk));
        }
        for id in self.portal_neighbour_set(chunk, portal_depth, Chunk::is_resident) {
            holder.lock(&self.world, id)?;
        }
        Ok(())
    }

    /// Load `chunk` if needed and lock it on its own. Returns whether it is
    /// loaded or loading.
    pub fn load_and_lock_chunk_in_memory(&mut self, chunk: ChunkId, holder: &mut ScopedLockedChunkHolder) -> bool {
        let c = self.world.chunk(chunk);
        if !c.is_resident() && c.file_exists() {
            self.world.request_load(chunk);
        }
        if !self.world.chunk(chunk).is_resident() {
            return false;
        }
        holder.lock(&self.world, chunk).is_ok()
    }

    /// Invalidate `cache` on `chunk`, its grid neighbourhood and the indoor
    /// chunks overlapping it, recording the chunks as unsaved.
    pub fn spread_invalidate(
        &mut self,
        chunk: ChunkId,
        expand_x: i32,
        expand_z: i32,
        cache: CacheIndex,
        changed_item: Option<&str>,
    ) {
        let mut visited = FnvHashSet::default();
        self.spread_invalidate_grid(chunk, expand_x, expand_z, cache, changed_item, &mut visited);
    }

    fn spread_invalidate_grid(
        &mut self,
        chunk: ChunkId,
        expand_x: i32,
        expand_z: i32,
        cache: CacheIndex,
        changed_item: Option<&str>,
        visited: &mut FnvHashSet<ChunkId>,
    ) {
        match self.world.chunk(chunk).kind() {
            ChunkKind::Outdoor(grid) => {
                let cells = self.world.grid_neighbourhood(grid, expand_x, expand_z);
                for &cell in &cells {
                    if visited.insert(cell) {
                        self.invalidate_for_spread(cell, cache, changed_item);
                    }
                }
                for &cell in &cells {
                    if !self.world.chunk(cell).is_ready() {
                        continue;
                    }
                    let overlappers = self.world.chunk(cell).overlappers().to_vec();
                    for overlapper in overlappers {
                        if visited.insert(overlapper) {
                            self.invalidate_for_spread(overlapper, cache, changed_item);
                        }
                    }
                }
            }
            ChunkKind::Indoor => {
                let overlapped = self.world.chunk(chunk).overlapped().to_vec();
                for outdoor in overlapped {
                    self.spread_invalidate_grid(outdoor, expand_x, expand_z, cache, changed_item, visited);
                }
            }
        }
    }

    /// Invalidate `cache` on `chunk` and on what lies within `portal_depth`
    /// loaded portals of it.
    pub fn spread_invalidate_portals(
        &mut self,
        chunk: ChunkId,
        portal_depth: i32,
        cache: CacheIndex,
        changed_item: Option<&str>,
    ) {
        for id in self.portal_neighbour_set(chunk, portal_depth, Chunk::is_ready) {
            self.invalidate_for_spread(id, cache, changed_item);
        }
    }

    fn invalidate_for_spread(&mut self, chunk: ChunkId, cache: CacheIndex, changed_item: Option<&str>) {
        if self.world.chunk(chunk).cache(cache).is_none() {
            return;
        }
        self.invalidate_cache(chunk, cache, false, changed_item);
        self.unsaved.chunks.add(chunk);
    }
}
