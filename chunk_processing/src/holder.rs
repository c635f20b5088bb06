//! Scoped ownership of chunk locks.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::error::{ChunkError, Result};
use super::locked::LockedChunks;
use super::manager::ChunkProcessorManager;
use super::world::ChunkWorld;
use super::ChunkId;

/// A set of chunks locked on behalf of one task.
///
/// Every chunk in the set holds exactly one count in the shared
/// [`LockedChunks`] table, and all of them are released when the holder is
/// cleared or dropped (including during unwinding).
///
/// Usually embedded in a `ChunkProcessor`, so that the chunks it reads in the
/// background stay resident until the processor is gone.
#[derive(Debug)]
pub struct ScopedLockedChunkHolder {
    locked: Arc<LockedChunks>,
    chunks: BTreeSet<ChunkId>,
}

impl ScopedLockedChunkHolder {
    pub fn new(locked: Arc<LockedChunks>) -> Self {
        ScopedLockedChunkHolder {
            locked,
            chunks: BTreeSet::new(),
        }
    }

    /// Lock a single chunk, which must be loaded or loading.
    ///
    /// Locking a chunk this holder already has is a no-op; returns whether
    /// the chunk was newly locked.
    pub fn lock(&mut self, world: &ChunkWorld, chunk: ChunkId) -> Result<bool> {
        if self.chunks.contains(&chunk) {
            return Ok(false);
        }
        if !world.chunk(chunk).is_resident() {
            error!(
                "locking chunk {} ({}) which is not loaded",
                world.chunk(chunk).identifier(),
                chunk
            );
            return Err(ChunkError::NotResident(chunk));
        }
        self.chunks.insert(chunk);
        self.locked.lock(chunk);
        Ok(true)
    }

    /// Lock a chunk along with its grid neighbours (and the indoor chunks
    /// overlapping them). Main thread only.
    pub fn lock_expanded(
        &mut self,
        manager: &ChunkProcessorManager,
        chunk: ChunkId,
        expand_x: i32,
        expand_z: i32,
    ) -> Result<()> {
        if expand_x == 0 && expand_z == 0 {
            return self.lock(manager.world(), chunk).map(|_| ());
        }
        manager.lock_chunk_in_memory(chunk, expand_x, expand_z, self)
    }

    /// Lock a chunk along with everything reachable through up to
    /// `portal_depth` portals. Main thread only.
    pub fn lock_portals(
        &mut self,
        manager: &ChunkProcessorManager,
        chunk: ChunkId,
        portal_depth: i32,
    ) -> Result<()> {
        if portal_depth == 0 {
            return self.lock(manager.world(), chunk).map(|_| ());
        }
        manager.lock_chunk_in_memory_portals(chunk, portal_depth, self)
    }

    /// Release one chunk held by this holder.
    pub fn erase(&mut self, chunk: ChunkId) -> Result<()> {
        if !self.chunks.remove(&chunk) {
            error!("erasing chunk {} which this holder does not own", chunk);
            return Err(ChunkError::NotLocked(chunk));
        }
        self.locked.unlock(chunk).map(|_| ())
    }

    /// Release everything.
    pub fn clear(&mut self) {
        if self.chunks.is_empty() {
            return;
        }
        let chunks = ::std::mem::replace(&mut self.chunks, BTreeSet::new());
        if let Err(e) = self.locked.unlock_all(chunks) {
            error!("releasing scoped chunk locks: {}", e);
        }
    }

    pub fn contains(&self, chunk: ChunkId) -> bool {
        self.chunks.contains(&chunk)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<ChunkId> {
        self.chunks.iter()
    }

    pub fn locked_chunks(&self) -> &Arc<LockedChunks> {
        &self.locked
    }
}

impl Drop for ScopedLockedChunkHolder {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<'a> IntoIterator for &'a ScopedLockedChunkHolder {
    type Item = &'a ChunkId;
    type IntoIter = btree_set::Iter<'a, ChunkId>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.iter()
    }
}
