//! Per-chunk derived data, and the bookkeeping of which chunks need it rebuilt.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use fnv::FnvHashSet;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use super::manager::ChunkProcessorManager;
use super::unsaved::Progress;
use super::world::{Chunk, ChunkWorld};
use super::ChunkId;

/// Slot of a cache kind (shadows, navmesh, terrain LOD...) in every chunk.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheIndex(pub usize);

/// Derived data attached to one chunk.
///
/// While the manager calls into a cache, the cache is taken out of its chunk's
/// slot, so implementations are free to walk the world through `manager`.
pub trait ChunkCache: Send {
    /// Mark the cache out of date. `spread` is true when the invalidation was
    /// fanned out from a neighbour; `changed_item` names what changed.
    /// Returns whether the cache became dirty.
    fn invalidate(
        &mut self,
        manager: &mut ChunkProcessorManager,
        chunk: ChunkId,
        spread: bool,
        changed_item: Option<&str>,
    ) -> bool;

    fn dirty(&self) -> bool;

    /// Start (or do) the recalculation, usually by submitting a
    /// `ChunkProcessor`. Returns whether anything was started.
    fn recalc(&mut self, manager: &mut ChunkProcessorManager, chunk: ChunkId) -> bool;

    fn ready_to_calculate(&self, manager: &ChunkProcessorManager, chunk: ChunkId) -> bool;

    /// Request whatever the recalculation needs loaded. Returns whether it
    /// is loaded or on its way.
    fn load_chunk_for_calculate(&mut self, _manager: &mut ChunkProcessorManager, _chunk: ChunkId) -> bool {
        true
    }

    fn is_being_calculated(&self) -> bool {
        false
    }

    fn require_processing_in_background(&self) -> bool {
        false
    }

    fn require_processing_in_main_thread(&self) -> bool {
        false
    }
}

/// Dirty chunks of one cache kind, by identifier.
#[derive(Clone, Debug, Default)]
pub struct DirtyChunkList {
    chunks: BTreeMap<String, ChunkId>,
    require_background: bool,
    require_main_thread: bool,
}

impl DirtyChunkList {
    pub fn dirty(&mut self, chunk: &Chunk) {
        self.chunks.insert(chunk.identifier().to_string(), chunk.id());
    }

    pub fn clean(&mut self, identifier: &str) -> bool {
        self.chunks.remove(identifier).is_some()
    }

    pub fn is_dirty(&self, identifier: &str) -> bool {
        self.chunks.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ChunkId)> {
        self.chunks.iter().map(|(name, &id)| (name.as_str(), id))
    }

    pub fn require_processing_in_background(&self) -> bool {
        self.require_background
    }

    pub fn require_processing_in_main_thread(&self) -> bool {
        self.require_main_thread
    }
}

type Lists = RefCell<Vec<DirtyChunkList>>;

/// One [`DirtyChunkList`] per cache index, behind a reentrant lock.
///
/// Dirty status changes can arrive while a compound operation already holds
/// the lists (a finalize step re-dirtying a neighbour, say), so the lock is
/// reentrant and every method only borrows the lists for its own duration.
#[derive(Clone, Default)]
pub struct DirtyChunkLists {
    lists: Arc<ReentrantMutex<Lists>>,
}

impl DirtyChunkLists {
    pub fn new() -> Self {
        Default::default()
    }

    /// Hold the lists across several calls.
    pub fn hold(&self) -> ReentrantMutexGuard<Lists> {
        self.lists.lock()
    }

    fn with<R, F: FnOnce(&mut Vec<DirtyChunkList>) -> R>(&self, f: F) -> R {
        let guard = self.lists.lock();
        let mut lists = guard.borrow_mut();
        f(&mut *lists)
    }

    /// Record `chunk` as dirty for `cache`, and remember whether that cache
    /// kind wants background and/or main-thread processing.
    pub fn dirty(&self, cache: CacheIndex, chunk: &Chunk, background: bool, main_thread: bool) {
        self.with(|lists| {
            if lists.len() <= cache.0 {
                lists.resize_with(cache.0 + 1, Default::default);
            }
            let list = &mut lists[cache.0];
            list.dirty(chunk);
            list.require_background |= background;
            list.require_main_thread |= main_thread;
        })
    }

    pub fn clean(&self, cache: CacheIndex, identifier: &str) -> bool {
        self.with(|lists| match lists.get_mut(cache.0) {
            Some(list) => list.clean(identifier),
            None => false,
        })
    }

    /// Remove a chunk from every list.
    pub fn clean_all(&self, identifier: &str) {
        self.with(|lists| {
            for list in lists.iter_mut() {
                list.clean(identifier);
            }
        })
    }

    pub fn is_dirty(&self, identifier: &str) -> bool {
        self.with(|lists| lists.iter().any(|list| list.is_dirty(identifier)))
    }

    pub fn is_dirty_for(&self, cache: CacheIndex, identifier: &str) -> bool {
        self.with(|lists| lists.get(cache.0).map_or(false, |l| l.is_dirty(identifier)))
    }

    /// Dirty chunks for one cache.
    pub fn len(&self, cache: CacheIndex) -> usize {
        self.with(|lists| lists.get(cache.0).map_or(0, DirtyChunkList::len))
    }

    /// Distinct dirty chunks across all caches.
    pub fn num_dirty(&self) -> usize {
        self.with(|lists| {
            let all: FnvHashSet<ChunkId> = lists
                .iter()
                .flat_map(|list| list.chunks.values().cloned())
                .collect();
            all.len()
        })
    }

    pub fn num_lists(&self) -> usize {
        self.with(|lists| lists.len())
    }

    pub fn chunks(&self, cache: CacheIndex) -> Vec<ChunkId> {
        self.with(|lists| {
            lists
                .get(cache.0)
                .map(|list| list.chunks.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn requires_background(&self, cache: CacheIndex) -> bool {
        self.with(|lists| lists.get(cache.0).map_or(false, |l| l.require_background))
    }

    pub fn requires_main_thread(&self, cache: CacheIndex) -> bool {
        self.with(|lists| lists.get(cache.0).map_or(false, |l| l.require_main_thread))
    }

    /// Chunks of every list flagged for background processing, list by list,
    /// without repeats.
    pub fn background_candidates(&self) -> Vec<ChunkId> {
        self.candidates(|list| list.require_background)
    }

    pub fn main_thread_candidates(&self) -> Vec<ChunkId> {
        self.candidates(|list| list.require_main_thread)
    }

    fn candidates<F: Fn(&DirtyChunkList) -> bool>(&self, wanted: F) -> Vec<ChunkId> {
        self.with(|lists| {
            let mut seen = FnvHashSet::default();
            let mut found = Vec::new();
            for list in lists.iter().filter(|l| wanted(*l)) {
                for &id in list.chunks.values() {
                    if seen.insert(id) {
                        found.push(id);
                    }
                }
            }
            found
        })
    }
}

impl fmt::Debug for DirtyChunkLists {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let guard = self.lists.lock();
        let result = match guard.try_borrow() {
            Ok(lists) => f.debug_list().entries(lists.iter()).finish(),
            Err(_) => f.write_str("DirtyChunkLists { <in use> }"),
        };
        result
    }
}

/// Identifiers of chunks known to have nothing left to recalculate.
///
/// Lets a save batch skip clean chunks without loading them.
#[derive(Clone, Debug, Default)]
pub struct CleanChunkList {
    clean: FnvHashSet<String>,
}

impl CleanChunkList {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn is_clean(&self, identifier: &str) -> bool {
        self.clean.contains(identifier)
    }

    pub fn update(&mut self, identifier: &str, dirty: bool) {
        if dirty {
            self.clean.remove(identifier);
        } else if !self.clean.contains(identifier) {
            self.clean.insert(identifier.to_string());
        }
    }

    /// Drop entries that no longer exist or are dirty again. Returns how many
    /// were dropped.
    pub fn sync(&mut self, world: &ChunkWorld, dirty: &DirtyChunkLists, progress: &mut dyn Progress) -> usize {
        progress.length(self.clean.len());
        let before = self.clean.len();
        self.clean.retain(|identifier| {
            progress.step();
            match world.find(identifier) {
                Some(id) => {
                    let chunk = world.chunk(id);
                    !dirty.is_dirty(identifier) && !(chunk.is_ready() && chunk.dirty())
                }
                None => false,
            }
        });
        before - self.clean.len()
    }

    pub fn len(&self) -> usize {
        self.clean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clean.is_empty()
    }

    /// Sorted, for writing out.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.clean.iter().map(String::as_str).collect();
        ids.sort();
        ids
    }
}
