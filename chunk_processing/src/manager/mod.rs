//! Orchestration of chunk processing for one space.
//!
//! The manager owns the [`ChunkWorld`], the worker pool and the bookkeeping
//! that ties them together: the global [`LockedChunks`] table, the dirty
//! lists per cache kind, the clean-chunk list and the [`UnsavedList`].
//! Everything here runs on the thread that created the manager.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use fnv::FnvHashSet;

use super::budget::StepBudget;
use super::cache::{CacheIndex, ChunkCache, CleanChunkList, DirtyChunkLists};
use super::error::{ChunkError, Result};
use super::locked::LockedChunks;
use super::processor::{BackgroundContext, ProcessorTask};
use super::tasks::{TaskManager, DEFAULT_THREAD_NAME};
use super::unsaved::UnsavedList;
use super::world::{Chunk, ChunkWorld, GridBox};
use super::ChunkId;

mod neighbours;
mod save;
mod schedule;

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Worker threads; 0 runs every processor inline.
    pub threads: usize,
    /// Time allowed for finalize steps per tick. `None` runs every step
    /// queued when the tick starts.
    pub main_thread_budget: Option<Duration>,
    /// Background tasks allowed in flight beyond one per worker while saving.
    pub save_batch_slack: usize,
    pub thread_name: String,
    /// The cache `invalidate_all_chunks(.., navmesh_only = true)` targets.
    pub navmesh_cache: Option<CacheIndex>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            threads: 0,
            main_thread_budget: None,
            save_batch_slack: 1,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            navmesh_cache: None,
        }
    }
}

/// Behaviour that differs between the interactive editor and the offline
/// processor.
pub trait ProcessorHooks {
    fn is_memory_low(&self, _world: &ChunkWorld) -> bool {
        false
    }

    fn is_chunk_editable(&self, _chunk: &Chunk) -> bool {
        true
    }

    /// Unload what isn't needed outside `grid_box` during a progressive save.
    /// Chunks in `keep` and locked chunks must stay.
    fn unload_chunks_outside_grid_box(
        &mut self,
        _world: &mut ChunkWorld,
        _locked: &LockedChunks,
        _grid_box: GridBox,
        _keep: &FnvHashSet<ChunkId>,
    ) {
    }

    /// Called once per pass of a save batch.
    fn tick_saving_chunks(&mut self) {}

    fn write_clean_list(&mut self, _clean: &CleanChunkList) {}
}

/// The interactive editor: never unloads aggressively.
#[derive(Clone, Copy, Debug, Default)]
pub struct EditorHooks;

impl ProcessorHooks for EditorHooks {}

pub struct ChunkProcessorManager {
    world: ChunkWorld,
    tasks: TaskManager,
    locked: Arc<LockedChunks>,
    unsaved: UnsavedList,
    dirty_lists: DirtyChunkLists,
    clean_list: CleanChunkList,
    hooks: Box<dyn ProcessorHooks>,
    config: ManagerConfig,
    main_thread: ThreadId,
    finalize_budget: StepBudget,
}

impl ChunkProcessorManager {
    pub fn new(world: ChunkWorld, config: ManagerConfig) -> Self {
        ChunkProcessorManager::with_hooks(world, config, Box::new(EditorHooks))
    }

    pub fn with_hooks(world: ChunkWorld, config: ManagerConfig, hooks: Box<dyn ProcessorHooks>) -> Self {
        let threads = config.threads;
        let mut manager = ChunkProcessorManager {
            world,
            tasks: TaskManager::new(),
            locked: Arc::new(LockedChunks::new()),
            unsaved: UnsavedList::new(),
            dirty_lists: DirtyChunkLists::new(),
            clean_list: CleanChunkList::new(),
            hooks,
            config,
            main_thread: thread::current().id(),
            finalize_budget: StepBudget::new(),
        };
        manager.start_num_threads(threads);
        manager
    }

    pub fn world(&self) -> &ChunkWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut ChunkWorld {
        &mut self.world
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.tasks
    }

    pub fn locked_chunks(&self) -> &Arc<LockedChunks> {
        &self.locked
    }

    pub fn unsaved(&self) -> &UnsavedList {
        &self.unsaved
    }

    pub fn unsaved_mut(&mut self) -> &mut UnsavedList {
        &mut self.unsaved
    }

    pub fn dirty_chunk_lists(&self) -> &DirtyChunkLists {
        &self.dirty_lists
    }

    pub fn clean_list(&self) -> &CleanChunkList {
        &self.clean_list
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn hooks(&self) -> &dyn ProcessorHooks {
        self.hooks.as_ref()
    }

    pub fn hooks_mut(&mut self) -> &mut dyn ProcessorHooks {
        self.hooks.as_mut()
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub(crate) fn check_main_thread(&self) -> Result<()> {
        if self.is_main_thread() {
            Ok(())
        } else {
            error!("chunk graph accessed from {:?}", thread::current().name());
            Err(ChunkError::NotMainThread)
        }
    }

    /// Add `count` workers. Processors submitted afterwards go to the pool.
    pub fn start_num_threads(&mut self, count: usize) {
        if count > 0 {
            let name = self.config.thread_name.clone();
            self.tasks.start_threads(&name, count);
        }
    }

    pub fn stop_all(&mut self, discard_pending: bool, wait_for_threads: bool) {
        self.tasks.stop_all(discard_pending, wait_for_threads);
        if wait_for_threads && !self.tasks.has_tasks() && !self.locked.is_empty() {
            warn!(
                "workers stopped with {} chunks still locked: {:?}",
                self.locked.len(),
                self.locked.snapshot()
            );
        }
    }

    pub fn num_running_threads(&self) -> usize {
        self.tasks.num_running_threads()
    }

    pub fn num_bg_tasks_left(&self) -> usize {
        self.tasks.num_bg_tasks_left()
    }

    pub fn has_tasks(&self) -> bool {
        self.tasks.has_tasks()
    }

    pub fn background_context(&self) -> BackgroundContext {
        self.tasks.background_context()
    }

    /// Ask running background phases to give up early.
    pub fn set_abort(&self, abort: bool) {
        self.tasks.set_abort(abort);
    }

    /// One heartbeat: finish pending loads, run queued finalize steps and
    /// unload if memory is low. Returns whether anything happened.
    pub fn tick(&mut self) -> bool {
        let loaded = self.world.process_pending_loads();
        let finalized = self.run_main_thread_tasks();
        let unloaded = if self.needs_unload() {
            self.unload_removable_chunks()
        } else {
            0
        };
        loaded > 0 || finalized > 0 || unloaded > 0
    }

    fn run_main_thread_tasks(&mut self) -> usize {
        let mut retry = Vec::new();
        let mut steps = 0;
        match self.config.main_thread_budget {
            None => {
                for _ in 0..self.tasks.num_main_thread_tasks() {
                    let task = match self.tasks.try_next_main_thread_task() {
                        Some(task) => task,
                        None => break,
                    };
                    self.finalize_task(task, &mut retry);
                    steps += 1;
                }
            }
            Some(budget) => {
                let mut finalize_budget = mem::replace(&mut self.finalize_budget, StepBudget::new());
                steps = finalize_budget.run(budget, || match self.tasks.try_next_main_thread_task() {
                    Some(task) => {
                        self.finalize_task(task, &mut retry);
                        true
                    }
                    None => false,
                });
                self.finalize_budget = finalize_budget;
            }
        }
        for task in retry {
            self.tasks.add_main_thread_task(task);
        }
        steps
    }

    fn finalize_task(&mut self, mut task: ProcessorTask, retry: &mut Vec<ProcessorTask>) {
        if !task.finalize(self) {
            trace!("processor {} will finalize again", task.handle().id());
            retry.push(task);
        }
    }

    /// Tick until no task is queued or running. Returns false on timeout.
    pub fn drain(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.tasks.has_tasks() {
            if Instant::now() >= deadline {
                warn!(
                    "gave up waiting for {} background and {} main thread tasks",
                    self.tasks.num_bg_tasks_left(),
                    self.tasks.num_main_thread_tasks()
                );
                return false;
            }
            if !self.tick() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        true
    }

    pub fn needs_unload(&self) -> bool {
        self.hooks.is_memory_low(&self.world)
    }

    /// Unload every chunk marked removable that isn't locked.
    pub fn unload_removable_chunks(&mut self) -> usize {
        self.world.unload_removable(&self.locked)
    }

    pub fn is_chunk_editable(&self, chunk: ChunkId) -> bool {
        self.hooks.is_chunk_editable(self.world.chunk(chunk))
    }

    /// Cache slots of a chunk that hold a cache.
    pub fn cache_indices(&self, chunk: ChunkId) -> Vec<CacheIndex> {
        let chunk = self.world.chunk(chunk);
        (0..chunk.num_cache_slots())
            .map(CacheIndex)
            .filter(|&index| chunk.cache(index).is_some())
            .collect()
    }

    /// Run `f` on a cache with the cache taken out of its slot, so it can
    /// reach the rest of the manager. The chunk's dirty status is refreshed
    /// once the cache is back. `None` if the chunk has no such cache.
    pub fn with_cache_mut<R, F>(&mut self, chunk: ChunkId, index: CacheIndex, f: F) -> Option<R>
    where
        F: FnOnce(&mut dyn ChunkCache, &mut ChunkProcessorManager) -> R,
    {
        let mut cache = self.world.chunk_mut(chunk).take_cache(index)?;
        let result = f(cache.as_mut(), self);
        self.world.chunk_mut(chunk).restore_cache(index, cache);
        self.update_chunk_dirty_status(chunk);
        Some(result)
    }

    /// Invalidate one cache of one chunk. Returns whether it reported dirty.
    pub fn invalidate_cache(
        &mut self,
        chunk: ChunkId,
        index: CacheIndex,
        spread: bool,
        changed_item: Option<&str>,
    ) -> bool {
        self.with_cache_mut(chunk, index, |cache, manager| {
            cache.invalidate(manager, chunk, spread, changed_item)
        })
        .unwrap_or(false)
    }

    /// Refresh the dirty lists for every cache of `chunk`.
    pub fn update_chunk_dirty_status(&mut self, chunk: ChunkId) {
        if !self.is_chunk_editable(chunk) {
            return;
        }
        {
            let lists = self.dirty_lists.clone();
            let _held = lists.hold();
            let c = self.world.chunk(chunk);
            for i in 0..c.num_cache_slots() {
                let index = CacheIndex(i);
                if let Some(cache) = c.cache(index) {
                    if cache.dirty() {
                        lists.dirty(
                            index,
                            c,
                            cache.require_processing_in_background(),
                            cache.require_processing_in_main_thread(),
                        );
                    } else {
                        lists.clean(index, c.identifier());
                    }
                }
            }
        }
        self.on_chunk_dirty_status_changed(chunk);
    }

    /// Drop `chunk` from every dirty list.
    pub fn clean_chunk_dirty_status(&mut self, chunk: ChunkId) {
        let identifier = self.world.chunk(chunk).identifier();
        self.dirty_lists.clean_all(identifier);
    }

    pub fn on_chunk_dirty_status_changed(&mut self, chunk: ChunkId) {
        let c = self.world.chunk(chunk);
        let dirty = c.dirty() || self.dirty_lists.is_dirty(c.identifier());
        self.clean_list.update(c.identifier(), dirty);
    }

    pub fn write_clean_list(&mut self) {
        self.hooks.write_clean_list(&self.clean_list);
    }

    /// Forget everything waiting to be saved.
    pub fn clear_unsaved_data(&mut self) {
        self.unsaved.clear();
    }
}

impl fmt::Debug for ChunkProcessorManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChunkProcessorManager")
            .field("chunks", &self.world.len())
            .field("threads", &self.tasks.num_running_threads())
            .field("locked", &self.locked.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for ChunkProcessorManager {
    fn drop(&mut self) {
        self.tasks.stop_all(true, true);
        // unfinished processors release their locks as they go
        while let Some(task) = self.tasks.try_next_main_thread_task() {
            debug!("dropping unfinished processor {}", task.handle().id());
        }
        if !self.locked.is_empty() {
            error!(
                "chunk processor manager dropped with {} chunks locked",
                self.locked.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{attach_cache, test_manager, CacheKind};
    use crate::ScopedLockedChunkHolder;

    #[test]
    fn idle_tick_does_nothing() {
        let mut manager = test_manager(1, 1, Default::default());
        assert!(!manager.tick());
        assert!(!manager.has_tasks());
    }

    #[test]
    fn tick_finishes_pending_loads() {
        let mut manager = test_manager(1, 1, Default::default());
        let id = manager.world().ids().next().unwrap();
        manager.world_mut().set_removable(id, true);
        manager.unload_removable_chunks();
        assert!(manager.world_mut().request_load(id));
        assert!(manager.tick());
        assert!(manager.world().chunk(id).is_bound());
    }

    #[test]
    fn dirty_status_follows_caches() {
        let mut manager = test_manager(1, 0, Default::default());
        let ids: Vec<_> = manager.world().ids().collect();
        let state = attach_cache(manager.world_mut(), ids[0], CacheIndex(0), CacheKind::Background);

        assert!(manager.invalidate_cache(ids[0], CacheIndex(0), false, Some("tree")));
        assert_eq!(state.invalidations(), vec![Some("tree".to_string())]);
        let lists = manager.dirty_chunk_lists().clone();
        assert_eq!(lists.chunks(CacheIndex(0)), vec![ids[0]]);
        assert!(lists.requires_background(CacheIndex(0)));
        assert!(!manager.clean_list().is_clean("00000000o"));

        state.set_dirty(false);
        manager.update_chunk_dirty_status(ids[0]);
        assert_eq!(lists.len(CacheIndex(0)), 0);
        assert!(manager.clean_list().is_clean("00000000o"));

        state.set_dirty(true);
        manager.update_chunk_dirty_status(ids[0]);
        manager.clean_chunk_dirty_status(ids[0]);
        assert_eq!(lists.num_dirty(), 0);
    }

    #[test]
    fn finalize_steps_respect_budget() {
        let config = ManagerConfig {
            main_thread_budget: Some(Duration::from_millis(0)),
            ..Default::default()
        };
        let mut manager = test_manager(2, 0, config);
        let ids: Vec<_> = manager.world().ids().collect();
        let states: Vec<_> = ids
            .iter()
            .map(|&id| attach_cache(manager.world_mut(), id, CacheIndex(0), CacheKind::Background))
            .collect();
        for &id in &ids {
            manager.invalidate_cache(id, CacheIndex(0), false, None);
        }
        // inline processors that want a second finalize step
        for state in &states {
            state.set_finalize_retries(1);
        }
        for &id in &ids {
            manager.with_cache_mut(id, CacheIndex(0), |cache, m| cache.recalc(m, id));
        }
        assert_eq!(manager.tasks().num_main_thread_tasks(), 3);
        // a zero budget still runs one step per tick
        assert!(manager.tick());
        assert_eq!(manager.tasks().num_main_thread_tasks(), 2);
        assert!(manager.drain(Duration::from_secs(10)));
        assert!(states.iter().all(|s| !s.is_dirty()));
    }

    #[test]
    fn dropping_with_unfinished_work_releases_locks() {
        let mut manager = test_manager(1, 1, ManagerConfig { threads: 1, ..Default::default() });
        let locked = manager.locked_chunks().clone();
        let ids: Vec<_> = manager.world().ids().collect();
        let state = attach_cache(manager.world_mut(), ids[0], CacheIndex(0), CacheKind::Background);
        manager.invalidate_cache(ids[0], CacheIndex(0), false, None);
        manager.with_cache_mut(ids[0], CacheIndex(0), |cache, m| cache.recalc(m, ids[0]));
        assert!(state.is_being_calculated());
        drop(manager);
        assert!(locked.is_empty());
    }

    #[test]
    fn unexpanded_lock_takes_one_chunk() {
        let manager = test_manager(0, 0, Default::default());
        let id = manager.world().ids().next().unwrap();
        let mut holder = ScopedLockedChunkHolder::new(manager.locked_chunks().clone());
        holder.lock_expanded(&manager, id, 0, 0).unwrap();
        assert!(manager.locked_chunks().is_locked(id));
        holder.clear();
        assert!(manager.locked_chunks().is_empty());
    }
}
