//! Fixtures shared by the unit tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{CacheIndex, ChunkCache};
use crate::holder::ScopedLockedChunkHolder;
use crate::manager::{ChunkProcessorManager, ManagerConfig};
use crate::processor::{
    BackgroundContext, ChunkProcessor, ChunkProcessorListener, ListenerAction, ProcessorHandle,
    ProcessorTask,
};
use crate::unsaved::{ChunkSaver, TerrainBlock};
use crate::world::{Chunk, ChunkWorld, GridBox};
use crate::ChunkId;

/// Outdoor chunks over (0, 0)..=(max_x, max_z), all bound. Ids are in row
/// order.
pub fn loaded_grid(max_x: i32, max_z: i32) -> (ChunkWorld, Vec<ChunkId>) {
    let mut world = ChunkWorld::with_outdoor_grid(GridBox::new(0, max_x, 0, max_z));
    let ids: Vec<ChunkId> = world.ids().collect();
    for &id in &ids {
        world.load_now(id);
    }
    (world, ids)
}

pub fn test_manager(max_x: i32, max_z: i32, config: ManagerConfig) -> ChunkProcessorManager {
    ChunkProcessorManager::new(loaded_grid(max_x, max_z).0, config)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Background,
    MainThread,
    Cleanup,
}

/// Logs every phase it goes through.
pub struct RecordingProcessor {
    background_result: bool,
    failing_finalizes: usize,
    panics: bool,
    log: Arc<Mutex<Vec<Event>>>,
    results: Arc<Mutex<Vec<bool>>>,
}

impl RecordingProcessor {
    pub fn new(background_result: bool, failing_finalizes: usize) -> (Self, Arc<Mutex<Vec<Event>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let processor = RecordingProcessor {
            background_result,
            failing_finalizes,
            panics: false,
            log: log.clone(),
            results: Arc::new(Mutex::new(Vec::new())),
        };
        (processor, log)
    }

    /// One whose background phase panics after logging.
    pub fn panicking() -> (Self, Arc<Mutex<Vec<Event>>>) {
        let (mut processor, log) = RecordingProcessor::new(true, 0);
        processor.panics = true;
        (processor, log)
    }

    /// Background results seen by each finalize step.
    pub fn results(&self) -> Arc<Mutex<Vec<bool>>> {
        self.results.clone()
    }
}

impl ChunkProcessor for RecordingProcessor {
    fn process_in_background(&mut self, _context: &BackgroundContext) -> bool {
        self.log.lock().push(Event::Background);
        if self.panics {
            panic!("background phase failed");
        }
        self.background_result
    }

    fn process_in_main_thread(&mut self, _manager: &mut ChunkProcessorManager, background_result: bool) -> bool {
        self.log.lock().push(Event::MainThread);
        self.results.lock().push(background_result);
        if self.failing_finalizes > 0 {
            self.failing_finalizes -= 1;
            return false;
        }
        true
    }

    fn on_cleanup(&mut self, _manager: &mut ChunkProcessorManager) {
        self.log.lock().push(Event::Cleanup);
    }
}

pub struct CountingListener {
    count: AtomicUsize,
    action: ListenerAction,
}

impl CountingListener {
    pub fn new(action: ListenerAction) -> Arc<CountingListener> {
        Arc::new(CountingListener {
            count: AtomicUsize::new(0),
            action,
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl ChunkProcessorListener for CountingListener {
    fn on_finished(&self, _processor: &ProcessorHandle) -> ListenerAction {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.action
    }
}

#[derive(Debug, Default)]
pub struct RecordingSaver {
    pub saved: Vec<String>,
    pub fail: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChunkSaver for RecordingSaver {
    fn save(&mut self, chunk: &Chunk) -> bool {
        if self.fail.contains(chunk.identifier()) {
            return false;
        }
        self.saved.push(chunk.identifier().to_string());
        true
    }

    fn is_deleted(&self, chunk: &Chunk) -> bool {
        self.deleted.contains(chunk.identifier())
    }
}

pub struct TestTerrainBlock {
    name: String,
    succeed: bool,
    saved: Mutex<Vec<String>>,
}

impl TestTerrainBlock {
    pub fn new(name: &str, succeed: bool) -> Self {
        TestTerrainBlock {
            name: name.to_string(),
            succeed,
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn saved_to(&self) -> Vec<String> {
        self.saved.lock().clone()
    }
}

impl TerrainBlock for TestTerrainBlock {
    fn resource_name(&self) -> &str {
        &self.name
    }

    fn save(&self, filename: &str) -> bool {
        if self.succeed {
            self.saved.lock().push(filename.to_string());
        }
        self.succeed
    }
}

/// How a [`TestCache`] recalculates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKind {
    /// Locks its chunk and submits a processor; wants background processing.
    Background,
    /// Cleans itself in `recalc`; wants main thread processing.
    MainThread,
    /// Cleans itself in `recalc`; wants background processing.
    Inline,
}

/// Test-side view of a [`TestCache`], which lives in its chunk's slot.
pub struct CacheState {
    dirty: AtomicBool,
    calculating: AtomicBool,
    ready: AtomicBool,
    finalize_retries: AtomicUsize,
    background_panics: AtomicUsize,
    recalcs: AtomicUsize,
    invalidations: Mutex<Vec<Option<String>>>,
}

impl CacheState {
    pub fn invalidations(&self) -> Vec<Option<String>> {
        self.invalidations.lock().clone()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Finalize steps that ask to run again before the next one succeeds.
    pub fn set_finalize_retries(&self, retries: usize) {
        self.finalize_retries.store(retries, Ordering::SeqCst);
    }

    /// Background phases that panic before the next one succeeds.
    pub fn set_background_panics(&self, panics: usize) {
        self.background_panics.store(panics, Ordering::SeqCst);
    }

    pub fn is_being_calculated(&self) -> bool {
        self.calculating.load(Ordering::SeqCst)
    }

    pub fn recalcs(&self) -> usize {
        self.recalcs.load(Ordering::SeqCst)
    }
}

pub struct TestCache {
    state: Arc<CacheState>,
    kind: CacheKind,
}

impl ChunkCache for TestCache {
    fn invalidate(
        &mut self,
        _manager: &mut ChunkProcessorManager,
        _chunk: ChunkId,
        _spread: bool,
        changed_item: Option<&str>,
    ) -> bool {
        self.state.invalidations.lock().push(changed_item.map(str::to_string));
        self.state.set_dirty(true);
        true
    }

    fn dirty(&self) -> bool {
        self.state.is_dirty()
    }

    fn recalc(&mut self, manager: &mut ChunkProcessorManager, chunk: ChunkId) -> bool {
        self.state.recalcs.fetch_add(1, Ordering::SeqCst);
        match self.kind {
            CacheKind::Background => {
                let mut holder = ScopedLockedChunkHolder::new(manager.locked_chunks().clone());
                if holder.lock(manager.world(), chunk).is_err() {
                    return false;
                }
                self.state.calculating.store(true, Ordering::SeqCst);
                let processor = CacheProcessor {
                    state: self.state.clone(),
                    chunk,
                    holder,
                };
                ProcessorTask::new(processor).process(manager);
            }
            CacheKind::MainThread | CacheKind::Inline => {
                self.state.set_dirty(false);
                manager.unsaved_mut().cdatas.add(chunk);
            }
        }
        true
    }

    fn ready_to_calculate(&self, _manager: &ChunkProcessorManager, _chunk: ChunkId) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    fn is_being_calculated(&self) -> bool {
        self.state.is_being_calculated()
    }

    fn require_processing_in_background(&self) -> bool {
        self.kind != CacheKind::MainThread
    }

    fn require_processing_in_main_thread(&self) -> bool {
        self.kind == CacheKind::MainThread
    }
}

struct CacheProcessor {
    state: Arc<CacheState>,
    chunk: ChunkId,
    holder: ScopedLockedChunkHolder,
}

impl ChunkProcessor for CacheProcessor {
    fn process_in_background(&mut self, context: &BackgroundContext) -> bool {
        let panics = self.state.background_panics.load(Ordering::SeqCst);
        if panics > 0 {
            self.state.background_panics.store(panics - 1, Ordering::SeqCst);
            panic!("cache calculation failed");
        }
        !context.should_abort()
    }

    fn process_in_main_thread(&mut self, manager: &mut ChunkProcessorManager, background_result: bool) -> bool {
        let retries = self.state.finalize_retries.load(Ordering::SeqCst);
        if retries > 0 {
            self.state.finalize_retries.store(retries - 1, Ordering::SeqCst);
            return false;
        }
        self.state.set_dirty(!background_result);
        self.state.calculating.store(false, Ordering::SeqCst);
        manager.unsaved_mut().cdatas.add(self.chunk);
        manager.update_chunk_dirty_status(self.chunk);
        true
    }

    fn on_cleanup(&mut self, _manager: &mut ChunkProcessorManager) {
        self.state.calculating.store(false, Ordering::SeqCst);
        self.holder.clear();
    }
}

/// Put a fresh, clean [`TestCache`] in a chunk's slot.
pub fn attach_cache(world: &mut ChunkWorld, chunk: ChunkId, index: CacheIndex, kind: CacheKind) -> Arc<CacheState> {
    let state = Arc::new(CacheState {
        dirty: AtomicBool::new(false),
        calculating: AtomicBool::new(false),
        ready: AtomicBool::new(true),
        finalize_retries: AtomicUsize::new(0),
        background_panics: AtomicUsize::new(0),
        recalcs: AtomicUsize::new(0),
        invalidations: Mutex::new(Vec::new()),
    });
    let cache = TestCache {
        state: state.clone(),
        kind,
    };
    world.chunk_mut(chunk).set_cache(index, Box::new(cache));
    state
}
