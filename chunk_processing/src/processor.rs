//! Two-phase recalculation tasks.
//!
//! A [`ChunkProcessor`] does its heavy lifting in `process_in_background` on a
//! worker thread, then applies the result in `process_in_main_thread` during
//! `ChunkProcessorManager::tick`. The [`ProcessorTask`] that wraps it moves
//! through the queues by value: the worker hands the task (and the background
//! result stored in it) back over a channel, so the main thread can't observe
//! a stale result.
//!
//! Other code keeps track of a submitted task through its [`ProcessorHandle`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::manager::ChunkProcessorManager;

static NEXT_PROCESSOR_ID: AtomicUsize = AtomicUsize::new(1);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorState {
    Idle = 0,
    QueuedBackground = 1,
    RunningBackground = 2,
    QueuedMainThread = 3,
    /// Finalize steps run here, possibly over several ticks.
    RunningMainThread = 4,
    Cleaned = 5,
}

impl ProcessorState {
    fn from_u8(state: u8) -> ProcessorState {
        match state {
            0 => ProcessorState::Idle,
            1 => ProcessorState::QueuedBackground,
            2 => ProcessorState::RunningBackground,
            3 => ProcessorState::QueuedMainThread,
            4 => ProcessorState::RunningMainThread,
            _ => ProcessorState::Cleaned,
        }
    }
}

/// What a listener wants after being told a processor finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerAction {
    Keep,
    Unregister,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ListenerId(usize);

/// Told once when a processor has been cleaned up. Always called on the main
/// thread, with no processor locks held, so it may add or remove listeners.
pub trait ChunkProcessorListener: Send + Sync {
    fn on_finished(&self, processor: &ProcessorHandle) -> ListenerAction;
}

struct Shared {
    id: usize,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    cleaned: AtomicBool,
    next_listener: AtomicUsize,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn ChunkProcessorListener>)>>,
}

/// Shared view of a submitted processor.
#[derive(Clone)]
pub struct ProcessorHandle(Arc<Shared>);

impl ProcessorHandle {
    fn new() -> Self {
        ProcessorHandle(Arc::new(Shared {
            id: NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(ProcessorState::Idle as u8),
            cancel_requested: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            next_listener: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ProcessorState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ProcessorState::Cleaned
    }

    /// Ask for the background phase to be skipped. Has no effect once the
    /// background phase has started.
    pub fn cancel(&self) {
        self.0.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.0.cancel_requested.load(Ordering::Acquire)
    }

    pub fn add_listener(&self, listener: Arc<dyn ChunkProcessorListener>) -> ListenerId {
        let id = ListenerId(self.0.next_listener.fetch_add(1, Ordering::Relaxed));
        self.0.listeners.lock().push((id, listener));
        id
    }

    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.0.listeners.lock();
        match listeners.iter().position(|&(l, _)| l == id) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.0.listeners.lock().len()
    }

    // Iterates a snapshot. A listener removed by an earlier callback is
    // skipped, and one that unregisters itself is removed from the live list,
    // so nobody is notified twice or missed.
    fn notify(&self) {
        let snapshot = self.0.listeners.lock().clone();
        for (id, listener) in snapshot {
            let registered = self.0.listeners.lock().iter().any(|&(l, _)| l == id);
            if !registered {
                continue;
            }
            if listener.on_finished(self) == ListenerAction::Unregister {
                self.remove_listener(id);
            }
        }
    }
}

impl PartialEq for ProcessorHandle {
    fn eq(&self, other: &ProcessorHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ProcessorHandle {}

impl fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// What a background phase can see of the outside world.
#[derive(Clone, Debug)]
pub struct BackgroundContext {
    abort: Arc<AtomicBool>,
}

impl BackgroundContext {
    pub(crate) fn new(abort: Arc<AtomicBool>) -> Self {
        BackgroundContext { abort }
    }

    /// Long background loops should poll this and return false when set.
    pub fn should_abort(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

pub trait ChunkProcessor: Send {
    /// Runs on a worker thread (or inline with no workers). Returning false
    /// means there is no result; finalize still runs.
    fn process_in_background(&mut self, context: &BackgroundContext) -> bool;

    /// Runs on the main thread after the background phase. Return false to
    /// be called again next tick.
    fn process_in_main_thread(
        &mut self,
        manager: &mut ChunkProcessorManager,
        background_result: bool,
    ) -> bool;

    /// Release whatever the processor holds. Listeners are notified after
    /// this returns.
    fn on_cleanup(&mut self, _manager: &mut ChunkProcessorManager) {}
}

/// How a processor was dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued; it will finish during a later tick.
    Submitted,
    /// Ran to completion inline.
    Completed { background_result: bool },
}

pub struct ProcessorTask {
    handle: ProcessorHandle,
    processor: Box<dyn ChunkProcessor>,
    background_result: bool,
}

impl ProcessorTask {
    pub fn new<P: ChunkProcessor + 'static>(processor: P) -> Self {
        ProcessorTask::from_box(Box::new(processor))
    }

    pub fn from_box(processor: Box<dyn ChunkProcessor>) -> Self {
        ProcessorTask {
            handle: ProcessorHandle::new(),
            processor,
            background_result: false,
        }
    }

    pub fn handle(&self) -> ProcessorHandle {
        self.handle.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ChunkProcessorListener>) -> ListenerId {
        self.handle.add_listener(listener)
    }

    pub fn background_result(&self) -> bool {
        self.background_result
    }

    /// Hand the task to the manager's workers, or, when it has none, run
    /// both phases right here.
    pub fn process(mut self, manager: &mut ChunkProcessorManager) -> Dispatch {
        if manager.num_running_threads() > 0 {
            self.handle.set_state(ProcessorState::QueuedBackground);
            manager.tasks().add_background_task(self);
            return Dispatch::Submitted;
        }

        let context = manager.background_context();
        self.run_background(&context);
        let background_result = self.background_result;
        if self.finalize(manager) {
            Dispatch::Completed { background_result }
        } else {
            manager.tasks().add_main_thread_task(self);
            Dispatch::Submitted
        }
    }

    /// Skip the background phase and finish on the main thread.
    pub fn cancel(mut self, manager: &ChunkProcessorManager) {
        self.handle.cancel();
        self.background_result = false;
        manager.tasks().add_main_thread_task(self);
    }

    /// A panic in the background phase counts as a failed result, so the
    /// task still reaches finalize and cleanup.
    pub(crate) fn run_background(&mut self, context: &BackgroundContext) {
        if self.handle.is_cancel_requested() {
            trace!("processor {} cancelled before its background phase", self.handle.id());
            self.background_result = false;
        } else {
            self.handle.set_state(ProcessorState::RunningBackground);
            let processor = &mut self.processor;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| processor.process_in_background(context)));
            self.background_result = match outcome {
                Ok(result) => result,
                Err(_) => {
                    error!("processor {} panicked in its background phase", self.handle.id());
                    false
                }
            };
        }
        self.handle.set_state(ProcessorState::QueuedMainThread);
    }

    /// One finalize step. Cleans up and returns true once the processor is
    /// done.
    pub(crate) fn finalize(&mut self, manager: &mut ChunkProcessorManager) -> bool {
        self.handle.set_state(ProcessorState::RunningMainThread);
        let done = self
            .processor
            .process_in_main_thread(manager, self.background_result);
        if done {
            self.cleanup(manager);
        } else {
            self.handle.set_state(ProcessorState::QueuedMainThread);
        }
        done
    }

    /// Only the first call does anything.
    pub fn cleanup(&mut self, manager: &mut ChunkProcessorManager) {
        if self.handle.0.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.processor.on_cleanup(manager);
        self.handle.set_state(ProcessorState::Cleaned);
        self.handle.notify();
    }
}

impl fmt::Debug for ProcessorTask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessorTask")
            .field("handle", &self.handle)
            .field("background_result", &self.background_result)
            .finish()
    }
}

/// Processors outstanding against one cache.
#[derive(Clone, Debug, Default)]
pub struct ChunkProcessors {
    processors: Vec<ProcessorHandle>,
}

impl ChunkProcessors {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns false (and logs) if the processor is already registered.
    pub fn add(&mut self, processor: ProcessorHandle) -> bool {
        if self.processors.contains(&processor) {
            error!("processor {} registered twice", processor.id());
            return false;
        }
        self.processors.push(processor);
        true
    }

    pub fn remove(&mut self, processor: &ProcessorHandle) -> bool {
        match self.processors.iter().position(|p| p == processor) {
            Some(index) => {
                self.processors.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, processor: &ProcessorHandle) -> bool {
        self.processors.contains(processor)
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn iter(&self) -> ::std::slice::Iter<ProcessorHandle> {
        self.processors.iter()
    }

    pub fn iter_mut(&mut self) -> ::std::slice::IterMut<ProcessorHandle> {
        self.processors.iter_mut()
    }

    /// Request cancellation of everything registered.
    pub fn cancel_all(&self) {
        for processor in &self.processors {
            processor.cancel();
        }
    }

    /// Forget processors that have finished.
    pub fn retain_unfinished(&mut self) {
        self.processors.retain(|p| !p.is_finished());
    }
}
