//! Worker threads and the two task queues.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as channel, Receiver, Sender};

use super::processor::{BackgroundContext, ProcessorState, ProcessorTask};

pub const DEFAULT_THREAD_NAME: &str = "chunk-processor";

/// Runs background phases on a pool of workers and collects finished tasks
/// for the main thread.
///
/// Each call to `stop_all` retires the current background queue: the old
/// workers exit once it is drained and its sender is gone, and any later
/// `start_threads` feeds a fresh queue.
pub struct TaskManager {
    background_tx: Sender<ProcessorTask>,
    background_rx: Receiver<ProcessorTask>,
    main_tx: Sender<ProcessorTask>,
    main_rx: Receiver<ProcessorTask>,
    workers: Vec<JoinHandle<()>>,
    abort: Arc<AtomicBool>,
    /// Background tasks queued or running.
    in_flight: Arc<AtomicUsize>,
}

impl TaskManager {
    pub fn new() -> Self {
        let (background_tx, background_rx) = channel::unbounded();
        let (main_tx, main_rx) = channel::unbounded();
        TaskManager {
            background_tx,
            background_rx,
            main_tx,
            main_rx,
            workers: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Spawn `count` more workers.
    pub fn start_threads(&mut self, name: &str, count: usize) {
        for _ in 0..count {
            let index = self.workers.len();
            let jobs = self.background_rx.clone();
            let done = self.main_tx.clone();
            let context = self.background_context();
            let in_flight = self.in_flight.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(jobs, done, context, in_flight));
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    error!("failed to spawn chunk processing thread: {}", e);
                    break;
                }
            }
        }
        if count > 0 {
            info!("{} chunk processing threads running", self.workers.len());
        }
    }

    pub fn num_running_threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker.
    ///
    /// With `discard_pending`, background tasks that haven't started are
    /// dropped without being finalized. Otherwise the retiring workers finish
    /// them first. With `wait_for_threads`, block until the workers exit.
    pub fn stop_all(&mut self, discard_pending: bool, wait_for_threads: bool) {
        if discard_pending {
            let mut discarded = 0;
            while let Ok(task) = self.background_rx.try_recv() {
                task.handle().set_state(ProcessorState::Idle);
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                discarded += 1;
            }
            if discarded > 0 {
                debug!("discarded {} queued background tasks", discarded);
            }
        }

        let (background_tx, background_rx) = channel::unbounded();
        drop(mem::replace(&mut self.background_tx, background_tx));
        let retired = mem::replace(&mut self.background_rx, background_rx);
        if self.workers.is_empty() {
            // no one will drain the retired queue
            for task in retired.try_iter() {
                let _ = self.background_tx.send(task);
            }
        }

        let workers = mem::replace(&mut self.workers, Vec::new());
        if workers.is_empty() {
            return;
        }
        if wait_for_threads {
            for worker in workers {
                if worker.join().is_err() {
                    error!("a chunk processing thread panicked");
                }
            }
        }
        info!("chunk processing threads stopped");
    }

    pub fn add_background_task(&self, task: ProcessorTask) {
        task.handle().set_state(ProcessorState::QueuedBackground);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.background_tx.send(task) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            error!("background queue closed, dropping {:?}", e.into_inner());
        }
    }

    pub fn add_main_thread_task(&self, task: ProcessorTask) {
        task.handle().set_state(ProcessorState::QueuedMainThread);
        if let Err(e) = self.main_tx.send(task) {
            error!("main thread queue closed, dropping {:?}", e.into_inner());
        }
    }

    pub fn try_next_main_thread_task(&self) -> Option<ProcessorTask> {
        self.main_rx.try_recv().ok()
    }

    /// Background tasks queued or running.
    pub fn num_bg_tasks_left(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn num_main_thread_tasks(&self) -> usize {
        self.main_rx.len()
    }

    pub fn has_tasks(&self) -> bool {
        self.num_bg_tasks_left() > 0 || !self.main_rx.is_empty()
    }

    /// Raise or lower the cooperative abort flag seen by every background
    /// phase.
    pub fn set_abort(&self, abort: bool) {
        self.abort.store(abort, Ordering::Relaxed);
    }

    pub fn background_context(&self) -> BackgroundContext {
        BackgroundContext::new(self.abort.clone())
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        TaskManager::new()
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop_all(true, true);
    }
}

fn worker_loop(
    jobs: Receiver<ProcessorTask>,
    done: Sender<ProcessorTask>,
    context: BackgroundContext,
    in_flight: Arc<AtomicUsize>,
) {
    while let Ok(mut task) = jobs.recv() {
        task.run_background(&context);
        // hand over before the count drops, so "nothing in flight" implies
        // every result is on the main queue
        let _ = done.send(task);
        in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
