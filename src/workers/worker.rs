//! Single-consumer task queue bound to one background OS thread.
//!
//! A [`Worker`] is the serialization primitive the rest of the system is
//! built on: everything posted to one worker runs on its single thread in
//! FIFO order, so state touched only from one worker's tasks needs no
//! further synchronization. Tasks carry an origin tag so a tenant (a pool,
//! a node) can be torn down by removing exactly its own pending work from
//! a shared worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A queued unit of work with the tag of whoever posted it.
pub struct Task {
    origin: String,
    run: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub fn new(origin: impl Into<String>, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            origin: origin.into(),
            run: Box::new(run),
        }
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub(crate) fn into_inner(self) -> Box<dyn FnOnce() + Send> {
        self.run
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("origin", &self.origin).finish()
    }
}

/// OS scheduling policy requested for a worker thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedPolicy {
    #[serde(rename = "SCHED_NORMAL", alias = "SCHED_OTHER")]
    Normal,
    #[serde(rename = "SCHED_BATCH")]
    Batch,
    #[serde(rename = "SCHED_FIFO")]
    Fifo,
    #[serde(rename = "SCHED_RR")]
    RoundRobin,
    #[serde(rename = "SCHED_IDLE")]
    Idle,
}

/// Thread-priority request attached to a node or to the scheduler threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPriority {
    pub policy: SchedPolicy,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    /// The worker's pending-task limit was reached; the task was not
    /// enqueued and no partial state exists.
    #[error("worker {index}: task queue is full")]
    #[diagnostic(
        code(weft::worker::queue_full),
        help("Raise the pending-task limit or slow the producer down.")
    )]
    QueueFull { index: u32 },
}

struct QueueState {
    queue: VecDeque<Task>,
    max_pending: usize,
    pause: u32,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
    stopped: AtomicBool,
}

/// A task queue with a dedicated execution thread.
pub struct Worker {
    index: u32,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a worker with an unbounded queue.
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self::with_max_pending(index, usize::MAX)
    }

    /// Spawn a worker that rejects posts beyond `max_pending` queued tasks.
    #[must_use]
    pub fn with_max_pending(index: u32, max_pending: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                max_pending,
                pause: 0,
            }),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("weft-worker-{index}"))
            .spawn(move || exec_loop(&loop_shared))
            .expect("failed to spawn worker thread");
        Self {
            index,
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn set_max_pending(&self, max_pending: usize) {
        self.shared.state.lock().expect("worker state poisoned").max_pending = max_pending;
    }

    /// Enqueue `run` under `origin`. Posts after [`stop`](Self::stop) are
    /// dropped without error.
    pub fn post(
        &self,
        origin: impl Into<String>,
        run: impl FnOnce() + Send + 'static,
    ) -> Result<(), WorkerError> {
        self.post_task(Task::new(origin, run))
    }

    pub fn post_task(&self, task: Task) -> Result<(), WorkerError> {
        if self.shared.stopped.load(Ordering::Acquire) {
            tracing::debug!(worker = self.index, origin = task.origin(), "dropping post to stopped worker");
            return Ok(());
        }
        let mut state = self.shared.state.lock().expect("worker state poisoned");
        if state.queue.len() >= state.max_pending {
            return Err(WorkerError::QueueFull { index: self.index });
        }
        state.queue.push_back(task);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Suspend task consumption. Nested: each `pause` needs one `resume`.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock().expect("worker state poisoned");
        state.pause += 1;
    }

    pub fn resume(&self) {
        let mut state = self.shared.state.lock().expect("worker state poisoned");
        state.pause = state.pause.saturating_sub(1);
        self.shared.available.notify_one();
    }

    /// Remove and return every pending task whose origin matches.
    pub fn clear_tagged(&self, origin: &str) -> Vec<Task> {
        let mut state = self.shared.state.lock().expect("worker state poisoned");
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(state.queue.len());
        for task in state.queue.drain(..) {
            if task.origin() == origin {
                removed.push(task);
            } else {
                kept.push_back(task);
            }
        }
        state.queue = kept;
        removed
    }

    /// Remove and return every pending task.
    pub fn clear_all(&self) -> Vec<Task> {
        let mut state = self.shared.state.lock().expect("worker state poisoned");
        state.queue.drain(..).collect()
    }

    /// Stop consuming, join the execution thread, and drop whatever is
    /// still queued. Idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.available.notify_all();
        let handle = self.handle.lock().expect("worker handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Record a priority request for this worker's thread.
    ///
    /// No OS scheduling interface is linked in this build, so the request
    /// is logged rather than applied.
    pub fn set_priority(&self, priority: &ThreadPriority) {
        tracing::warn!(
            worker = self.index,
            policy = ?priority.policy,
            priority = priority.priority,
            "thread priority request recorded; OS scheduling is not applied in this build"
        );
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().expect("worker state poisoned").queue.len()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("index", &self.index).finish()
    }
}

fn exec_loop(shared: &Shared) {
    loop {
        let task = {
            let mut state = shared.state.lock().expect("worker state poisoned");
            loop {
                if shared.stopped.load(Ordering::Acquire) {
                    return;
                }
                if state.pause == 0 {
                    if let Some(task) = state.queue.pop_front() {
                        break task;
                    }
                }
                state = shared
                    .available
                    .wait(state)
                    .expect("worker state poisoned");
            }
        };
        (task.into_inner())();
    }
}
