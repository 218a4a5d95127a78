//! Named grouping of workers with a posting strategy and per-worker
//! contexts.
//!
//! A pool does not own its workers: several pools can share the same
//! underlying threads, which is why every post is tagged with the pool
//! name and teardown clears only this pool's tasks. The per-worker context
//! `C` carries whatever the tenant needs thread-local access to; for the
//! method manager that is the set of method instances a worker may run.

use std::sync::{Arc, Mutex};

use miette::Diagnostic;
use thiserror::Error;

use super::worker::{Task, ThreadPriority, Worker, WorkerError};

/// A task bound to a pool: runs with the selected worker's context.
pub type PoolTask<C> = Box<dyn FnOnce(&C) + Send>;

/// Maps a posting key onto a worker index, given the per-worker contexts.
pub type KeyMatcher<C> = Box<dyn Fn(u64, &[Arc<C>]) -> Option<usize> + Send + Sync>;

/// How [`WorkerPool::post`] selects a worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PostStrategy {
    #[default]
    RoundRobin,
    KeyMatching,
}

#[derive(Debug, Error, Diagnostic)]
pub enum PoolError {
    /// Key-matched posting requires a key on every post.
    #[error("pool {pool}: post without a key under the key-matching strategy")]
    #[diagnostic(code(weft::pool::missing_key))]
    MissingKey { pool: String },

    /// The matcher found no worker for the key. This signals a
    /// configuration or logic error, not a transient failure.
    #[error("pool {pool}: no worker matches key {key}")]
    #[diagnostic(
        code(weft::pool::no_matching_worker),
        help("The key matcher must cover every key the pool can be posted with.")
    )]
    NoMatchingWorker { pool: String, key: u64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Worker(#[from] WorkerError),
}

struct PoolInner<C> {
    workers: Vec<Arc<Worker>>,
    contexts: Vec<Arc<C>>,
    strategy: PostStrategy,
    matcher: Option<KeyMatcher<C>>,
    next: usize,
    stopped: bool,
}

/// A fixed set of workers behind one posting surface.
pub struct WorkerPool<C> {
    name: String,
    inner: Mutex<PoolInner<C>>,
}

impl<C: Send + Sync + 'static> WorkerPool<C> {
    /// Build a pool over `workers` with one context and one optional
    /// prepare task per worker. Prepares are posted immediately and run
    /// before any task posted later, because each worker is FIFO.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        workers: Vec<Arc<Worker>>,
        prepares: Vec<Option<PoolTask<C>>>,
        contexts: Vec<Arc<C>>,
    ) -> Self {
        let name = name.into();
        assert!(
            !workers.is_empty()
                && workers.len() == prepares.len()
                && workers.len() == contexts.len(),
            "pool {name}: workers, prepares and contexts must be parallel and non-empty"
        );
        for (i, prepare) in prepares.into_iter().enumerate() {
            if let Some(prepare) = prepare {
                let ctx = Arc::clone(&contexts[i]);
                let _ = workers[i].post(name.clone(), move || prepare(&ctx));
            }
        }
        Self {
            inner: Mutex::new(PoolInner {
                workers,
                contexts,
                strategy: PostStrategy::RoundRobin,
                matcher: None,
                next: 0,
                stopped: false,
            }),
            name,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_strategy(&self, strategy: PostStrategy) {
        self.inner.lock().expect("pool poisoned").strategy = strategy;
    }

    pub fn set_key_matcher(&self, matcher: KeyMatcher<C>) {
        self.inner.lock().expect("pool poisoned").matcher = Some(matcher);
    }

    /// Post a task, selecting a worker per the configured strategy.
    /// Posts after [`stop`](Self::stop) are dropped without error.
    pub fn post(&self, task: PoolTask<C>, key: Option<u64>) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if inner.stopped {
            return Ok(());
        }
        let index = Self::select_worker(&self.name, &mut inner, key)?;
        let ctx = Arc::clone(&inner.contexts[index]);
        inner.workers[index]
            .post(self.name.clone(), move || task(&ctx))
            .map_err(PoolError::from)
    }

    fn select_worker(
        name: &str,
        inner: &mut PoolInner<C>,
        key: Option<u64>,
    ) -> Result<usize, PoolError> {
        match inner.strategy {
            PostStrategy::RoundRobin => {
                let cursor = inner.next % inner.workers.len();
                inner.next = inner.next.wrapping_add(1);
                Ok(cursor)
            }
            PostStrategy::KeyMatching => {
                let key = key.ok_or_else(|| PoolError::MissingKey {
                    pool: name.to_string(),
                })?;
                let matcher =
                    inner
                        .matcher
                        .as_ref()
                        .ok_or_else(|| PoolError::NoMatchingWorker {
                            pool: name.to_string(),
                            key,
                        })?;
                matcher(key, &inner.contexts).ok_or_else(|| PoolError::NoMatchingWorker {
                    pool: name.to_string(),
                    key,
                })
            }
        }
    }

    /// Add a worker (and its context) to the pool.
    pub fn add_worker(
        &self,
        worker: Arc<Worker>,
        prepare: Option<PoolTask<C>>,
        context: Arc<C>,
    ) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if let Some(prepare) = prepare {
            let ctx = Arc::clone(&context);
            let _ = worker.post(self.name.clone(), move || prepare(&ctx));
        }
        inner.workers.push(worker);
        inner.contexts.push(context);
    }

    /// Remove the most recently added worker, migrating its pending pool
    /// tasks onto the remaining workers. Fails (returns `None`) when only
    /// one worker is left.
    pub fn remove_worker(&self) -> Option<Arc<Worker>> {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if inner.workers.len() <= 1 {
            return None;
        }
        let removed = inner.workers.pop()?;
        inner.contexts.pop();
        let orphaned = removed.clear_tagged(&self.name);
        for task in orphaned {
            let index = inner.next % inner.workers.len();
            inner.next = inner.next.wrapping_add(1);
            let _ = inner.workers[index].post_task(Task::new(self.name.clone(), task.into_inner()));
        }
        Some(removed)
    }

    /// Stop the pool: clear this pool's pending tasks from every member
    /// worker while leaving other tenants' tasks untouched. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        for worker in &inner.workers {
            worker.pause();
            worker.clear_tagged(&self.name);
            worker.resume();
        }
    }

    /// Clear this pool's pending tasks without stopping it.
    pub fn clear_tasks(&self) {
        let inner = self.inner.lock().expect("pool poisoned");
        for worker in &inner.workers {
            worker.pause();
            worker.clear_tagged(&self.name);
            worker.resume();
        }
    }

    pub fn set_priority(&self, priority: &ThreadPriority) {
        let inner = self.inner.lock().expect("pool poisoned");
        for worker in &inner.workers {
            worker.set_priority(priority);
        }
    }

    #[must_use]
    pub fn worker_indices(&self) -> Vec<u32> {
        self.inner
            .lock()
            .expect("pool poisoned")
            .workers
            .iter()
            .map(|w| w.index())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool poisoned").workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C> Drop for WorkerPool<C> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().expect("pool poisoned");
        if !inner.stopped {
            inner.stopped = true;
            for worker in &inner.workers {
                worker.pause();
                worker.clear_tagged(&self.name);
                worker.resume();
            }
        }
    }
}
