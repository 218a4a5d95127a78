//! Index-keyed allocation of workers shared across the whole flow.
//!
//! Nodes can pin themselves to explicit worker indices, in which case two
//! nodes naming the same index share one thread. Indices below
//! [`USER_WORKER_RANGE_END`] are reserved for the graph declaration;
//! internally allocated workers start at [`AUTO_WORKER_BASE`].

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use super::worker::Worker;

/// Exclusive upper bound of the worker indices a graph may declare.
pub const USER_WORKER_RANGE_END: u32 = 1000;
/// First index handed out for internally allocated workers.
pub const AUTO_WORKER_BASE: u32 = 1100;

struct RegistryInner {
    workers: FxHashMap<u32, Arc<Worker>>,
    next_auto: u32,
}

/// Owns every worker in a flow and hands them out by index.
pub struct WorkerRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                workers: FxHashMap::default(),
                next_auto: AUTO_WORKER_BASE,
            }),
        }
    }

    /// Get the worker at `index`, spawning it on first use.
    pub fn create(&self, index: u32) -> Arc<Worker> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        Arc::clone(
            inner
                .workers
                .entry(index)
                .or_insert_with(|| Arc::new(Worker::new(index))),
        )
    }

    /// Spawn a fresh worker at the next free auto index.
    pub fn create_auto(&self) -> Arc<Worker> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let index = inner.next_auto;
        inner.next_auto += 1;
        let worker = Arc::new(Worker::new(index));
        inner.workers.insert(index, Arc::clone(&worker));
        worker
    }

    #[must_use]
    pub fn get(&self, index: u32) -> Option<Arc<Worker>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .workers
            .get(&index)
            .cloned()
    }

    #[must_use]
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .workers
            .values()
            .cloned()
            .collect()
    }

    /// Stop every worker. Called once at flow teardown.
    pub fn stop_all(&self) {
        for worker in self.workers() {
            worker.stop();
        }
    }
}
