//! Owns a node's method instances and decides where they run.
//!
//! The manager translates a method's declared [`MethodInfo`] traits plus
//! the node's thread configuration into an instance count, a per-worker
//! context layout, and a pool posting strategy:
//!
//! * `source_affine` methods get one instance per data source, and a
//!   source's records are always dispatched to that instance (key-matched
//!   posting when the method is also not thread safe, so one source is
//!   never served by two instances concurrently);
//! * plain non-thread-safe methods get one instance pinned to each
//!   worker;
//! * thread-safe methods get a pool of instances any worker may run,
//!   dispatched round-robin.
//!
//! Non-thread-safe instances are initialized lazily by a prepare task on
//! the worker that owns them, exactly once per context; thread-safe pools
//! are initialized eagerly on the constructing thread. A failed init on
//! the constructing thread fails flow construction; a failed init inside
//! a worker aborts the process, since a half-initialized method cannot
//! safely serve any subsequent record.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use rustc_hash::FxHashMap;

use crate::data::{MethodParam, Payload};
use crate::graph::NodeSpec;
use crate::method::{Batch, Method, MethodError, MethodInfo, MethodRegistry};
use crate::workers::{PoolError, PoolTask, PostStrategy, WorkerPool, WorkerRegistry};

type MethodCell = Arc<Mutex<Box<dyn Method>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContextState {
    Idle,
    Initialized,
    Finalized,
}

/// Per-worker view of the method instances that worker may run.
pub struct MethodContext {
    methods: FxHashMap<u64, MethodCell>,
    config: Arc<serde_json::Value>,
    method_name: String,
    state: Mutex<ContextState>,
    initialized: Condvar,
}

impl MethodContext {
    fn new(
        method_name: String,
        config: Arc<serde_json::Value>,
        state: ContextState,
    ) -> Self {
        Self {
            methods: FxHashMap::default(),
            config,
            method_name,
            state: Mutex::new(state),
            initialized: Condvar::new(),
        }
    }

    /// Initialize this context's instances. Runs as the pool prepare
    /// task, on the owning worker, before any real task.
    fn initialize(&self) {
        let mut state = self.state.lock().expect("context state poisoned");
        if *state != ContextState::Idle {
            return;
        }
        for cell in self.methods.values() {
            let mut method = cell.lock().expect("method instance poisoned");
            if let Err(error) = method.init(&self.config) {
                tracing::error!(
                    method = %self.method_name,
                    %error,
                    "method init failed on its worker; aborting"
                );
                std::process::abort();
            }
        }
        *state = ContextState::Initialized;
        self.initialized.notify_all();
    }

    fn wait_initialized(&self) {
        let mut state = self.state.lock().expect("context state poisoned");
        while *state == ContextState::Idle {
            state = self
                .initialized
                .wait(state)
                .expect("context state poisoned");
        }
    }

    fn is_initialized(&self) -> bool {
        *self.state.lock().expect("context state poisoned") == ContextState::Initialized
    }
}

/// Method instance ownership and dispatch for one node.
pub struct MethodManager {
    name: String,
    info: MethodInfo,
    instances: Vec<MethodCell>,
    contexts: Vec<Arc<MethodContext>>,
    pool: WorkerPool<MethodContext>,
    /// Readers are in-flight `process` calls; the writer is
    /// `update_parameter`. Readers may run concurrently.
    gate: Arc<RwLock<()>>,
    round_robin: AtomicUsize,
}

impl MethodManager {
    /// Build the manager for `spec`: allocate workers, create and lay out
    /// instances, and start the pool.
    pub fn new(
        spec: &NodeSpec,
        source_count: u32,
        engine: &WorkerRegistry,
        registry: &MethodRegistry,
    ) -> Result<Self, MethodError> {
        let workers = match &spec.workers {
            Some(indices) => indices.iter().map(|&i| engine.create(i)).collect::<Vec<_>>(),
            None => (0..spec.thread_count.unwrap_or(1).max(1))
                .map(|_| engine.create_auto())
                .collect(),
        };
        let thread_count = workers.len();

        let first = registry.create(&spec.method_type)?;
        let info = first.info();

        if info.source_affine && thread_count > source_count as usize {
            return Err(MethodError::ThreadCountExceedsSources {
                method_name: spec.name.clone(),
                thread_count,
                source_count,
            });
        }

        let instance_count = if info.source_affine {
            source_count as usize
        } else {
            thread_count
        };
        let mut instances: Vec<MethodCell> = Vec::with_capacity(instance_count);
        instances.push(Arc::new(Mutex::new(first)));
        for _ in 1..instance_count {
            instances.push(Arc::new(Mutex::new(registry.create(&spec.method_type)?)));
        }

        let config = Arc::new(spec.resolved_method_config()?);

        if info.thread_safe {
            // Any worker may touch any instance, so there is no affinity
            // to respect and init can happen right here.
            for cell in &instances {
                let mut method = cell.lock().expect("method instance poisoned");
                method.init(&config).map_err(|e| MethodError::InitFailed {
                    method_name: spec.name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        let initial_state = if info.thread_safe {
            ContextState::Initialized
        } else {
            ContextState::Idle
        };
        let mut contexts: Vec<MethodContext> = (0..thread_count)
            .map(|_| MethodContext::new(spec.name.clone(), Arc::clone(&config), initial_state))
            .collect();

        if info.thread_safe {
            // Every context sees the whole instance pool.
            for context in &mut contexts {
                for (key, cell) in instances.iter().enumerate() {
                    context.methods.insert(key as u64, Arc::clone(cell));
                }
            }
        } else if info.source_affine {
            // Instance i serves source i and lives on worker i mod T.
            for (i, cell) in instances.iter().enumerate() {
                contexts[i % thread_count]
                    .methods
                    .insert(i as u64, Arc::clone(cell));
            }
        } else {
            // One instance pinned per worker, addressed by a fixed key:
            // round-robin posting cannot know which worker will run the
            // task, so the key must be worker-independent.
            for (i, cell) in instances.iter().enumerate() {
                contexts[i % thread_count].methods.insert(0, Arc::clone(cell));
            }
        }

        let contexts: Vec<Arc<MethodContext>> = contexts.into_iter().map(Arc::new).collect();
        let prepares: Vec<Option<PoolTask<MethodContext>>> = contexts
            .iter()
            .map(|_| {
                Some(Box::new(|ctx: &MethodContext| ctx.initialize()) as PoolTask<MethodContext>)
            })
            .collect();

        let pool = WorkerPool::new(spec.name.clone(), workers, prepares, contexts.clone());
        if info.source_affine && !info.thread_safe {
            pool.set_strategy(PostStrategy::KeyMatching);
            pool.set_key_matcher(Box::new(|key, contexts| {
                Some(key as usize % contexts.len())
            }));
        }

        for context in &contexts {
            context.wait_initialized();
        }

        if let Some(priority) = &spec.thread_priority {
            pool.set_priority(priority);
        }

        Ok(Self {
            name: spec.name.clone(),
            info,
            instances,
            contexts,
            pool,
            gate: Arc::new(RwLock::new(())),
            round_robin: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn needs_reorder(&self) -> bool {
        self.info.needs_reorder
    }

    /// Submit one batch for asynchronous processing. `on_result` runs on
    /// the selected worker thread with the method's output batch.
    pub fn process_async(
        &self,
        inputs: Vec<Vec<Arc<Payload>>>,
        params: Vec<Option<Arc<MethodParam>>>,
        on_result: impl FnOnce(Batch) + Send + 'static,
        source_id: u32,
    ) -> Result<(), PoolError> {
        let key = self.dispatch_key(source_id);
        let gate = Arc::clone(&self.gate);
        let name = self.name.clone();
        let task: PoolTask<MethodContext> = Box::new(move |ctx| {
            let Some(cell) = ctx.methods.get(&key) else {
                tracing::error!(method = %name, key, "no method instance for dispatch key");
                return;
            };
            if !ctx.is_initialized() {
                tracing::warn!(method = %name, "dropping work for finalized method context");
                return;
            }
            let outputs = {
                let _processing = gate.read().expect("method gate poisoned");
                let mut method = cell.lock().expect("method instance poisoned");
                method.process(&inputs, &params)
            };
            on_result(outputs);
        });
        self.pool.post(task, Some(u64::from(source_id)))
    }

    fn dispatch_key(&self, source_id: u32) -> u64 {
        if self.info.source_affine {
            u64::from(source_id)
        } else if self.info.thread_safe {
            (self.round_robin.fetch_add(1, Ordering::Relaxed) % self.instances.len()) as u64
        } else {
            0
        }
    }

    /// Apply a parameter update to every owned instance. The write lock
    /// excludes in-flight `process` calls for the duration.
    pub fn update_parameter(&self, param: &MethodParam) -> Result<(), MethodError> {
        let _exclusive = self.gate.write().expect("method gate poisoned");
        for cell in &self.instances {
            let mut method = cell.lock().expect("method instance poisoned");
            method
                .update_parameter(param)
                .map_err(|e| MethodError::UpdateRejected {
                    method_name: self.name.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn parameter(&self) -> Option<MethodParam> {
        let cell = self.instances.first()?;
        cell.lock().expect("method instance poisoned").parameter()
    }

    #[must_use]
    pub fn version(&self) -> String {
        self.instances
            .first()
            .map(|cell| cell.lock().expect("method instance poisoned").version())
            .unwrap_or_default()
    }
}

impl Drop for MethodManager {
    fn drop(&mut self) {
        self.pool.stop();
        for context in &self.contexts {
            let mut state = context.state.lock().expect("context state poisoned");
            *state = ContextState::Finalized;
        }
        for cell in &self.instances {
            cell.lock().expect("method instance poisoned").finalize();
        }
    }
}
