//! The pluggable computation boundary: the [`Method`] trait, its
//! capability descriptor, and the name-keyed [`MethodRegistry`] factory.
//!
//! Methods are external collaborators. The scheduler never inspects what a
//! method computes; it only routes batches of slot payloads in and out and
//! honours the declared [`MethodInfo`] traits when deciding how many
//! instances to create and where they may run.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::data::{MethodParam, Payload};

/// Capability flags controlling how the method manager schedules a method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MethodInfo {
    /// Any worker thread may run any instance. When false, each instance
    /// is pinned to exactly one worker.
    pub thread_safe: bool,
    /// Results must be released downstream in per-source sequence order.
    pub needs_reorder: bool,
    /// The method keeps per-source state; one instance is created per
    /// data source and a source is always served by its own instance.
    pub source_affine: bool,
}

/// Batched method output: outer `Vec` over records, inner `Vec` over the
/// node's output slots.
pub type Batch = Vec<Vec<Arc<Payload>>>;

/// A stateful computation unit invoked by a node.
///
/// `process` receives one inner `Vec` per record, ordered like the node's
/// declared input slots, and returns the same shape for the output slots.
/// Per-slot failures are reported through the returned payloads' error
/// codes, not through a `Result`.
pub trait Method: Send {
    /// One-time initialization with the node's method configuration.
    fn init(&mut self, config: &serde_json::Value) -> Result<(), MethodError>;

    /// Process a batch of records.
    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        params: &[Option<Arc<MethodParam>>],
    ) -> Batch;

    /// Apply a runtime parameter update.
    fn update_parameter(&mut self, param: &MethodParam) -> Result<(), MethodError>;

    /// The current runtime parameter, if the method exposes one.
    fn parameter(&self) -> Option<MethodParam> {
        None
    }

    /// Implementation version string, e.g. `"metric_v0.4.0"`.
    fn version(&self) -> String {
        String::new()
    }

    /// Release held resources. Called once at teardown.
    fn finalize(&mut self) {}

    /// Scheduling traits. The default is the most conservative profile:
    /// not thread safe, no reordering, no source affinity.
    fn info(&self) -> MethodInfo {
        MethodInfo::default()
    }
}

type MethodBuilder = Box<dyn Fn() -> Box<dyn Method> + Send + Sync>;

/// Factory mapping a method type name to a constructor.
///
/// The graph declaration references methods by type name; the registry is
/// how the host application supplies the implementations.
#[derive(Default)]
pub struct MethodRegistry {
    builders: FxHashMap<String, MethodBuilder>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `method_type`, replacing any previous
    /// registration for that name.
    pub fn register<F, M>(&mut self, method_type: impl Into<String>, build: F)
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Method + 'static,
    {
        self.builders
            .insert(method_type.into(), Box::new(move || Box::new(build())));
    }

    /// Construct a fresh instance of `method_type`.
    pub fn create(&self, method_type: &str) -> Result<Box<dyn Method>, MethodError> {
        self.builders
            .get(method_type)
            .map(|build| build())
            .ok_or_else(|| MethodError::UnknownMethodType {
                method_type: method_type.to_string(),
            })
    }

    #[must_use]
    pub fn contains(&self, method_type: &str) -> bool {
        self.builders.contains_key(method_type)
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("types", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors raised at the method boundary.
#[derive(Debug, Error, Diagnostic)]
pub enum MethodError {
    /// No constructor registered for the requested type name.
    #[error("unknown method type: {method_type}")]
    #[diagnostic(
        code(weft::method::unknown_type),
        help("Register the method type on the MethodRegistry before building the flow.")
    )]
    UnknownMethodType { method_type: String },

    /// `Method::init` rejected its configuration.
    #[error("method init failed for {method_name}: {reason}")]
    #[diagnostic(code(weft::method::init))]
    InitFailed { method_name: String, reason: String },

    /// `Method::update_parameter` rejected the update on some instance.
    #[error("parameter update rejected by {method_name}: {reason}")]
    #[diagnostic(code(weft::method::update_rejected))]
    UpdateRejected { method_name: String, reason: String },

    /// A source-affine method was configured with more worker threads
    /// than there are data sources.
    #[error(
        "node {method_name}: thread count {thread_count} exceeds source count {source_count}"
    )]
    #[diagnostic(
        code(weft::method::thread_count),
        help("A source-affine method needs at most one worker thread per data source.")
    )]
    ThreadCountExceedsSources {
        method_name: String,
        thread_count: usize,
        source_count: u32,
    },

    /// The method configuration file could not be read or parsed.
    #[error("failed to load method config {path} for {method_name}: {reason}")]
    #[diagnostic(code(weft::method::config))]
    ConfigLoad {
        method_name: String,
        path: String,
        reason: String,
    },
}
