//! The caller-facing surface: build a flow from a declarative spec and a
//! method registry, then predict synchronously or asynchronously.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::data::{FlowInput, FlowOutput, MethodParam, ResultCallback, codes};
use crate::graph::{FlowSpec, GraphError, GraphPlan};
use crate::method::{MethodError, MethodRegistry};
use crate::scheduler::Scheduler;
use crate::wheel::TimingWheel;
use crate::workers::WorkerRegistry;

/// Errors surfaced by the [`Flow`] API.
#[derive(Debug, Error, Diagnostic)]
pub enum FlowError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Method(#[from] MethodError),

    #[error("no flow configuration was provided to the builder")]
    #[diagnostic(
        code(weft::flow::missing_config),
        help("Call config_file or config_value before build.")
    )]
    MissingConfig,

    #[error("source id {source_id} is out of range, the flow declares {source_count} sources")]
    #[diagnostic(code(weft::flow::invalid_source))]
    InvalidSource { source_id: u32, source_count: u32 },

    #[error("input {name} does not name any slot in the flow")]
    #[diagnostic(code(weft::flow::unknown_input))]
    UnknownInput { name: String },

    /// The in-flight record cap was hit; nothing was ingested.
    #[error("too many records in flight (limit {max_in_flight})")]
    #[diagnostic(
        code(weft::flow::capacity),
        help("Back off and retry, or raise max_in_flight in the flow spec.")
    )]
    CapacityExceeded { max_in_flight: usize },

    #[error("async_predict requires a result callback")]
    #[diagnostic(code(weft::flow::callback_missing))]
    CallbackMissing,

    #[error("sync_predict requires exactly one output group, the flow declares {count}")]
    #[diagnostic(
        code(weft::flow::multiple_groups),
        help("Use sync_predict_multi for flows with several output groups.")
    )]
    MultipleOutputGroups { count: usize },

    #[error("unknown node: {name}")]
    #[diagnostic(code(weft::flow::unknown_node))]
    UnknownNode { name: String },

    #[error("unsupported config key: {key}")]
    #[diagnostic(code(weft::flow::config_key))]
    UnsupportedConfigKey { key: String },

    #[error("the flow shut down before the result was delivered")]
    #[diagnostic(code(weft::flow::channel_closed))]
    ResultChannelClosed,
}

impl FlowError {
    /// Numeric rendition for callers aggregating with per-slot codes.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            Self::CapacityExceeded { .. } => codes::CAPACITY_EXCEEDED,
            Self::InvalidSource { .. } | Self::UnknownInput { .. } => codes::INVALID_INPUT,
            _ => codes::METHOD,
        }
    }
}

enum ConfigSource {
    File(PathBuf),
    Value(serde_json::Value),
}

/// Builder for a [`Flow`]: a method registry plus a flow spec.
pub struct FlowBuilder {
    registry: MethodRegistry,
    config: Option<ConfigSource>,
}

impl Default for FlowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: MethodRegistry::new(),
            config: None,
        }
    }

    /// Use a pre-populated method registry.
    #[must_use]
    pub fn registry(mut self, registry: MethodRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a single method type on the builder's registry.
    #[must_use]
    pub fn register_method<F, M>(mut self, method_type: impl Into<String>, build: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: crate::method::Method + 'static,
    {
        self.registry.register(method_type, build);
        self
    }

    /// Load the flow spec from a JSON file at build time.
    #[must_use]
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(ConfigSource::File(path.into()));
        self
    }

    /// Use an inline JSON flow spec.
    #[must_use]
    pub fn config_value(mut self, value: serde_json::Value) -> Self {
        self.config = Some(ConfigSource::Value(value));
        self
    }

    /// Compile the graph, spin up workers and the timing wheel, and
    /// initialize every method.
    pub fn build(self) -> Result<Flow, FlowError> {
        let spec = match self.config.ok_or(FlowError::MissingConfig)? {
            ConfigSource::File(path) => FlowSpec::from_file(path).map_err(GraphError::from)?,
            ConfigSource::Value(value) => {
                FlowSpec::from_value(value).map_err(GraphError::from)?
            }
        };
        let plan = GraphPlan::compile(spec)?;
        tracing::info!(
            nodes = plan.nodes.len(),
            slots = plan.slot_names.len(),
            groups = plan.output_groups.len(),
            sources = plan.source_count,
            "flow compiled"
        );

        let engine = Arc::new(WorkerRegistry::new());
        let wheel = Arc::new(TimingWheel::new());
        wheel.start();
        let scheduler = Scheduler::build(plan, &self.registry, Arc::clone(&engine), Arc::clone(&wheel))?;
        Ok(Flow {
            scheduler,
            wheel,
            engine,
        })
    }
}

/// A running pipeline.
///
/// Dropping the flow stops the timing wheel and every worker; records
/// still in flight are abandoned.
pub struct Flow {
    scheduler: Arc<Scheduler>,
    wheel: Arc<TimingWheel>,
    engine: Arc<WorkerRegistry>,
}

impl Flow {
    #[must_use]
    pub fn builder() -> FlowBuilder {
        FlowBuilder::new()
    }

    /// Register the callback receiving completed output groups for
    /// asynchronous predictions.
    pub fn set_callback(&self, callback: ResultCallback) {
        self.scheduler.set_callback(Some(callback));
    }

    /// Register (`Some`) or remove (`None`) a direct callback for one
    /// node's own results, independent of frame completion.
    pub fn set_node_callback(
        &self,
        node_name: &str,
        callback: Option<ResultCallback>,
    ) -> Result<(), FlowError> {
        self.scheduler.set_node_callback(node_name, callback)
    }

    /// Blocking single-output prediction. The flow must declare exactly
    /// one output group.
    pub fn sync_predict(&self, input: FlowInput) -> Result<FlowOutput, FlowError> {
        let groups = self.scheduler.output_group_count();
        if groups != 1 {
            return Err(FlowError::MultipleOutputGroups { count: groups });
        }
        let mut outputs = self.sync_predict_multi(input)?;
        outputs.pop().ok_or(FlowError::ResultChannelClosed)
    }

    /// Blocking prediction returning every output group.
    pub fn sync_predict_multi(&self, input: FlowInput) -> Result<Vec<FlowOutput>, FlowError> {
        let (sender, receiver) = flume::bounded(1);
        self.scheduler.ingest(input, Some(sender))?;
        receiver.recv().map_err(|_| FlowError::ResultChannelClosed)
    }

    /// Asynchronous prediction; completed output groups arrive on the
    /// registered callback. Returns the record's per-source sequence id.
    pub fn async_predict(&self, input: FlowInput) -> Result<u64, FlowError> {
        if !self.scheduler.has_callback() {
            return Err(FlowError::CallbackMissing);
        }
        self.scheduler.ingest(input, None)
    }

    /// Apply a runtime parameter to every instance of a node's method.
    pub fn update_parameter(&self, node_name: &str, param: &MethodParam) -> Result<(), FlowError> {
        self.scheduler.update_parameter(node_name, param)
    }

    /// Query a node's current method parameter.
    pub fn parameter(&self, node_name: &str) -> Result<Option<MethodParam>, FlowError> {
        self.scheduler.parameter(node_name)
    }

    /// Query a node's method version string.
    pub fn node_version(&self, node_name: &str) -> Result<String, FlowError> {
        self.scheduler.node_version(node_name)
    }

    /// Toggle release of intermediate slot data once every dependant has
    /// consumed it. Off by default.
    pub fn set_release_slots(&self, enabled: bool) {
        self.scheduler.set_release_slots(enabled);
    }

    /// String-keyed configuration surface for embedders.
    ///
    /// Supported keys: `release_slots` with `on`/`off`.
    pub fn set_config(&self, key: &str, value: &str) -> Result<(), FlowError> {
        match key {
            "release_slots" => {
                self.set_release_slots(value == "on");
                Ok(())
            }
            other => Err(FlowError::UnsupportedConfigKey {
                key: other.to_string(),
            }),
        }
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.wheel.stop();
        self.scheduler.shutdown();
        self.engine.stop_all();
    }
}
