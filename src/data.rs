//! Core data types that flow between the caller, the scheduler, and methods.
//!
//! A [`Payload`] is the unit of slot data: an opaque, shareable value plus
//! per-slot error and visibility state. Callers feed named payloads in via
//! [`FlowInput`] and receive them back, regrouped by output group or node,
//! in [`FlowOutput`]. Per-record method behaviour is tuned with
//! [`MethodParam`] overrides, including the four disable fill modes.

use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque slot value. Methods downcast to their concrete types.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Numeric per-slot and per-result error codes.
///
/// Aggregate results sum the codes of their member slots and concatenate
/// the detail strings, so a caller can both branch on the aggregate and
/// inspect individual payloads.
pub mod codes {
    pub const OK: i32 = 0;
    pub const INVALID_INPUT: i32 = -1000;
    pub const CAPACITY_EXCEEDED: i32 = -1001;
    pub const METHOD: i32 = -2000;
    pub const METHOD_TIMEOUT: i32 = -2001;
    pub const OUTPUT_NOT_READY: i32 = -2002;
    pub const STALE_SEQUENCE: i32 = -2003;
}

/// Visibility state of a payload, orthogonal to its error code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataState {
    #[default]
    Valid,
    Filtered,
    Invisible,
    Disappeared,
    Invalid,
}

/// One piece of slot data.
///
/// Payloads are immutable once constructed and shared via `Arc`: the
/// record's slot table, downstream consumers, and pass-through copies all
/// hold references to the same allocation.
#[derive(Clone, Debug, Default)]
pub struct Payload {
    pub state: DataState,
    pub error_code: i32,
    pub error_detail: String,
    pub value: Option<Value>,
}

impl Payload {
    /// A valid payload wrapping `value`.
    pub fn new(value: impl Any + Send + Sync) -> Self {
        Self {
            value: Some(Arc::new(value)),
            ..Default::default()
        }
    }

    /// An empty payload in the [`DataState::Invalid`] state.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            state: DataState::Invalid,
            ..Default::default()
        }
    }

    /// An empty payload carrying an error code and detail message.
    pub fn with_error(code: i32, detail: impl Into<String>) -> Self {
        Self {
            state: DataState::Invalid,
            error_code: code,
            error_detail: detail.into(),
            ..Default::default()
        }
    }

    /// Downcast the carried value to a concrete type.
    pub fn value_as<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref::<T>()
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error_code == codes::OK
    }
}

/// A payload paired with the slot name it was fed to or read from.
#[derive(Clone, Debug)]
pub struct Feed {
    pub name: String,
    pub payload: Arc<Payload>,
}

impl Feed {
    pub fn new(name: impl Into<String>, payload: Payload) -> Self {
        Self {
            name: name.into(),
            payload: Arc::new(payload),
        }
    }
}

/// Fill policy applied to a node's outputs when a record disables it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisableMode {
    /// Every output slot gets an empty [`DataState::Invalid`] payload.
    Invalid,
    /// Input slots are copied one-to-one onto output slots. The two lists
    /// must have the same length; a mismatch is a configuration error and
    /// nothing is copied.
    PassThrough,
    /// Copy as many inputs as are available onto the outputs, padding the
    /// remainder with invalid payloads.
    BestEffortPassThrough,
    /// Substitute caller-supplied payloads. The predefined list must match
    /// the output slot count exactly.
    UsePreDefine,
}

/// Per-record override for one named node.
#[derive(Clone, Debug)]
pub enum MethodParam {
    /// Disable the node for this record and fill its outputs per `mode`.
    Disable {
        method_name: String,
        mode: DisableMode,
        /// Payloads for [`DisableMode::UsePreDefine`]; ignored otherwise.
        predefined: Vec<Arc<Payload>>,
    },
    /// A JSON-formatted runtime parameter passed through to the method.
    Json {
        method_name: String,
        value: serde_json::Value,
    },
}

impl MethodParam {
    pub fn disable(method_name: impl Into<String>, mode: DisableMode) -> Self {
        Self::Disable {
            method_name: method_name.into(),
            mode,
            predefined: Vec::new(),
        }
    }

    pub fn json(method_name: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Json {
            method_name: method_name.into(),
            value,
        }
    }

    #[must_use]
    pub fn method_name(&self) -> &str {
        match self {
            Self::Disable { method_name, .. } | Self::Json { method_name, .. } => method_name,
        }
    }

    /// Whether the target node should still run for this record.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disable { .. })
    }
}

/// One unit of caller input: named payloads, per-node parameter overrides,
/// and the originating source id.
#[derive(Clone, Debug, Default)]
pub struct FlowInput {
    pub feeds: Vec<Feed>,
    pub params: Vec<Arc<MethodParam>>,
    pub source_id: u32,
}

impl FlowInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_feed(mut self, name: impl Into<String>, payload: Payload) -> Self {
        self.feeds.push(Feed::new(name, payload));
        self
    }

    #[must_use]
    pub fn with_param(mut self, param: MethodParam) -> Self {
        self.params.push(Arc::new(param));
        self
    }

    #[must_use]
    pub fn with_source(mut self, source_id: u32) -> Self {
        self.source_id = source_id;
        self
    }
}

/// One delivered result: a completed output group, a full sync result, or
/// a per-node callback payload.
#[derive(Clone, Debug, Default)]
pub struct FlowOutput {
    /// Sum of the member slots' error codes; `0` when everything is clean.
    pub error_code: i32,
    /// Concatenation of the member slots' error details.
    pub error_detail: String,
    /// Set when this result is a per-node callback delivery.
    pub node_name: Option<String>,
    /// Set when this result is an output-group delivery.
    pub group: Option<String>,
    pub data: Vec<Feed>,
    pub sequence_id: u64,
    pub source_id: u32,
    pub global_sequence_id: u64,
}

/// Callback invoked with completed output groups or per-node results.
pub type ResultCallback = Arc<dyn Fn(FlowOutput) + Send + Sync>;
