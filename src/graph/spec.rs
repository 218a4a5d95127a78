//! Serde model of the declarative topology consumed from the graph
//! compiler.
//!
//! Template and include expansion are a black box upstream of this crate;
//! what arrives here is the flattened form: an ordered node list with
//! named input and output slots, the externally fed inputs, and one or
//! more named output groups. [`FlowSpec::from_file`] additionally anchors
//! relative method-config paths at the spec file's directory, so a spec
//! can be loaded from anywhere.

use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::method::MethodError;
use crate::workers::ThreadPriority;

/// Group name used when the outputs are declared as a flat name list.
pub const DEFAULT_GROUP: &str = "output";

/// Declaration of one node: its method binding, slot wiring, and
/// execution placement.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeSpec {
    /// Unique node name; also the tag its tasks are posted under.
    pub name: String,
    /// Method type to instantiate from the registry.
    pub method_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Number of auto-allocated workers. Mutually exclusive with
    /// `workers`. Defaults to 1 when neither is given.
    #[serde(default)]
    pub thread_count: Option<usize>,
    /// Explicit worker indices; nodes naming the same index share a
    /// thread.
    #[serde(default)]
    pub workers: Option<Vec<u32>>,
    /// Bound on how long a dispatched record may wait for the method
    /// before its outputs are synthesized as timeout errors.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Inline method configuration.
    #[serde(default)]
    pub method_config: Option<serde_json::Value>,
    /// Method configuration loaded from a file, relative to the spec
    /// file when loaded via [`FlowSpec::from_file`].
    #[serde(default)]
    pub method_config_path: Option<String>,
    #[serde(default)]
    pub thread_priority: Option<ThreadPriority>,
}

impl NodeSpec {
    /// The method configuration to hand to `Method::init`: the inline
    /// value, the parsed file, or JSON null.
    pub fn resolved_method_config(&self) -> Result<serde_json::Value, MethodError> {
        if let Some(value) = &self.method_config {
            return Ok(value.clone());
        }
        let Some(path) = &self.method_config_path else {
            return Ok(serde_json::Value::Null);
        };
        let text = std::fs::read_to_string(path).map_err(|e| MethodError::ConfigLoad {
            method_name: self.name.clone(),
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| MethodError::ConfigLoad {
            method_name: self.name.clone(),
            path: path.clone(),
            reason: e.to_string(),
        })
    }
}

/// One named output group.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OutputGroupSpec {
    pub group: String,
    pub outputs: Vec<String>,
}

/// Flow outputs: either a flat slot-name list (one anonymous group, kept
/// for compatibility) or explicit named groups.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OutputsSpec {
    Flat(Vec<String>),
    Groups(Vec<OutputGroupSpec>),
}

impl OutputsSpec {
    /// Normalize to named groups.
    pub(crate) fn groups(&self) -> Vec<OutputGroupSpec> {
        match self {
            Self::Flat(names) => vec![OutputGroupSpec {
                group: DEFAULT_GROUP.to_string(),
                outputs: names.clone(),
            }],
            Self::Groups(groups) => groups.clone(),
        }
    }
}

/// Priority requests for the scheduler's own threads.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OptionalSpec {
    /// Priority for the scheduler drive thread.
    #[serde(default)]
    pub drive_priority: Option<ThreadPriority>,
    /// Priority for the shared node daemon thread.
    #[serde(default)]
    pub daemon_priority: Option<ThreadPriority>,
}

/// The complete declarative topology.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowSpec {
    /// Externally fed slot names.
    pub inputs: Vec<String>,
    pub outputs: OutputsSpec,
    /// Ordered node list. Every node input must be produced by an
    /// earlier node or fed externally.
    pub nodes: Vec<NodeSpec>,
    /// Number of independent data sources; sequence ordering and
    /// source-affine methods are scoped per source. Defaults to 1.
    #[serde(default)]
    pub source_count: Option<u32>,
    /// Backpressure bound: `ingest` fails fast once this many records are
    /// in flight. Unlimited when absent.
    #[serde(default)]
    pub max_in_flight: Option<usize>,
    /// Per-source sponge cache capacity for reordering nodes.
    #[serde(default)]
    pub reorder_capacity: Option<usize>,
    #[serde(default)]
    pub optional: Option<OptionalSpec>,
}

impl FlowSpec {
    /// Parse a spec from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, SpecError> {
        serde_json::from_value(value).map_err(|e| SpecError::Parse {
            reason: e.to_string(),
        })
    }

    /// Load a spec from a JSON file, anchoring relative method-config
    /// paths at the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SpecError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut spec: Self = serde_json::from_str(&text).map_err(|e| SpecError::Parse {
            reason: format!("{}: {e}", path.display()),
        })?;
        if let Some(base) = path.parent() {
            spec.anchor_config_paths(base);
        }
        Ok(spec)
    }

    fn anchor_config_paths(&mut self, base: &Path) {
        for node in &mut self.nodes {
            if let Some(config_path) = &node.method_config_path {
                let joined = base.join(config_path);
                node.method_config_path = Some(joined.display().to_string());
            }
        }
    }
}

/// Errors loading or parsing a flow spec, before structural validation.
#[derive(Debug, Error, Diagnostic)]
pub enum SpecError {
    #[error("failed to read flow spec {path}: {reason}")]
    #[diagnostic(code(weft::spec::io))]
    Io { path: String, reason: String },

    #[error("failed to parse flow spec: {reason}")]
    #[diagnostic(code(weft::spec::parse))]
    Parse { reason: String },
}
