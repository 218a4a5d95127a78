//! Structural validation and slot-index assignment.
//!
//! Compilation turns the name-based [`FlowSpec`] into the integer world
//! the scheduler runs on: a global slot table, per-node input and output
//! slot index arrays, per-slot producer and dependant sets, and the
//! output groups. Every configuration defect is reported as its own error
//! variant; all of them are fatal and none is ever retried.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::spec::{FlowSpec, NodeSpec, OptionalSpec, SpecError};
use crate::workers::USER_WORKER_RANGE_END;

/// Who writes a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotProducer {
    /// Fed by the caller at ingest.
    External,
    /// Written by the node at this index in the plan's node list.
    Node(usize),
}

/// Static wiring of one slot.
#[derive(Clone, Debug)]
pub struct SlotInfo {
    pub producer: SlotProducer,
    /// Indices of the nodes consuming this slot.
    pub dependants: Vec<usize>,
}

/// The compiled topology: everything the scheduler needs, indexed and
/// validated, with no names left on the hot path.
#[derive(Debug)]
pub struct GraphPlan {
    pub nodes: Vec<NodeSpec>,
    pub slot_names: Vec<String>,
    pub slot_index: FxHashMap<String, usize>,
    /// Parallel to `nodes`: input slot indices per node.
    pub node_inputs: Vec<Vec<usize>>,
    /// Parallel to `nodes`: output slot indices per node.
    pub node_outputs: Vec<Vec<usize>>,
    pub slots: Vec<SlotInfo>,
    /// Named output groups, sorted by name for deterministic delivery.
    pub output_groups: Vec<(String, Vec<usize>)>,
    /// Union of all group member slots; frame completion is judged on
    /// these.
    pub output_union: Vec<usize>,
    /// Slots fed by the caller.
    pub external_inputs: Vec<usize>,
    pub source_count: u32,
    pub max_in_flight: usize,
    pub reorder_capacity: usize,
    pub optional: OptionalSpec,
}

impl GraphPlan {
    /// Validate `spec` and assign slot indices.
    pub fn compile(spec: FlowSpec) -> Result<Self, GraphError> {
        let mut seen_names: FxHashMap<&str, ()> = FxHashMap::default();
        for node in &spec.nodes {
            if seen_names.insert(&node.name, ()).is_some() {
                return Err(GraphError::DuplicateNodeName {
                    name: node.name.clone(),
                });
            }
            if node.inputs.is_empty() || node.outputs.is_empty() {
                return Err(GraphError::EmptyNodeIo {
                    node: node.name.clone(),
                });
            }
            match (&node.thread_count, &node.workers) {
                (Some(_), Some(_)) => {
                    return Err(GraphError::ThreadConfigConflict {
                        node: node.name.clone(),
                    });
                }
                (_, Some(workers)) => {
                    if workers.is_empty() {
                        return Err(GraphError::EmptyWorkerList {
                            node: node.name.clone(),
                        });
                    }
                    if let Some(&index) =
                        workers.iter().find(|&&w| w >= USER_WORKER_RANGE_END)
                    {
                        return Err(GraphError::WorkerIndexOutOfRange {
                            node: node.name.clone(),
                            index,
                        });
                    }
                }
                _ => {}
            }
        }

        struct SlotTable {
            names: Vec<String>,
            index: FxHashMap<String, usize>,
            slots: Vec<SlotInfo>,
        }

        impl SlotTable {
            fn intern(&mut self, name: &str, producer: SlotProducer) -> usize {
                if let Some(&index) = self.index.get(name) {
                    return index;
                }
                let index = self.names.len();
                self.index.insert(name.to_string(), index);
                self.names.push(name.to_string());
                self.slots.push(SlotInfo {
                    producer,
                    dependants: Vec::new(),
                });
                index
            }
        }

        let mut table = SlotTable {
            names: Vec::new(),
            index: FxHashMap::default(),
            slots: Vec::new(),
        };

        let mut external_inputs = Vec::new();
        for input in &spec.inputs {
            external_inputs.push(table.intern(input, SlotProducer::External));
        }

        // Walk nodes in declaration order. An input that is not yet
        // produced is either fed by a later node (a cycle, because the
        // contract is producer-before-consumer) or fed by nobody.
        let mut node_inputs = Vec::with_capacity(spec.nodes.len());
        let mut node_outputs = Vec::with_capacity(spec.nodes.len());
        for (node_index, node) in spec.nodes.iter().enumerate() {
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                let Some(&slot) = table.index.get(input.as_str()) else {
                    if let Some(producer) = spec.nodes[node_index..]
                        .iter()
                        .find(|later| later.outputs.iter().any(|o| o == input))
                    {
                        return Err(GraphError::Cycle {
                            consumer: node.name.clone(),
                            producer: producer.name.clone(),
                            slot: input.clone(),
                        });
                    }
                    return Err(GraphError::UnfedInput {
                        node: node.name.clone(),
                        input: input.clone(),
                    });
                };
                table.slots[slot].dependants.push(node_index);
                inputs.push(slot);
            }
            let mut outputs = Vec::with_capacity(node.outputs.len());
            for output in &node.outputs {
                if let Some(&slot) = table.index.get(output.as_str()) {
                    let writer = match table.slots[slot].producer {
                        SlotProducer::External => "the external input".to_string(),
                        SlotProducer::Node(i) => format!("node {}", spec.nodes[i].name),
                    };
                    return Err(GraphError::DuplicateOutputWriter {
                        node: node.name.clone(),
                        slot: output.clone(),
                        other: writer,
                    });
                }
                outputs.push(table.intern(output, SlotProducer::Node(node_index)));
            }
            node_inputs.push(inputs);
            node_outputs.push(outputs);
        }

        let mut output_groups: Vec<(String, Vec<usize>)> = Vec::new();
        let mut output_union: Vec<usize> = Vec::new();
        for group in spec.outputs.groups() {
            if output_groups.iter().any(|(name, _)| *name == group.group) {
                return Err(GraphError::DuplicateGroupName { group: group.group });
            }
            let mut members = Vec::with_capacity(group.outputs.len());
            for name in &group.outputs {
                let Some(&slot) = table.index.get(name.as_str()) else {
                    return Err(GraphError::UnknownOutput {
                        group: group.group.clone(),
                        output: name.clone(),
                    });
                };
                members.push(slot);
                if !output_union.contains(&slot) {
                    output_union.push(slot);
                }
            }
            output_groups.push((group.group, members));
        }
        if output_groups.is_empty() || output_union.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        output_groups.sort_by(|(a, _), (b, _)| a.cmp(b));

        let source_count = spec.source_count.unwrap_or(1).max(1);
        let max_in_flight = spec.max_in_flight.unwrap_or(usize::MAX);
        let reorder_capacity = spec
            .reorder_capacity
            .unwrap_or(crate::sponge::DEFAULT_CAPACITY)
            .max(1);
        let optional = spec.optional.clone().unwrap_or_default();

        Ok(Self {
            optional,
            node_inputs,
            node_outputs,
            slot_names: table.names,
            slot_index: table.index,
            slots: table.slots,
            output_groups,
            output_union,
            external_inputs,
            source_count,
            max_in_flight,
            reorder_capacity,
            nodes: spec.nodes,
        })
    }

    #[must_use]
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    #[must_use]
    pub fn is_flow_output(&self, slot: usize) -> bool {
        self.output_union.contains(&slot)
    }
}

/// Structural defects in a flow declaration. Detected once at compile
/// time; each is fatal and maps to exactly one defect class.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Spec(#[from] SpecError),

    #[error("node name {name} is declared more than once")]
    #[diagnostic(code(weft::graph::duplicate_node))]
    DuplicateNodeName { name: String },

    #[error("input {input} of node {node} is not fed by any upstream node or external input")]
    #[diagnostic(
        code(weft::graph::unfed_input),
        help("Every node input must be an external input or an earlier node's output.")
    )]
    UnfedInput { node: String, input: String },

    #[error("cycle: node {consumer} consumes {slot}, which is produced by the later node {producer}")]
    #[diagnostic(
        code(weft::graph::cycle),
        help("The node list is ordered; producers must be declared before their consumers.")
    )]
    Cycle {
        consumer: String,
        producer: String,
        slot: String,
    },

    #[error("node {node} writes slot {slot}, which is already written by {other}")]
    #[diagnostic(code(weft::graph::duplicate_output))]
    DuplicateOutputWriter {
        node: String,
        slot: String,
        other: String,
    },

    #[error("output group {group} references unknown slot {output}")]
    #[diagnostic(code(weft::graph::unknown_output))]
    UnknownOutput { group: String, output: String },

    #[error("output group {group} is declared more than once")]
    #[diagnostic(code(weft::graph::duplicate_group))]
    DuplicateGroupName { group: String },

    #[error("the flow declares no output groups")]
    #[diagnostic(code(weft::graph::no_outputs))]
    NoOutputs,

    #[error("node {node} sets both thread_count and workers")]
    #[diagnostic(
        code(weft::graph::thread_config),
        help("Choose one of thread_count or an explicit worker list.")
    )]
    ThreadConfigConflict { node: String },

    #[error("node {node} declares an empty worker list")]
    #[diagnostic(code(weft::graph::empty_workers))]
    EmptyWorkerList { node: String },

    #[error("node {node} must declare at least one input and one output")]
    #[diagnostic(code(weft::graph::empty_node_io))]
    EmptyNodeIo { node: String },

    #[error("node {node} names worker index {index}, beyond the user range")]
    #[diagnostic(code(weft::graph::worker_index))]
    WorkerIndexOutOfRange { node: String, index: u32 },
}
