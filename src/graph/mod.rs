//! The graph-compiler boundary: declarative topology in, validated
//! slot-indexed plan out.

pub mod plan;
pub mod spec;

pub use plan::{GraphError, GraphPlan, SlotInfo, SlotProducer};
pub use spec::{
    DEFAULT_GROUP, FlowSpec, NodeSpec, OptionalSpec, OutputGroupSpec, OutputsSpec, SpecError,
};
