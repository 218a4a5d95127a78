//! # Weft: a slot-graph dataflow pipeline scheduler
//!
//! Weft executes a user-declared directed acyclic graph of pluggable,
//! stateful computation units ("methods") over a stream of input records,
//! with synchronous and asynchronous completion, multi-source sequence
//! reordering, configurable per-node concurrency policies,
//! timeout-bounded partial results, and reference-counted release of
//! intermediate data.
//!
//! ## Core concepts
//!
//! - **Record**: one unit of input flowing through the graph, carrying a
//!   per-slot state table
//! - **Slot**: a named, graph-global storage location for one piece of
//!   inter-node data; exactly one producer per slot
//! - **Node**: a graph vertex wrapping one method plus its slot wiring
//! - **Method**: the pluggable computation unit behind a node, declared
//!   with capability traits that drive instance placement
//! - **Sponge**: the per-source reorder buffer releasing results in
//!   strict sequence order
//! - **Flow**: the caller facade; compile a declarative topology, feed
//!   records in, get grouped results back
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use weft::data::{FlowInput, MethodParam, Payload};
//! use weft::flow::Flow;
//! use weft::method::{Batch, Method, MethodError};
//!
//! struct Doubler;
//!
//! impl Method for Doubler {
//!     fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
//!         Ok(())
//!     }
//!
//!     fn process(
//!         &mut self,
//!         inputs: &[Vec<Arc<Payload>>],
//!         _params: &[Option<Arc<MethodParam>>],
//!     ) -> Batch {
//!         inputs
//!             .iter()
//!             .map(|row| {
//!                 row.iter()
//!                     .map(|input| {
//!                         let doubled =
//!                             input.value_as::<i64>().copied().unwrap_or_default() * 2;
//!                         Arc::new(Payload::new(doubled))
//!                     })
//!                     .collect()
//!             })
//!             .collect()
//!     }
//!
//!     fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), weft::flow::FlowError> {
//!     let flow = Flow::builder()
//!         .register_method("Doubler", || Doubler)
//!         .config_value(json!({
//!             "inputs": ["value"],
//!             "outputs": ["doubled"],
//!             "nodes": [{
//!                 "name": "double",
//!                 "method_type": "Doubler",
//!                 "inputs": ["value"],
//!                 "outputs": ["doubled"]
//!             }]
//!         }))
//!         .build()?;
//!
//!     let output = flow.sync_predict(FlowInput::new().with_feed("value", Payload::new(21i64)))?;
//!     assert_eq!(output.data[0].payload.value_as::<i64>(), Some(&42));
//!     Ok(())
//! }
//! ```
//!
//! ## Execution model
//!
//! Every worker is a single OS thread consuming a FIFO task queue;
//! workers cooperate only by posting tasks to each other. All mutation of
//! a record's slot table funnels through the scheduler's own drive worker
//! and the shared node daemon, so no record state is ever raced. Method
//! instances run on the workers their manager assigned per the method's
//! declared traits; a timing wheel bounds how long a node waits for any
//! method result.
//!
//! ## Module guide
//!
//! - [`flow`] - the caller facade: builder, predict calls, callbacks
//! - [`data`] - payloads, parameters, inputs and outputs
//! - [`method`] - the method trait, traits descriptor, and registry
//! - [`graph`] - the declarative topology and its compiled plan
//! - [`record`] - the in-flight record and slot-state table
//! - [`sponge`] - the per-source reorder buffer
//! - [`wheel`] - the hashed timing wheel
//! - [`workers`] - task-queue workers, pools, and the worker registry
//! - [`telemetry`] - tracing bootstrap

pub mod data;
pub mod flow;
pub mod graph;
pub mod method;
mod method_manager;
mod node;
pub mod record;
mod scheduler;
pub mod sponge;
pub mod telemetry;
pub mod wheel;
pub mod workers;
