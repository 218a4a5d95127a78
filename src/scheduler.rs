//! The root of the pipeline: slot-state bookkeeping, readiness passes,
//! slot release, and exactly-once result delivery.
//!
//! Everything that mutates a record's slot-state table runs as a task on
//! the scheduler's single drive worker: ingestion, node completions, the
//! readiness pass, release, and completion detection. Nodes and method
//! pools run concurrently on their own workers and only re-enter the
//! scheduler by posting back here.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use rustc_hash::FxHashMap;

use crate::data::{FlowInput, FlowOutput, MethodParam, ResultCallback, codes};
use crate::flow::FlowError;
use crate::graph::GraphPlan;
use crate::method::{MethodError, MethodRegistry};
use crate::method_manager::MethodManager;
use crate::node::{Node, OnReady};
use crate::record::{Record, RecordRef, RecordState, SlotState, SyncHandle};
use crate::wheel::TimingWheel;
use crate::workers::{Worker, WorkerRegistry};

/// Origin tag for ingestion tasks on the drive worker. Node completions
/// are tagged with their node's name instead.
pub(crate) const INGEST_TAG: &str = "__ingest__";

#[derive(Default)]
struct Callbacks {
    global: Option<ResultCallback>,
    per_node: FxHashMap<usize, ResultCallback>,
}

pub(crate) struct Scheduler {
    plan: GraphPlan,
    engine: Arc<WorkerRegistry>,
    wheel: Arc<TimingWheel>,
    nodes: OnceLock<Vec<Arc<Node>>>,
    node_by_name: FxHashMap<String, usize>,
    drive: Arc<Worker>,
    daemon: Arc<Worker>,
    callbacks: RwLock<Callbacks>,
    release_slots: AtomicBool,
    in_flight: AtomicUsize,
    sequences: Vec<AtomicU64>,
    global_sequence: AtomicU64,
}

impl Scheduler {
    /// Build the scheduler and all nodes for an already-compiled plan.
    pub(crate) fn build(
        plan: GraphPlan,
        registry: &MethodRegistry,
        engine: Arc<WorkerRegistry>,
        wheel: Arc<TimingWheel>,
    ) -> Result<Arc<Self>, MethodError> {
        let drive = engine.create_auto();
        let daemon = engine.create_auto();
        if let Some(priority) = &plan.optional.drive_priority {
            drive.set_priority(priority);
        }
        if let Some(priority) = &plan.optional.daemon_priority {
            daemon.set_priority(priority);
        }

        let node_by_name = plan
            .nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.name.clone(), index))
            .collect();
        let sequences = (0..plan.source_count).map(|_| AtomicU64::new(0)).collect();

        let scheduler = Arc::new(Self {
            node_by_name,
            sequences,
            engine,
            wheel,
            drive,
            daemon,
            nodes: OnceLock::new(),
            callbacks: RwLock::new(Callbacks::default()),
            release_slots: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            global_sequence: AtomicU64::new(0),
            plan,
        });

        let mut nodes = Vec::with_capacity(scheduler.plan.nodes.len());
        for (index, spec) in scheduler.plan.nodes.iter().enumerate() {
            let manager = MethodManager::new(
                spec,
                scheduler.plan.source_count,
                &scheduler.engine,
                registry,
            )?;
            let weak: Weak<Scheduler> = Arc::downgrade(&scheduler);
            let on_ready: OnReady = Box::new(move |record| {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.post_node_done(record, index);
                }
            });
            nodes.push(Arc::new(Node::new(
                spec.name.clone(),
                scheduler.plan.node_inputs[index].clone(),
                scheduler.plan.node_outputs[index].clone(),
                spec.timeout_ms,
                manager,
                scheduler.plan.source_count,
                scheduler.plan.reorder_capacity,
                Arc::clone(&scheduler.daemon),
                Arc::clone(&scheduler.wheel),
                on_ready,
            )));
        }
        scheduler
            .nodes
            .set(nodes)
            .unwrap_or_else(|_| unreachable!("nodes initialized once"));
        Ok(scheduler)
    }

    fn nodes(&self) -> &[Arc<Node>] {
        self.nodes.get().expect("scheduler nodes initialized")
    }

    #[must_use]
    pub(crate) fn output_group_count(&self) -> usize {
        self.plan.output_groups.len()
    }

    pub(crate) fn set_callback(&self, callback: Option<ResultCallback>) {
        self.callbacks.write().expect("callbacks poisoned").global = callback;
    }

    #[must_use]
    pub(crate) fn has_callback(&self) -> bool {
        self.callbacks
            .read()
            .expect("callbacks poisoned")
            .global
            .is_some()
    }

    /// Register or remove a direct per-node callback.
    pub(crate) fn set_node_callback(
        &self,
        node_name: &str,
        callback: Option<ResultCallback>,
    ) -> Result<(), FlowError> {
        let index = self.node_index(node_name)?;
        let mut callbacks = self.callbacks.write().expect("callbacks poisoned");
        match callback {
            Some(callback) => {
                tracing::info!(node = node_name, "registering node callback");
                callbacks.per_node.insert(index, callback);
            }
            None => {
                tracing::info!(node = node_name, "removing node callback");
                callbacks.per_node.remove(&index);
            }
        }
        Ok(())
    }

    pub(crate) fn set_release_slots(&self, enabled: bool) {
        self.release_slots.store(enabled, Ordering::Release);
    }

    pub(crate) fn update_parameter(
        &self,
        node_name: &str,
        param: &MethodParam,
    ) -> Result<(), FlowError> {
        let index = self.node_index(node_name)?;
        self.nodes()[index].set_parameter(param).map_err(FlowError::from)
    }

    pub(crate) fn parameter(&self, node_name: &str) -> Result<Option<MethodParam>, FlowError> {
        Ok(self.nodes()[self.node_index(node_name)?].parameter())
    }

    pub(crate) fn node_version(&self, node_name: &str) -> Result<String, FlowError> {
        Ok(self.nodes()[self.node_index(node_name)?].version())
    }

    fn node_index(&self, node_name: &str) -> Result<usize, FlowError> {
        self.node_by_name
            .get(node_name)
            .copied()
            .ok_or_else(|| FlowError::UnknownNode {
                name: node_name.to_string(),
            })
    }

    /// Map a caller input onto a fresh record and run the first readiness
    /// pass. Returns the record's per-source sequence id.
    pub(crate) fn ingest(
        self: &Arc<Self>,
        input: FlowInput,
        sync: Option<SyncHandle>,
    ) -> Result<u64, FlowError> {
        if input.source_id >= self.plan.source_count {
            return Err(FlowError::InvalidSource {
                source_id: input.source_id,
                source_count: self.plan.source_count,
            });
        }
        for feed in &input.feeds {
            if !self.plan.slot_index.contains_key(&feed.name) {
                return Err(FlowError::UnknownInput {
                    name: feed.name.clone(),
                });
            }
        }

        // Backpressure: fail fast, creating no partial state.
        let admitted = self.in_flight.fetch_add(1, Ordering::AcqRel);
        if admitted >= self.plan.max_in_flight {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(FlowError::CapacityExceeded {
                max_in_flight: self.plan.max_in_flight,
            });
        }

        let mut record = Record::new(self.plan.slot_names.len());
        record.source_id = input.source_id;
        for feed in input.feeds {
            let slot = self.plan.slot_index[&feed.name];
            record.slots[slot] = Some(feed.payload);
            record.slot_states[slot] = SlotState::Ready;
        }
        for param in input.params {
            record.params.insert(param.method_name().to_string(), param);
        }
        record.sequence_id =
            self.sequences[input.source_id as usize].fetch_add(1, Ordering::AcqRel);
        record.global_sequence_id = self.global_sequence.fetch_add(1, Ordering::AcqRel);
        record.timestamp = record.sequence_id;
        record.sync = sync;
        let sequence_id = record.sequence_id;

        let record = record.into_ref();
        let scheduler = Arc::clone(self);
        let _ = self.drive.post(INGEST_TAG, move || {
            scheduler.drive_ingest(&record);
        });
        Ok(sequence_id)
    }

    /// A node finished a record; re-enter the drive worker.
    fn post_node_done(self: &Arc<Self>, record: RecordRef, node_index: usize) {
        let scheduler = Arc::clone(self);
        let origin = self.plan.nodes[node_index].name.clone();
        let _ = self.drive.post(origin, move || {
            scheduler.drive_node_done(&record, node_index);
        });
    }

    /// First pass for a fresh record: everything fed externally is ready.
    fn drive_ingest(self: &Arc<Self>, record: &RecordRef) {
        let ready: Vec<usize> = {
            let guard = record.lock().expect("record poisoned");
            (0..guard.slot_states.len())
                .filter(|&slot| guard.slot_states[slot] == SlotState::Ready)
                .collect()
        };
        self.ready_pass(record, &ready);
    }

    fn drive_node_done(self: &Arc<Self>, record: &RecordRef, node_index: usize) {
        let outputs = &self.plan.node_outputs[node_index];
        {
            let mut guard = record.lock().expect("record poisoned");
            for &slot in outputs {
                let clean = guard.slots[slot]
                    .as_ref()
                    .is_some_and(|payload| payload.error_code == codes::OK);
                guard.slot_states[slot] = if clean {
                    SlotState::Ready
                } else {
                    SlotState::Error
                };
            }
        }

        self.deliver_node_callback(record, node_index);
        // A node output nobody consumes can go right away.
        self.release(record, outputs);
        self.ready_pass(record, outputs);
    }

    /// Direct per-node result delivery, async calls only.
    fn deliver_node_callback(&self, record: &RecordRef, node_index: usize) {
        let callback = {
            let callbacks = self.callbacks.read().expect("callbacks poisoned");
            callbacks.per_node.get(&node_index).cloned()
        };
        let Some(callback) = callback else { return };
        let output = {
            let guard = record.lock().expect("record poisoned");
            if guard.is_sync() {
                return;
            }
            let node = &self.plan.nodes[node_index];
            let mut output = self.package_slots(&guard, &self.plan.node_outputs[node_index]);
            output.node_name = Some(node.name.clone());
            output
        };
        callback(output);
    }

    /// Completion detection, group delivery, and the next dispatch wave
    /// for slots that just became terminal.
    fn ready_pass(self: &Arc<Self>, record: &RecordRef, ready_slots: &[usize]) {
        let mut group_deliveries: Vec<FlowOutput> = Vec::new();
        let mut sync_delivery: Option<(SyncHandle, Vec<FlowOutput>)> = None;
        let mut dispatch: Vec<usize> = Vec::new();
        let mut frame_done = false;
        {
            let mut guard = record.lock().expect("record poisoned");
            if guard.state == RecordState::Done {
                tracing::warn!(
                    sequence_id = guard.sequence_id,
                    "readiness pass on a completed record"
                );
                return;
            }

            if !guard.is_sync() {
                for (group, slots) in &self.plan.output_groups {
                    if guard.delivered_groups.iter().any(|g| g == group) {
                        continue;
                    }
                    if slots
                        .iter()
                        .all(|&slot| guard.slot_states[slot].is_terminal())
                    {
                        let mut output = self.package_slots(&guard, slots);
                        output.group = Some(group.clone());
                        group_deliveries.push(output);
                        guard.delivered_groups.push(group.clone());
                    }
                }
            }

            if self
                .plan
                .output_union
                .iter()
                .all(|&slot| guard.slot_states[slot].is_terminal())
            {
                frame_done = true;
                guard.state = RecordState::Done;
                if let Some(sender) = guard.sync.take() {
                    let outputs = self
                        .plan
                        .output_groups
                        .iter()
                        .map(|(group, slots)| {
                            let mut output = self.package_slots(&guard, slots);
                            output.group = Some(group.clone());
                            output
                        })
                        .collect();
                    sync_delivery = Some((sender, outputs));
                }
            } else {
                // A node is driven once every input is terminal; error
                // inputs still drive it so the skip path can fill its
                // outputs and the frame keeps moving.
                let mut ready_nodes: BTreeSet<usize> = BTreeSet::new();
                for &slot in ready_slots {
                    for &dependant in &self.plan.slots[slot].dependants {
                        let all_terminal = self.plan.node_inputs[dependant]
                            .iter()
                            .all(|&input| guard.slot_states[input].is_terminal());
                        if all_terminal {
                            ready_nodes.insert(dependant);
                        }
                    }
                }
                for &node_index in &ready_nodes {
                    for &output in &self.plan.node_outputs[node_index] {
                        if guard.slot_states[output] == SlotState::Empty {
                            guard.slot_states[output] = SlotState::InProgress;
                        }
                    }
                }
                dispatch = ready_nodes.into_iter().collect();
            }
        }

        if frame_done {
            // Free the capacity before reporting, so a caller unblocked
            // by the result can ingest again without a spurious
            // capacity error.
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        if !group_deliveries.is_empty() {
            let callback = {
                let callbacks = self.callbacks.read().expect("callbacks poisoned");
                callbacks.global.clone()
            };
            match callback {
                Some(callback) => {
                    for output in group_deliveries {
                        callback(output);
                    }
                }
                None => tracing::warn!("output group completed with no callback registered"),
            }
        }

        if let Some((sender, outputs)) = sync_delivery {
            let _ = sender.send(outputs);
        }
        if frame_done {
            return;
        }

        for node_index in dispatch {
            self.nodes()[node_index].perform(record.clone());
            let inputs = &self.plan.node_inputs[node_index];
            {
                let mut guard = record.lock().expect("record poisoned");
                for &slot in inputs {
                    guard.driven[slot] += 1;
                }
            }
            self.release(record, inputs);
        }
    }

    /// Drop slot data every declared dependant has consumed, unless the
    /// slot is a flow output. The central memory-pressure control, off by
    /// default.
    fn release(&self, record: &RecordRef, slots: &[usize]) {
        if !self.release_slots.load(Ordering::Acquire) {
            return;
        }
        let mut guard = record.lock().expect("record poisoned");
        for &slot in slots {
            if (guard.driven[slot] as usize) < self.plan.slots[slot].dependants.len() {
                continue;
            }
            if self.plan.is_flow_output(slot) {
                continue;
            }
            guard.slots[slot] = None;
        }
    }

    /// Package a slot set into a result, summing error codes and
    /// concatenating details. Missing payloads are reported as not ready.
    fn package_slots(&self, record: &Record, slots: &[usize]) -> FlowOutput {
        let mut output = FlowOutput {
            sequence_id: record.sequence_id,
            global_sequence_id: record.global_sequence_id,
            source_id: record.source_id,
            ..Default::default()
        };
        for &slot in slots {
            let name = &self.plan.slot_names[slot];
            match &record.slots[slot] {
                Some(payload) => {
                    output.error_code += payload.error_code;
                    output.error_detail.push_str(&payload.error_detail);
                    output.data.push(crate::data::Feed {
                        name: name.clone(),
                        payload: Arc::clone(payload),
                    });
                }
                None => {
                    output.error_code += codes::OUTPUT_NOT_READY;
                    output.error_detail.push_str(&format!("{name} is not ready;"));
                }
            }
        }
        output
    }

    /// Stop every worker in the flow. Records still in flight are
    /// abandoned.
    pub(crate) fn shutdown(&self) {
        self.engine.stop_all();
    }
}
