//! A graph vertex: one method manager plus its slot wiring.
//!
//! The node decides per record between a synchronous skip (missing or
//! failed inputs, or a disable override, filled per the configured
//! policy) and an asynchronous dispatch through the method manager. A
//! dispatched record's completion races a one-shot wheel timeout; an
//! atomic-swap-once gate guarantees exactly one of the two writes the
//! outputs and reports upward. Every delivery path, skip included, is
//! posted onto the shared node daemon worker so slot mutation never races
//! the scheduler's own thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::data::{DisableMode, MethodParam, Payload, codes};
use crate::method::{Batch, MethodError};
use crate::method_manager::MethodManager;
use crate::record::RecordRef;
use crate::sponge::{Admission, Sponge};
use crate::wheel::{TimerMode, TimerToken, TimingWheel};
use crate::workers::Worker;

/// Callback into the scheduler: this record has a result from this node.
pub(crate) type OnReady = Box<dyn Fn(RecordRef) + Send + Sync>;

/// A record admitted for processing, with its input payloads snapshotted
/// at dispatch time. The snapshot keeps the inputs alive while the record
/// sits in the sponge or in a worker queue, even after the scheduler
/// releases the originating slots.
struct Admitted {
    record: RecordRef,
    inputs: Vec<Option<Arc<Payload>>>,
}

/// One-shot delivery guard for the timeout/completion race.
struct CompletionGate {
    done: AtomicBool,
    timer: Mutex<Option<TimerToken>>,
}

enum Outcome {
    Method(Batch),
    Timeout,
}

pub(crate) struct Node {
    name: String,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    timeout: Option<Duration>,
    needs_reorder: bool,
    sponges: Mutex<Vec<Sponge<Admitted>>>,
    manager: MethodManager,
    daemon: Arc<Worker>,
    wheel: Arc<TimingWheel>,
    on_ready: OnReady,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
        timeout_ms: Option<u64>,
        manager: MethodManager,
        source_count: u32,
        reorder_capacity: usize,
        daemon: Arc<Worker>,
        wheel: Arc<TimingWheel>,
        on_ready: OnReady,
    ) -> Self {
        let needs_reorder = manager.needs_reorder();
        let sponges = if needs_reorder {
            (0..source_count)
                .map(|_| Sponge::new(reorder_capacity))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            name,
            inputs,
            outputs,
            timeout: timeout_ms.filter(|&ms| ms > 0).map(Duration::from_millis),
            needs_reorder,
            sponges: Mutex::new(sponges),
            manager,
            daemon,
            wheel,
            on_ready,
        }
    }

    pub(crate) fn set_parameter(&self, param: &MethodParam) -> Result<(), MethodError> {
        self.manager.update_parameter(param)
    }

    pub(crate) fn parameter(&self) -> Option<MethodParam> {
        self.manager.parameter()
    }

    pub(crate) fn version(&self) -> String {
        self.manager.version()
    }

    /// Scheduler entry point: drive this node for a record whose inputs
    /// just became ready. Runs on the scheduler drive worker.
    pub(crate) fn perform(self: &Arc<Self>, record: RecordRef) {
        let (sequence_id, source_id, inputs) = {
            let guard = record.lock().expect("record poisoned");
            let inputs = self
                .inputs
                .iter()
                .map(|&slot| guard.slots[slot].clone())
                .collect::<Vec<_>>();
            (guard.sequence_id, guard.source_id, inputs)
        };
        let admitted = Admitted { record, inputs };

        let batch = if self.needs_reorder {
            let mut sponges = self.sponges.lock().expect("sponge list poisoned");
            match sponges[source_id as usize].accept(sequence_id, admitted) {
                Admission::Ready(batch) => batch,
                Admission::Held => return,
                Admission::Rejected(stale) => {
                    tracing::warn!(
                        node = %self.name,
                        sequence_id,
                        source_id,
                        "sequence rejected by reorder buffer"
                    );
                    drop(sponges);
                    self.reject_stale(stale);
                    return;
                }
            }
        } else {
            vec![admitted]
        };

        for admitted in batch {
            if self.should_skip(&admitted) {
                self.fill_disabled(&admitted);
                self.post_ready(admitted.record);
            } else {
                self.dispatch(admitted);
            }
        }
    }

    /// Skip when any input is absent or failed, or the record disables
    /// this node.
    fn should_skip(&self, admitted: &Admitted) -> bool {
        if admitted
            .inputs
            .iter()
            .any(|input| input.as_ref().is_none_or(|p| p.error_code != codes::OK))
        {
            return true;
        }
        let guard = admitted.record.lock().expect("record poisoned");
        guard
            .param_for(&self.name)
            .is_some_and(|param| !param.is_enabled())
    }

    /// Apply the disable fill policy, when one is configured. A skip
    /// caused purely by bad inputs writes nothing; those output slots end
    /// up reported as not ready.
    fn fill_disabled(&self, admitted: &Admitted) {
        let mut guard = admitted.record.lock().expect("record poisoned");
        let Some(param) = guard.param_for(&self.name) else {
            return;
        };
        let MethodParam::Disable {
            mode, predefined, ..
        } = param.as_ref()
        else {
            return;
        };
        tracing::trace!(node = %self.name, ?mode, "disabled for this record");
        match mode {
            DisableMode::PassThrough => {
                if self.inputs.len() == self.outputs.len() {
                    for (index, &slot) in self.outputs.iter().enumerate() {
                        guard.slots[slot] = admitted.inputs[index].clone();
                    }
                } else {
                    tracing::error!(
                        node = %self.name,
                        inputs = self.inputs.len(),
                        outputs = self.outputs.len(),
                        "pass-through needs matching input and output sizes; nothing copied"
                    );
                }
            }
            DisableMode::BestEffortPassThrough => {
                for (index, &slot) in self.outputs.iter().enumerate() {
                    guard.slots[slot] = match admitted.inputs.get(index) {
                        Some(Some(payload)) => Some(Arc::clone(payload)),
                        _ => Some(Arc::new(Payload::invalid())),
                    };
                }
            }
            DisableMode::UsePreDefine => {
                if predefined.len() == self.outputs.len() {
                    for (index, &slot) in self.outputs.iter().enumerate() {
                        guard.slots[slot] = Some(Arc::clone(&predefined[index]));
                    }
                } else {
                    tracing::error!(
                        node = %self.name,
                        predefined = predefined.len(),
                        outputs = self.outputs.len(),
                        "predefined data size does not match the output size; nothing copied"
                    );
                }
            }
            DisableMode::Invalid => {
                for &slot in &self.outputs {
                    guard.slots[slot] = Some(Arc::new(Payload::invalid()));
                }
            }
        }
    }

    /// Hand one record to the method manager, with the timeout armed
    /// first so a stuck method cannot stall the frame.
    fn dispatch(self: &Arc<Self>, admitted: Admitted) {
        let Admitted { record, inputs } = admitted;
        let inputs: Vec<Arc<Payload>> = inputs.into_iter().flatten().collect();
        let (params, source_id) = {
            let guard = record.lock().expect("record poisoned");
            (vec![guard.param_for(&self.name)], guard.source_id)
        };

        let gate = Arc::new(CompletionGate {
            done: AtomicBool::new(false),
            timer: Mutex::new(None),
        });

        if let Some(timeout) = self.timeout {
            let node = Arc::clone(self);
            let timer_record = record.clone();
            let timer_gate = Arc::clone(&gate);
            let token = self.wheel.schedule(timeout, TimerMode::Once, move || {
                node.post_outcome(
                    timer_record.clone(),
                    Arc::clone(&timer_gate),
                    Outcome::Timeout,
                );
            });
            *gate.timer.lock().expect("gate timer poisoned") = Some(token);
        }

        let node = Arc::clone(self);
        let result_record = record.clone();
        let result_gate = Arc::clone(&gate);
        let submitted = self.manager.process_async(
            vec![inputs],
            params,
            move |outputs| {
                node.post_outcome(result_record, result_gate, Outcome::Method(outputs));
            },
            source_id,
        );
        if let Err(error) = submitted {
            tracing::error!(node = %self.name, %error, "method dispatch failed");
            let row = error_row(
                self.outputs.len(),
                codes::METHOD,
                format!("{}: dispatch failed;", self.name),
            );
            self.post_outcome(record, gate, Outcome::Method(vec![row]));
        }
    }

    /// Funnel a completion (method result or timeout) onto the daemon
    /// worker.
    fn post_outcome(
        self: &Arc<Self>,
        record: RecordRef,
        gate: Arc<CompletionGate>,
        outcome: Outcome,
    ) {
        let node = Arc::clone(self);
        let _ = self.daemon.post(self.name.clone(), move || {
            node.deliver(record, &gate, outcome);
        });
    }

    /// Runs on the daemon worker. First caller wins; the loser's outcome
    /// is dropped silently.
    fn deliver(&self, record: RecordRef, gate: &CompletionGate, outcome: Outcome) {
        if gate.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(token) = gate.timer.lock().expect("gate timer poisoned").take() {
            self.wheel.cancel(token);
        }

        {
            let mut guard = record.lock().expect("record poisoned");
            match outcome {
                Outcome::Method(batch) => {
                    let row = batch.into_iter().next().unwrap_or_default();
                    if row.len() > self.outputs.len() {
                        tracing::debug!(
                            node = %self.name,
                            produced = row.len(),
                            declared = self.outputs.len(),
                            "method produced extra outputs; using the declared prefix"
                        );
                    }
                    for (index, &slot) in self.outputs.iter().enumerate() {
                        guard.slots[slot] = Some(match row.get(index) {
                            Some(payload) => Arc::clone(payload),
                            None => Arc::new(Payload::with_error(
                                codes::METHOD,
                                format!("{}: missing output {index};", self.name),
                            )),
                        });
                    }
                }
                Outcome::Timeout => {
                    tracing::warn!(node = %self.name, "method result timed out");
                    for &slot in &self.outputs {
                        guard.slots[slot] = Some(Arc::new(Payload::with_error(
                            codes::METHOD_TIMEOUT,
                            format!("{}: timed out;", self.name),
                        )));
                    }
                }
            }
        }
        (self.on_ready)(record);
    }

    /// A record the sponge refused: mark every output stale so the frame
    /// still completes, and report it like any other result.
    fn reject_stale(self: &Arc<Self>, stale: Admitted) {
        {
            let mut guard = stale.record.lock().expect("record poisoned");
            for &slot in &self.outputs {
                guard.slots[slot] = Some(Arc::new(Payload::with_error(
                    codes::STALE_SEQUENCE,
                    format!("{}: stale sequence;", self.name),
                )));
            }
        }
        self.post_ready(stale.record);
    }

    /// Report a result that was produced synchronously (skip or stale
    /// path), still via the daemon so the scheduler sees one entry path.
    fn post_ready(self: &Arc<Self>, record: RecordRef) {
        let node = Arc::clone(self);
        let _ = self
            .daemon
            .post(self.name.clone(), move || (node.on_ready)(record));
    }
}

/// A row of identical error payloads, used when dispatch itself fails.
fn error_row(len: usize, code: i32, detail: String) -> Vec<Arc<Payload>> {
    (0..len)
        .map(|_| Arc::new(Payload::with_error(code, detail.clone())))
        .collect()
}
