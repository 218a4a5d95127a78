//! The unit of work flowing through the graph.
//!
//! A record owns a flat, slot-indexed array of optional payload
//! references; releasing a slot is replacing its entry with `None`. All
//! slot mutation is funneled through the scheduler drive worker and the
//! node daemon worker, causally serialized by task posting; the mutex
//! only enforces memory safety across those two threads.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use crate::data::{FlowOutput, MethodParam, Payload};

/// Lifecycle state of one slot within a record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing written yet and no producer dispatched.
    #[default]
    Empty,
    /// The producing node has been dispatched.
    InProgress,
    /// Terminal: the producer delivered a clean payload.
    Ready,
    /// Terminal: the producer delivered an error, timed out, or finished
    /// without writing. Errors count toward completion and are never
    /// retried.
    Error,
}

impl SlotState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Error)
    }
}

/// Completion state of the whole record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordState {
    #[default]
    Pending,
    /// The frame result has been reported; any re-entry is a no-op.
    Done,
}

/// Reply channel for a blocking predict call. Fulfilled exactly once.
pub(crate) type SyncHandle = flume::Sender<Vec<FlowOutput>>;

/// One record in flight.
pub struct Record {
    pub slots: Vec<Option<Arc<Payload>>>,
    pub slot_states: Vec<SlotState>,
    /// Per-node parameter overrides for this record.
    pub params: FxHashMap<String, Arc<MethodParam>>,
    /// Output groups already delivered, for async multi-output dedup.
    pub delivered_groups: Vec<String>,
    /// Per slot: how many dependant nodes have consumed it.
    pub driven: Vec<u32>,
    pub(crate) sync: Option<SyncHandle>,
    pub timestamp: u64,
    pub sequence_id: u64,
    pub global_sequence_id: u64,
    pub source_id: u32,
    pub state: RecordState,
}

/// Shared handle to a record.
pub type RecordRef = Arc<Mutex<Record>>;

impl Record {
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![None; slot_count],
            slot_states: vec![SlotState::Empty; slot_count],
            params: FxHashMap::default(),
            delivered_groups: Vec::new(),
            driven: vec![0; slot_count],
            sync: None,
            timestamp: 0,
            sequence_id: 0,
            global_sequence_id: 0,
            source_id: 0,
            state: RecordState::Pending,
        }
    }

    #[must_use]
    pub fn into_ref(self) -> RecordRef {
        Arc::new(Mutex::new(self))
    }

    /// The override targeting `node_name`, if any.
    #[must_use]
    pub fn param_for(&self, node_name: &str) -> Option<Arc<MethodParam>> {
        self.params.get(node_name).cloned()
    }

    /// Whether the record's sync reply channel is present, i.e. this is a
    /// blocking call.
    #[must_use]
    pub fn is_sync(&self) -> bool {
        self.sync.is_some()
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("source_id", &self.source_id)
            .field("sequence_id", &self.sequence_id)
            .field("state", &self.state)
            .field("slot_states", &self.slot_states)
            .finish()
    }
}
