//! Shared fixtures: test methods and spec builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use weft::data::{MethodParam, Payload};
use weft::method::{Batch, Method, MethodError, MethodInfo};

/// Copies its inputs straight to its outputs.
pub struct Relay {
    info: MethodInfo,
}

impl Relay {
    pub fn new() -> Self {
        Self {
            info: MethodInfo::default(),
        }
    }

    pub fn with_info(info: MethodInfo) -> Self {
        Self { info }
    }
}

impl Method for Relay {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        inputs.to_vec()
    }

    fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
        Ok(())
    }

    fn version(&self) -> String {
        "relay_v1".into()
    }

    fn info(&self) -> MethodInfo {
        self.info
    }
}

/// Doubles every `i64` input payload.
pub struct Doubler;

impl Method for Doubler {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        inputs
            .iter()
            .map(|row| {
                row.iter()
                    .map(|input| {
                        let value = input.value_as::<i64>().copied().unwrap_or_default();
                        Arc::new(Payload::new(value * 2))
                    })
                    .collect()
            })
            .collect()
    }

    fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
        Ok(())
    }
}

/// Relays after a per-record delay derived from the payload value, so a
/// multi-worker node completes records out of submission order.
pub struct ScrambleRelay;

impl Method for ScrambleRelay {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        for row in inputs {
            if let Some(value) = row.first().and_then(|p| p.value_as::<i64>()) {
                let delay = (*value as u64 * 13 + 5) % 40;
                std::thread::sleep(Duration::from_millis(delay));
            }
        }
        inputs.to_vec()
    }

    fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
        Ok(())
    }
}

/// Relays in-order and appends every observed `i64` to a shared log.
pub struct OrderProbe {
    pub seen: Arc<Mutex<Vec<i64>>>,
    info: MethodInfo,
}

impl OrderProbe {
    pub fn new(seen: Arc<Mutex<Vec<i64>>>, info: MethodInfo) -> Self {
        Self { seen, info }
    }
}

impl Method for OrderProbe {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        for row in inputs {
            if let Some(value) = row.first().and_then(|p| p.value_as::<i64>()) {
                self.seen.lock().unwrap().push(*value);
            }
        }
        inputs.to_vec()
    }

    fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
        Ok(())
    }
}

/// Sleeps a fixed time, then relays. For timeout and backpressure tests.
pub struct SlowRelay {
    pub delay: Duration,
}

impl Method for SlowRelay {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        std::thread::sleep(self.delay);
        inputs.to_vec()
    }

    fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
        Ok(())
    }
}

/// Source-affine method: every instance takes a unique id at init and
/// logs `(instance_id, source_id)` for each processed record.
pub struct SourceProbe {
    pub instance_id: usize,
    pub ids: Arc<AtomicUsize>,
    pub observed: Arc<Mutex<Vec<(usize, u32)>>>,
}

impl SourceProbe {
    pub fn new(ids: Arc<AtomicUsize>, observed: Arc<Mutex<Vec<(usize, u32)>>>) -> Self {
        Self {
            instance_id: usize::MAX,
            ids,
            observed,
        }
    }
}

impl Method for SourceProbe {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        self.instance_id = self.ids.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        for row in inputs {
            if let Some(source) = row.first().and_then(|p| p.value_as::<u32>()) {
                self.observed
                    .lock()
                    .unwrap()
                    .push((self.instance_id, *source));
            }
        }
        inputs.to_vec()
    }

    fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
        Ok(())
    }

    fn info(&self) -> MethodInfo {
        MethodInfo {
            source_affine: true,
            thread_safe: false,
            needs_reorder: true,
        }
    }
}

/// Remembers the last JSON parameter it was given.
pub struct Tunable {
    pub current: Option<serde_json::Value>,
    pub updates: Arc<AtomicUsize>,
}

impl Tunable {
    pub fn new(updates: Arc<AtomicUsize>) -> Self {
        Self {
            current: None,
            updates,
        }
    }
}

impl Method for Tunable {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        Ok(())
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        inputs.to_vec()
    }

    fn update_parameter(&mut self, param: &MethodParam) -> Result<(), MethodError> {
        if let MethodParam::Json { value, .. } = param {
            self.current = Some(value.clone());
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn parameter(&self) -> Option<MethodParam> {
        self.current
            .clone()
            .map(|value| MethodParam::json("tunable", value))
    }

    fn version(&self) -> String {
        "tunable_v2".into()
    }
}

/// Fails initialization. Declared thread safe so init runs eagerly on the
/// constructing thread and surfaces as a build error.
pub struct BrokenInit;

impl Method for BrokenInit {
    fn init(&mut self, _config: &serde_json::Value) -> Result<(), MethodError> {
        Err(MethodError::InitFailed {
            method_name: "broken".into(),
            reason: "refusing to start".into(),
        })
    }

    fn process(
        &mut self,
        inputs: &[Vec<Arc<Payload>>],
        _params: &[Option<Arc<MethodParam>>],
    ) -> Batch {
        inputs.to_vec()
    }

    fn update_parameter(&mut self, _param: &MethodParam) -> Result<(), MethodError> {
        Ok(())
    }

    fn info(&self) -> MethodInfo {
        MethodInfo {
            thread_safe: true,
            ..Default::default()
        }
    }
}

/// A payload value that flips a flag when dropped, for observing slot
/// release.
pub struct DropProbe {
    pub flag: Arc<AtomicBool>,
}

impl Drop for DropProbe {
    fn drop(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Spec for a single-node flow: `in -> node -> out`.
pub fn single_node_spec(method_type: &str) -> serde_json::Value {
    json!({
        "inputs": ["in"],
        "outputs": ["out"],
        "nodes": [{
            "name": "only",
            "method_type": method_type,
            "inputs": ["in"],
            "outputs": ["out"]
        }]
    })
}

/// Spec for a two-node chain `in -> head -> mid -> tail -> out`.
pub fn chain_spec(head_type: &str, tail_type: &str) -> serde_json::Value {
    json!({
        "inputs": ["in"],
        "outputs": ["out"],
        "nodes": [
            {
                "name": "head",
                "method_type": head_type,
                "inputs": ["in"],
                "outputs": ["mid"]
            },
            {
                "name": "tail",
                "method_type": tail_type,
                "inputs": ["mid"],
                "outputs": ["out"]
            }
        ]
    })
}
