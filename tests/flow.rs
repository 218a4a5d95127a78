mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use common::{
    BrokenInit, DropProbe, Doubler, OrderProbe, Relay, ScrambleRelay, SlowRelay, SourceProbe,
    Tunable, chain_spec, single_node_spec,
};
use weft::data::{DataState, DisableMode, FlowInput, FlowOutput, MethodParam, Payload, codes};
use weft::flow::{Flow, FlowError};
use weft::method::{MethodInfo, MethodRegistry};

fn collecting_callback() -> (weft::data::ResultCallback, flume::Receiver<FlowOutput>) {
    let (tx, rx) = flume::unbounded();
    let callback: weft::data::ResultCallback = Arc::new(move |output| {
        let _ = tx.send(output);
    });
    (callback, rx)
}

#[test]
fn sync_predict_transforms_a_value() {
    let flow = Flow::builder()
        .register_method("Doubler", || Doubler)
        .config_value(single_node_spec("Doubler"))
        .build()
        .unwrap();

    let output = flow
        .sync_predict(FlowInput::new().with_feed("in", Payload::new(21i64)))
        .unwrap();
    assert_eq!(output.error_code, 0);
    assert_eq!(output.data.len(), 1);
    assert_eq!(output.data[0].name, "out");
    assert_eq!(output.data[0].payload.value_as::<i64>(), Some(&42));
    assert_eq!(output.sequence_id, 0);

    // Sequence ids are per source and monotonic.
    let second = flow
        .sync_predict(FlowInput::new().with_feed("in", Payload::new(1i64)))
        .unwrap();
    assert_eq!(second.sequence_id, 1);
}

#[test]
fn sync_predict_loads_config_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flow.json");
    std::fs::write(&path, single_node_spec("Doubler").to_string()).unwrap();

    let flow = Flow::builder()
        .register_method("Doubler", || Doubler)
        .config_file(&path)
        .build()
        .unwrap();
    let output = flow
        .sync_predict(FlowInput::new().with_feed("in", Payload::new(5i64)))
        .unwrap();
    assert_eq!(output.data[0].payload.value_as::<i64>(), Some(&10));
}

#[test]
fn sync_predict_multi_returns_every_group_once() {
    let flow = Flow::builder()
        .register_method("Relay", Relay::new)
        .config_value(json!({
            "inputs": ["in"],
            "outputs": [
                {"group": "mids", "outputs": ["mid"]},
                {"group": "finals", "outputs": ["out"]}
            ],
            "nodes": [
                {"name": "head", "method_type": "Relay", "inputs": ["in"], "outputs": ["mid"]},
                {"name": "tail", "method_type": "Relay", "inputs": ["mid"], "outputs": ["out"]}
            ]
        }))
        .build()
        .unwrap();

    // The blocking single-output call refuses a multi-group flow.
    match flow.sync_predict(FlowInput::new().with_feed("in", Payload::new(1i64))) {
        Err(FlowError::MultipleOutputGroups { count }) => assert_eq!(count, 2),
        other => panic!("expected MultipleOutputGroups, got {other:?}"),
    }

    let outputs = flow
        .sync_predict_multi(FlowInput::new().with_feed("in", Payload::new(1i64)))
        .unwrap();
    assert_eq!(outputs.len(), 2);
    // Groups come back in name order.
    assert_eq!(outputs[0].group.as_deref(), Some("finals"));
    assert_eq!(outputs[1].group.as_deref(), Some("mids"));
    assert!(outputs.iter().all(|o| o.error_code == 0));
}

#[test]
fn async_groups_are_delivered_independently_and_exactly_once() {
    let flow = Flow::builder()
        .register_method("Relay", Relay::new)
        .register_method("Slow", || SlowRelay {
            delay: Duration::from_millis(150),
        })
        .config_value(json!({
            "inputs": ["in"],
            "outputs": [
                {"group": "early", "outputs": ["mid"]},
                {"group": "late", "outputs": ["out"]}
            ],
            "nodes": [
                {"name": "head", "method_type": "Relay", "inputs": ["in"], "outputs": ["mid"]},
                {"name": "tail", "method_type": "Slow", "inputs": ["mid"], "outputs": ["out"]}
            ]
        }))
        .build()
        .unwrap();

    let (callback, results) = collecting_callback();
    flow.set_callback(callback);
    flow.async_predict(FlowInput::new().with_feed("in", Payload::new(1i64)))
        .unwrap();

    let first = results.recv_timeout(Duration::from_secs(2)).unwrap();
    let second = results.recv_timeout(Duration::from_secs(2)).unwrap();
    // The fast group completes and is reported while the slow node is
    // still running.
    assert_eq!(first.group.as_deref(), Some("early"));
    assert_eq!(second.group.as_deref(), Some("late"));
    assert!(
        results.recv_timeout(Duration::from_millis(200)).is_err(),
        "no group may be delivered twice"
    );
}

#[test]
fn per_node_callback_reports_that_nodes_own_slots() {
    let flow = Flow::builder()
        .register_method("Relay", Relay::new)
        .config_value(chain_spec("Relay", "Relay"))
        .build()
        .unwrap();

    let (callback, results) = collecting_callback();
    let (node_callback, node_results) = collecting_callback();
    flow.set_callback(callback);
    flow.set_node_callback("head", Some(node_callback)).unwrap();

    flow.async_predict(FlowInput::new().with_feed("in", Payload::new(3i64)))
        .unwrap();

    let node_output = node_results.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(node_output.node_name.as_deref(), Some("head"));
    assert_eq!(node_output.data[0].name, "mid");
    assert_eq!(node_output.data[0].payload.value_as::<i64>(), Some(&3));

    // The frame output still arrives through the global callback.
    let frame = results.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(frame.data[0].name, "out");

    // Unknown node names are rejected.
    assert!(matches!(
        flow.set_node_callback("ghost", None),
        Err(FlowError::UnknownNode { .. })
    ));
}

#[test]
fn disable_invalid_fills_every_output_slot() {
    let flow = Flow::builder()
        .register_method("Doubler", || Doubler)
        .config_value(single_node_spec("Doubler"))
        .build()
        .unwrap();

    let output = flow
        .sync_predict(
            FlowInput::new()
                .with_feed("in", Payload::new(21i64))
                .with_param(MethodParam::disable("only", DisableMode::Invalid)),
        )
        .unwrap();
    assert_eq!(output.error_code, 0);
    assert_eq!(output.data[0].payload.state, DataState::Invalid);
    assert!(output.data[0].payload.value.is_none());
}

#[test]
fn disable_pass_through_copies_inputs_unchanged() {
    let flow = Flow::builder()
        .register_method("Doubler", || Doubler)
        .config_value(single_node_spec("Doubler"))
        .build()
        .unwrap();

    let output = flow
        .sync_predict(
            FlowInput::new()
                .with_feed("in", Payload::new(21i64))
                .with_param(MethodParam::disable("only", DisableMode::PassThrough)),
        )
        .unwrap();
    // Not doubled: the method never ran.
    assert_eq!(output.data[0].payload.value_as::<i64>(), Some(&21));
}

#[test]
fn disable_use_predefine_substitutes_fixed_payloads() {
    let flow = Flow::builder()
        .register_method("Doubler", || Doubler)
        .config_value(single_node_spec("Doubler"))
        .build()
        .unwrap();

    let output = flow
        .sync_predict(
            FlowInput::new()
                .with_feed("in", Payload::new(21i64))
                .with_param(MethodParam::Disable {
                    method_name: "only".into(),
                    mode: DisableMode::UsePreDefine,
                    predefined: vec![Arc::new(Payload::new(7i64))],
                }),
        )
        .unwrap();
    assert_eq!(output.data[0].payload.value_as::<i64>(), Some(&7));

    // A size mismatch is a configuration error: nothing is copied and
    // the slot surfaces as not ready.
    let mismatched = flow
        .sync_predict(
            FlowInput::new()
                .with_feed("in", Payload::new(21i64))
                .with_param(MethodParam::Disable {
                    method_name: "only".into(),
                    mode: DisableMode::UsePreDefine,
                    predefined: vec![Arc::new(Payload::new(1i64)), Arc::new(Payload::new(2i64))],
                }),
        )
        .unwrap();
    assert_eq!(mismatched.error_code, codes::OUTPUT_NOT_READY);
}

#[test]
fn disable_best_effort_pads_missing_outputs() {
    let flow = Flow::builder()
        .register_method("Relay", Relay::new)
        .config_value(json!({
            "inputs": ["in"],
            "outputs": ["out", "extra"],
            "nodes": [{
                "name": "only",
                "method_type": "Relay",
                "inputs": ["in"],
                "outputs": ["out", "extra"]
            }]
        }))
        .build()
        .unwrap();

    let output = flow
        .sync_predict(
            FlowInput::new()
                .with_feed("in", Payload::new(21i64))
                .with_param(MethodParam::disable(
                    "only",
                    DisableMode::BestEffortPassThrough,
                )),
        )
        .unwrap();
    let by_name = |name: &str| {
        output
            .data
            .iter()
            .find(|feed| feed.name == name)
            .unwrap()
            .payload
            .clone()
    };
    assert_eq!(by_name("out").value_as::<i64>(), Some(&21));
    assert_eq!(by_name("extra").state, DataState::Invalid);
}

#[test]
fn timeout_synthesizes_error_outputs() {
    let flow = Flow::builder()
        .register_method("Slow", || SlowRelay {
            delay: Duration::from_millis(400),
        })
        .config_value(json!({
            "inputs": ["in"],
            "outputs": ["out"],
            "nodes": [{
                "name": "only",
                "method_type": "Slow",
                "inputs": ["in"],
                "outputs": ["out"],
                "timeout_ms": 50
            }]
        }))
        .build()
        .unwrap();

    let output = flow
        .sync_predict(FlowInput::new().with_feed("in", Payload::new(1i64)))
        .unwrap();
    assert_eq!(output.error_code, codes::METHOD_TIMEOUT);
    assert_eq!(output.data[0].payload.error_code, codes::METHOD_TIMEOUT);
}

#[test]
fn backpressure_rejects_ingest_beyond_the_cap() {
    let flow = Flow::builder()
        .register_method("Slow", || SlowRelay {
            delay: Duration::from_millis(200),
        })
        .config_value(json!({
            "inputs": ["in"],
            "outputs": ["out"],
            "max_in_flight": 1,
            "nodes": [{
                "name": "only",
                "method_type": "Slow",
                "inputs": ["in"],
                "outputs": ["out"]
            }]
        }))
        .build()
        .unwrap();

    let (callback, results) = collecting_callback();
    flow.set_callback(callback);

    flow.async_predict(FlowInput::new().with_feed("in", Payload::new(1i64)))
        .unwrap();
    match flow.async_predict(FlowInput::new().with_feed("in", Payload::new(2i64))) {
        Err(FlowError::CapacityExceeded { max_in_flight }) => assert_eq!(max_in_flight, 1),
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    // Once the in-flight record completes, capacity frees up.
    results.recv_timeout(Duration::from_secs(2)).unwrap();
    flow.async_predict(FlowInput::new().with_feed("in", Payload::new(3i64)))
        .unwrap();
    results.recv_timeout(Duration::from_secs(2)).unwrap();
}

#[test]
fn ingest_validation_errors_are_synchronous() {
    let flow = Flow::builder()
        .register_method("Relay", Relay::new)
        .config_value(single_node_spec("Relay"))
        .build()
        .unwrap();

    assert!(matches!(
        flow.sync_predict(FlowInput::new().with_feed("ghost", Payload::new(1i64))),
        Err(FlowError::UnknownInput { .. })
    ));
    assert!(matches!(
        flow.sync_predict(
            FlowInput::new()
                .with_feed("in", Payload::new(1i64))
                .with_source(5)
        ),
        Err(FlowError::InvalidSource { .. })
    ));
    // Async submission without a callback is refused up front.
    assert!(matches!(
        flow.async_predict(FlowInput::new().with_feed("in", Payload::new(1i64))),
        Err(FlowError::CallbackMissing)
    ));
}

#[test]
fn reordering_node_observes_sequences_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_method = Arc::clone(&seen);
    let flow = Flow::builder()
        .register_method("Scramble", || ScrambleRelay)
        .register_method("Probe", move || {
            OrderProbe::new(
                Arc::clone(&seen_by_method),
                MethodInfo {
                    needs_reorder: true,
                    ..Default::default()
                },
            )
        })
        .config_value(json!({
            "inputs": ["in"],
            "outputs": ["out"],
            "nodes": [
                {
                    "name": "scramble",
                    "method_type": "Scramble",
                    "inputs": ["in"],
                    "outputs": ["mid"],
                    "thread_count": 4
                },
                {
                    "name": "probe",
                    "method_type": "Probe",
                    "inputs": ["mid"],
                    "outputs": ["out"]
                }
            ]
        }))
        .build()
        .unwrap();

    let (callback, results) = collecting_callback();
    flow.set_callback(callback);

    for value in 0..10i64 {
        flow.async_predict(FlowInput::new().with_feed("in", Payload::new(value)))
            .unwrap();
    }

    let mut delivered = Vec::new();
    for _ in 0..10 {
        delivered.push(results.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    // The scramble stage completes out of order; the reordering node
    // still processes strictly by sequence.
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<i64>>());
    let sequence_ids: Vec<u64> = delivered.iter().map(|o| o.sequence_id).collect();
    assert_eq!(sequence_ids, (0..10).collect::<Vec<u64>>());
}

#[test]
fn source_affine_methods_keep_one_instance_per_source() {
    let ids = Arc::new(AtomicUsize::new(0));
    let observed: Arc<Mutex<Vec<(usize, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let mut registry = MethodRegistry::new();
    {
        let ids = Arc::clone(&ids);
        let observed = Arc::clone(&observed);
        registry.register("SourceProbe", move || {
            SourceProbe::new(Arc::clone(&ids), Arc::clone(&observed))
        });
    }

    let flow = Flow::builder()
        .registry(registry)
        .config_value(json!({
            "inputs": ["in"],
            "outputs": ["out"],
            "source_count": 3,
            "nodes": [{
                "name": "probe",
                "method_type": "SourceProbe",
                "inputs": ["in"],
                "outputs": ["out"],
                "thread_count": 3
            }]
        }))
        .build()
        .unwrap();

    let (callback, results) = collecting_callback();
    flow.set_callback(callback);

    for _round in 0..5 {
        for source in 0..3u32 {
            flow.async_predict(
                FlowInput::new()
                    .with_feed("in", Payload::new(source))
                    .with_source(source),
            )
            .unwrap();
        }
    }
    for _ in 0..15 {
        results.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 15);
    // Each source is served by exactly one instance, and the instances
    // are distinct across sources.
    let mut instance_for_source = std::collections::BTreeMap::new();
    for &(instance, source) in observed.iter() {
        let entry = instance_for_source.entry(source).or_insert(instance);
        assert_eq!(*entry, instance, "source {source} switched instances");
    }
    let distinct: std::collections::BTreeSet<usize> =
        instance_for_source.values().copied().collect();
    assert_eq!(distinct.len(), 3);
}

#[test]
fn parameter_updates_reach_every_instance() {
    let updates = Arc::new(AtomicUsize::new(0));
    let updates_for_method = Arc::clone(&updates);
    let flow = Flow::builder()
        .register_method("Tunable", move || {
            Tunable::new(Arc::clone(&updates_for_method))
        })
        .config_value(json!({
            "inputs": ["in"],
            "outputs": ["out"],
            "nodes": [{
                "name": "only",
                "method_type": "Tunable",
                "inputs": ["in"],
                "outputs": ["out"],
                "thread_count": 2
            }]
        }))
        .build()
        .unwrap();

    flow.update_parameter("only", &MethodParam::json("only", json!({"threshold": 5})))
        .unwrap();
    // Two workers, two pinned instances, both updated.
    assert_eq!(updates.load(Ordering::SeqCst), 2);

    match flow.parameter("only").unwrap() {
        Some(MethodParam::Json { value, .. }) => assert_eq!(value, json!({"threshold": 5})),
        other => panic!("expected the stored parameter, got {other:?}"),
    }
    assert_eq!(flow.node_version("only").unwrap(), "tunable_v2");
    assert!(matches!(
        flow.update_parameter("ghost", &MethodParam::json("ghost", json!(1))),
        Err(FlowError::UnknownNode { .. })
    ));
}

#[test]
fn failed_method_init_fails_the_build() {
    let result = Flow::builder()
        .register_method("Broken", || BrokenInit)
        .config_value(single_node_spec("Broken"))
        .build();
    assert!(matches!(result, Err(FlowError::Method(_))));
}

#[test]
fn released_slots_drop_their_payloads_mid_flight() {
    for release in [false, true] {
        let dropped = Arc::new(AtomicBool::new(false));
        let flow = Flow::builder()
            .register_method("Relay", Relay::new)
            .register_method("Slow", || SlowRelay {
                delay: Duration::from_millis(300),
            })
            .config_value(chain_spec("Relay", "Slow"))
            .build()
            .unwrap();
        let (callback, results) = collecting_callback();
        flow.set_callback(callback);
        flow.set_config("release_slots", if release { "on" } else { "off" })
            .unwrap();

        flow.async_predict(FlowInput::new().with_feed(
            "in",
            Payload::new(DropProbe {
                flag: Arc::clone(&dropped),
            }),
        ))
        .unwrap();

        // The head node has consumed "in" (its only dependant) while the
        // tail is still sleeping.
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(
            dropped.load(Ordering::SeqCst),
            release,
            "release_slots={release}"
        );
        results.recv_timeout(Duration::from_secs(2)).unwrap();
    }
}

#[test]
fn unsupported_config_keys_are_rejected() {
    let flow = Flow::builder()
        .register_method("Relay", Relay::new)
        .config_value(single_node_spec("Relay"))
        .build()
        .unwrap();
    assert!(matches!(
        flow.set_config("profiler", "on"),
        Err(FlowError::UnsupportedConfigKey { .. })
    ));
}

#[test]
fn timeout_and_completion_race_delivers_exactly_once() {
    let flow = Flow::builder()
        .register_method("Slow", || SlowRelay {
            delay: Duration::from_millis(50),
        })
        .config_value(json!({
            "inputs": ["in"],
            "outputs": ["out"],
            "nodes": [{
                "name": "only",
                "method_type": "Slow",
                "inputs": ["in"],
                "outputs": ["out"],
                "timeout_ms": 50
            }]
        }))
        .build()
        .unwrap();

    let (callback, results) = collecting_callback();
    flow.set_callback(callback);
    for value in 0..10i64 {
        flow.async_predict(FlowInput::new().with_feed("in", Payload::new(value)))
            .unwrap();
    }
    let mut sequence_ids = Vec::new();
    for _ in 0..10 {
        let output = results.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(
            output.error_code == 0 || output.error_code == codes::METHOD_TIMEOUT,
            "unexpected aggregate code {}",
            output.error_code
        );
        sequence_ids.push(output.sequence_id);
    }
    sequence_ids.sort_unstable();
    assert_eq!(sequence_ids, (0..10).collect::<Vec<u64>>());
    assert!(
        results.recv_timeout(Duration::from_millis(200)).is_err(),
        "every record must complete exactly once"
    );
}
