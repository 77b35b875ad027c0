//! Manual and automatic batching, dispatch order and reconciliation

use assert_matches::assert_matches;
use courier_core::{
    ApiSpec, BatchOptions, BatchTimeoutMode, CallOptions, EngineConfig, MethodSpec, RpcError,
};
use courier_testkit::{
    weather_api, BatchObserved, Harness, RecordingBatchCallback, RecordingCallback, Reply,
    ScriptedTransport, WeatherClient,
};
use serde_json::{json, Value};
use std::time::Duration;

const RANKED: [&str; 4] = ["slow", "quick", "medium", "urgent"];

fn ranked_api() -> ApiSpec {
    ApiSpec::new("Ranked")
        .prefix("r.")
        .method(MethodSpec::asynchronous("slow").timeout_ms(200))
        .method(MethodSpec::asynchronous("quick").timeout_ms(20))
        .method(MethodSpec::asynchronous("medium").timeout_ms(100))
        .method(MethodSpec::asynchronous("urgent").timeout_ms(20).high_priority())
}

fn echo_transport() -> ScriptedTransport {
    let transport = ScriptedTransport::new();
    for name in RANKED {
        transport.respond(&format!("r.{name}"), move |_| Reply::value(json!(name)));
    }
    transport
}

fn ranked(config: EngineConfig, transport: ScriptedTransport) -> Harness {
    Harness::new(config, [ranked_api()], transport).unwrap()
}

#[tokio::test]
async fn test_dispatch_orders_by_priority_then_weight() {
    let h = ranked(EngineConfig::default(), echo_transport());
    let mut batch = h.engine.batch();
    for name in RANKED {
        let method = h.engine.method("Ranked", name).unwrap();
        batch.submit(&method, Vec::new(), CallOptions::new()).unwrap();
    }
    let handle = batch.flush(BatchOptions::new());
    handle.wait().await;

    let wire: Vec<String> = ["r.urgent", "r.slow", "r.medium", "r.quick"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    assert_eq!(h.transport.exchanges(), vec![wire]);
    assert_eq!(h.transport.batch_sends(), 1);

    // The aggregate is ordered by call id, not by dispatch order
    let values: Vec<Value> = handle
        .result()
        .unwrap()
        .unwrap()
        .iter()
        .map(|v| Value::clone(v))
        .collect();
    assert_eq!(values, vec![json!("slow"), json!("quick"), json!("medium"), json!("urgent")]);
}

#[tokio::test]
async fn test_fatal_member_error_fails_batch_but_not_siblings() {
    let transport = echo_transport();
    transport.respond("r.slow", |_| Reply::api_error(400, "bad input"));
    let h = ranked(EngineConfig::default(), transport);
    let members = RecordingCallback::new();
    let aggregate = RecordingBatchCallback::new();

    let mut batch = h.engine.batch();
    let slow = h.engine.method("Ranked", "slow").unwrap();
    let quick = h.engine.method("Ranked", "quick").unwrap();
    let failing = batch
        .submit(&slow, Vec::new(), CallOptions::new().callback(members.clone()))
        .unwrap();
    let healthy = batch
        .submit(&quick, Vec::new(), CallOptions::new().callback(members.clone()))
        .unwrap();
    let handle = batch.flush(BatchOptions::new().callback(aggregate.clone()));
    handle.wait().await;

    assert_matches!(handle.result(), Some(Err(RpcError::Api { code: 400, .. })));
    assert_eq!(members.labels(failing.id()), vec!["start", "error", "finish"]);
    assert_eq!(members.labels(healthy.id()), vec!["start", "success", "finish"]);

    let events = aggregate.events();
    assert_eq!(events.first(), Some(&BatchObserved::Start));
    assert_eq!(events.last(), Some(&BatchObserved::Finish));
    assert!(events.iter().any(|e| matches!(e, BatchObserved::Error(RpcError::Api { .. }))));
    assert_eq!(aggregate.progress(), vec![50, 100]);

    let observed = h.observer.errors();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].0, failing.id());
}

#[tokio::test]
async fn test_non_fatal_member_error_leaves_null_slot() {
    let transport = echo_transport();
    transport.respond("r.slow", |_| Reply::api_error(404, "gone"));
    let h = ranked(EngineConfig::default(), transport);

    let mut batch = h.engine.batch();
    let slow = h.engine.method("Ranked", "slow").unwrap();
    let quick = h.engine.method("Ranked", "quick").unwrap();
    batch.submit(&slow, Vec::new(), CallOptions::new().non_fatal()).unwrap();
    batch.submit(&quick, Vec::new(), CallOptions::new()).unwrap();
    let handle = batch.flush(BatchOptions::new());
    handle.wait().await;

    let values = handle.result().unwrap().unwrap();
    assert_eq!(*values[0], Value::Null);
    assert_eq!(*values[1], json!("quick"));
}

#[tokio::test]
async fn test_result_count_mismatch_fails_every_member() {
    let h = ranked(EngineConfig::default(), echo_transport().dropping_last_batch_result());
    let mut batch = h.engine.batch();
    let mut calls = Vec::new();
    for name in ["slow", "quick"] {
        let method = h.engine.method("Ranked", name).unwrap();
        calls.push(batch.submit(&method, Vec::new(), CallOptions::new()).unwrap());
    }
    let handle = batch.flush(BatchOptions::new());
    handle.wait().await;

    match handle.result().unwrap() {
        Err(RpcError::Parse { message }) => {
            assert!(message.contains("expected 2 batch responses, got 1"), "{message}");
        }
        other => panic!("expected parse error, got {other:?}"),
    }
    for call in &calls {
        assert_matches!(call.result(), Some(Err(RpcError::Parse { .. })));
    }
}

#[tokio::test]
async fn test_results_matched_by_id_not_position() {
    let h = ranked(EngineConfig::default(), echo_transport().reversing_batch_results());
    let mut batch = h.engine.batch();
    let mut calls = Vec::new();
    for name in ["quick", "medium", "slow"] {
        let method = h.engine.method("Ranked", name).unwrap();
        calls.push((name, batch.submit(&method, Vec::new(), CallOptions::new()).unwrap()));
    }
    batch.flush(BatchOptions::new()).wait().await;

    for (name, call) in calls {
        assert_eq!(*call.result().unwrap().unwrap(), json!(name));
    }
}

#[tokio::test]
async fn test_transport_failure_applies_to_every_member() {
    let transport = echo_transport();
    transport.respond("r.medium", |_| Reply::connection_failure("reset by peer"));
    let h = ranked(EngineConfig::default(), transport);
    let mut batch = h.engine.batch();
    let mut calls = Vec::new();
    for name in ["quick", "medium"] {
        let method = h.engine.method("Ranked", name).unwrap();
        calls.push(batch.submit(&method, Vec::new(), CallOptions::new()).unwrap());
    }
    let handle = batch.flush(BatchOptions::new());
    handle.wait().await;

    for call in &calls {
        let err = call.result().unwrap().unwrap_err();
        assert!(err.is_connection());
    }
    assert_matches!(handle.result(), Some(Err(RpcError::Connection { .. })));
}

#[tokio::test]
async fn test_cached_members_skip_the_wire() {
    let transport = ScriptedTransport::new();
    transport.respond("weather.forecast", |params| {
        Reply::value(json!({"city": params["city"].clone()}))
    });
    let h = Harness::new(EngineConfig::default(), [weather_api()], transport).unwrap();
    let client = WeatherClient::new(&h.engine).unwrap();
    client.forecast("Oslo", 5, CallOptions::new()).unwrap().wait().await;

    let members = RecordingCallback::new();
    let aggregate = RecordingBatchCallback::new();
    let mut batch = h.engine.batch();
    for _ in 0..2 {
        batch
            .submit(
                client.forecast_method(),
                vec![json!("Oslo"), json!(5)],
                CallOptions::new().callback(members.clone()),
            )
            .unwrap();
    }
    let handle = batch.flush(BatchOptions::new().callback(aggregate.clone()));
    handle.wait().await;

    assert_eq!(h.transport.batch_sends(), 0);
    assert_eq!(h.transport.sends(), 1);
    assert_eq!(handle.result().unwrap().unwrap().len(), 2);
    assert_eq!(aggregate.progress(), vec![50, 100]);
    assert!(members
        .all()
        .iter()
        .any(|(_, e)| *e == courier_testkit::Observed::Start { cached: true }));
}

#[tokio::test]
async fn test_empty_batch_completes_immediately() {
    let h = ranked(EngineConfig::default(), echo_transport());
    let aggregate = RecordingBatchCallback::new();
    let handle = h.engine.batch().flush(BatchOptions::new().callback(aggregate.clone()));
    handle.wait().await;

    assert_eq!(
        aggregate.events(),
        vec![
            BatchObserved::Start,
            BatchObserved::Progress(100),
            BatchObserved::Success(Vec::new()),
            BatchObserved::Finish,
        ]
    );
    assert_eq!(h.transport.batch_sends(), 0);
}

#[tokio::test]
async fn test_unflushed_batch_cancels_its_calls() {
    let h = ranked(EngineConfig::default(), echo_transport());
    let recorder = RecordingCallback::new();
    let quick = h.engine.method("Ranked", "quick").unwrap();

    let mut batch = h.engine.batch();
    let call = batch
        .submit(&quick, Vec::new(), CallOptions::new().callback(recorder.clone()))
        .unwrap();
    drop(batch);
    h.engine.flush_events().await;

    assert!(call.is_cancelled());
    assert_eq!(recorder.labels(call.id()), vec!["finish"]);
    assert_eq!(h.transport.batch_sends(), 0);
}

#[tokio::test]
async fn test_cancelled_member_is_left_out() {
    let h = ranked(EngineConfig::default(), echo_transport());
    let quick = h.engine.method("Ranked", "quick").unwrap();
    let medium = h.engine.method("Ranked", "medium").unwrap();

    let mut batch = h.engine.batch();
    let dropped = batch.submit(&quick, Vec::new(), CallOptions::new()).unwrap();
    let kept = batch.submit(&medium, Vec::new(), CallOptions::new()).unwrap();
    dropped.cancel();
    let handle = batch.flush(BatchOptions::new());
    handle.wait().await;

    assert_eq!(h.transport.exchanges(), vec![vec!["r.medium".to_owned()]]);
    assert!(kept.is_done());
    assert_eq!(handle.result().unwrap().unwrap().len(), 1);
}

#[tokio::test]
async fn test_batch_cancel_reaches_members() {
    let h = ranked(EngineConfig::default(), echo_transport());
    let aggregate = RecordingBatchCallback::new();
    let quick = h.engine.method("Ranked", "quick").unwrap();

    let mut batch = h.engine.batch();
    let call = batch.submit(&quick, Vec::new(), CallOptions::new()).unwrap();
    let handle = batch.flush(BatchOptions::new().callback(aggregate.clone()));
    handle.cancel();
    handle.wait().await;
    h.engine.flush_events().await;

    assert!(handle.is_cancelled());
    assert!(call.is_cancelled());
    assert_eq!(aggregate.events(), vec![BatchObserved::Finish]);
    assert_eq!(h.transport.batch_sends(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_budget_follows_timeout_mode() {
    for (mode, succeeds) in [(BatchTimeoutMode::Max, false), (BatchTimeoutMode::Sum, true)] {
        let api = ApiSpec::new("Budget")
            .method(MethodSpec::asynchronous("a").timeout_ms(100))
            .method(MethodSpec::asynchronous("b").timeout_ms(100));
        let transport = ScriptedTransport::new().with_latency(Duration::from_millis(150));
        transport.respond("a", |_| Reply::value(json!(1)));
        transport.respond("b", |_| Reply::value(json!(2)));
        let config = EngineConfig {
            batch_timeout_mode: mode,
            ..EngineConfig::default()
        };
        let h = Harness::new(config, [api], transport).unwrap();

        let mut batch = h.engine.batch();
        for name in ["a", "b"] {
            let method = h.engine.method("Budget", name).unwrap();
            batch.submit(&method, Vec::new(), CallOptions::new()).unwrap();
        }
        let handle = batch.flush(BatchOptions::new());
        handle.wait().await;

        match handle.result().unwrap() {
            Ok(values) => assert!(succeeds, "{mode:?} should time out, got {values:?}"),
            Err(RpcError::Connection { timed_out, .. }) => {
                assert!(!succeeds, "{mode:?} should succeed");
                assert!(timed_out);
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
        h.engine.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_auto_window_degrades_single_call() {
    let config = EngineConfig {
        auto_batch_window_ms: Some(25),
        ..EngineConfig::default()
    };
    let h = ranked(config, echo_transport());
    let quick = h.engine.method("Ranked", "quick").unwrap();
    let medium = h.engine.method("Ranked", "medium").unwrap();

    let alone = h.engine.submit(&quick, Vec::new(), CallOptions::new()).unwrap();
    alone.wait().await;
    assert_eq!(h.transport.sends(), 1);
    assert_eq!(h.transport.batch_sends(), 0);

    let a = h.engine.submit(&quick, Vec::new(), CallOptions::new()).unwrap();
    let b = h.engine.submit(&medium, Vec::new(), CallOptions::new()).unwrap();
    a.wait().await;
    b.wait().await;
    assert_eq!(h.transport.batch_sends(), 1);
    assert_eq!(h.transport.exchanges().last().map(Vec::len), Some(2));
    assert_eq!(*b.result().unwrap().unwrap(), json!("medium"));
}
