//! Event ordering, cancellation, lifecycle tokens and error routing

use courier_core::{
    ApiSpec, CallOptions, EngineConfig, ErrorHandlers, ErrorKind, ErrorMatcher, LifecycleScope,
    MethodSpec, RpcError, WeakToken,
};
use courier_testkit::{
    assert_lifecycle_order, Harness, Observed, RecordingCallback, Reply, ScriptedTransport,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn echo_api() -> ApiSpec {
    ApiSpec::new("Echo")
        .prefix("echo.")
        .method(MethodSpec::asynchronous("say").param_names(["text"]))
}

fn echo_harness(transport: ScriptedTransport) -> Harness {
    transport.respond("echo.say", |params| Reply::value(params["text"].clone()));
    Harness::new(EngineConfig::default(), [echo_api()], transport).unwrap()
}

#[tokio::test]
async fn test_progress_is_delivered_between_start_and_outcome() {
    let h = echo_harness(ScriptedTransport::new().with_ticks(vec![25, 25, 50]));
    let say = h.engine.method("Echo", "say").unwrap();
    let recorder = RecordingCallback::new();

    let call = h
        .engine
        .submit(&say, vec![json!("hi")], CallOptions::new().callback(recorder.clone()))
        .unwrap();
    call.wait().await;

    let events = recorder.events(call.id());
    assert_lifecycle_order(&events);
    assert_eq!(
        events,
        vec![
            Observed::Start { cached: false },
            Observed::Progress(25),
            Observed::Progress(50),
            Observed::Progress(100),
            Observed::Success(json!("hi")),
            Observed::Finish,
        ]
    );
}

#[tokio::test]
async fn test_progress_is_clamped_and_monotonic() {
    let h = echo_harness(ScriptedTransport::new().with_ticks(vec![60, 0, 60, 10]));
    let say = h.engine.method("Echo", "say").unwrap();
    let recorder = RecordingCallback::new();

    let call = h
        .engine
        .submit(&say, vec![json!("hi")], CallOptions::new().callback(recorder.clone()))
        .unwrap();
    call.wait().await;

    let progress: Vec<Observed> = recorder
        .events(call.id())
        .into_iter()
        .filter(|e| matches!(e, Observed::Progress(_)))
        .collect();
    assert_eq!(progress, vec![Observed::Progress(60), Observed::Progress(100)]);
}

#[tokio::test]
async fn test_cancelled_call_only_finishes() {
    let h = echo_harness(ScriptedTransport::new());
    let say = h.engine.method("Echo", "say").unwrap();
    let recorder = RecordingCallback::new();
    h.transport.pause();

    let call = h
        .engine
        .submit(&say, vec![json!("late")], CallOptions::new().callback(recorder.clone()))
        .unwrap();
    call.cancel();
    call.cancel();
    h.transport.resume();
    call.wait().await;
    h.engine.flush_events().await;

    assert!(call.is_cancelled());
    assert_eq!(call.result(), Some(Err(RpcError::Cancelled)));
    assert_eq!(recorder.labels(call.id()), vec!["finish"]);
    assert!(h.observer.errors().is_empty());
}

#[tokio::test]
async fn test_ended_scope_cancels_bound_calls() {
    let h = echo_harness(ScriptedTransport::new());
    let say = h.engine.method("Echo", "say").unwrap();
    let recorder = RecordingCallback::new();
    let scope = LifecycleScope::new();
    h.transport.pause();

    let call = h
        .engine
        .submit(
            &say,
            vec![json!("bye")],
            CallOptions::new().callback(recorder.clone()).bound_to(scope.clone()),
        )
        .unwrap();
    scope.end();
    assert!(call.is_cancelled());

    // Binding to a scope that already ended cancels at once
    let late = h
        .engine
        .submit(&say, vec![json!("again")], CallOptions::new().bound_to(scope.clone()))
        .unwrap();
    assert!(late.is_cancelled());

    h.transport.resume();
    h.engine.flush_events().await;
    assert_eq!(recorder.labels(call.id()), vec!["finish"]);
}

#[tokio::test]
async fn test_long_lived_scope_does_not_accumulate_settled_calls() {
    let h = echo_harness(ScriptedTransport::new());
    let say = h.engine.method("Echo", "say").unwrap();
    let scope = LifecycleScope::new();

    for n in 0..50 {
        let call = h
            .engine
            .submit(&say, vec![json!(n)], CallOptions::new().bound_to(scope.clone()))
            .unwrap();
        call.wait().await;
        assert!(call.is_done());
        assert!(scope.bound_count() <= 1, "{scope:?}");
    }

    // Ending the scope still reaches a call bound after all that churn
    h.transport.pause();
    let last = h
        .engine
        .submit(&say, vec![json!("tail")], CallOptions::new().bound_to(scope.clone()))
        .unwrap();
    scope.end();
    assert!(last.is_cancelled());
    h.transport.resume();
}

#[tokio::test]
async fn test_resubmitted_call_is_rebound_to_its_scope() {
    let h = echo_harness(ScriptedTransport::new());
    let say = h.engine.method("Echo", "say").unwrap();
    let scope = LifecycleScope::new();

    let call = h
        .engine
        .submit(&say, vec![json!("once")], CallOptions::new().bound_to(scope.clone()))
        .unwrap();
    call.wait().await;
    // A later binding prunes the settled call from the scope
    h.engine
        .submit(&say, vec![json!("other")], CallOptions::new().bound_to(scope.clone()))
        .unwrap()
        .wait()
        .await;
    call.reset().unwrap();

    h.transport.pause();
    h.engine.resubmit(&call).unwrap();
    scope.end();
    assert!(call.is_cancelled());
    h.transport.resume();
}

#[tokio::test]
async fn test_dropped_owner_suppresses_everything_but_finish() {
    let h = echo_harness(ScriptedTransport::new());
    let say = h.engine.method("Echo", "say").unwrap();
    let recorder = RecordingCallback::new();
    let screen = LifecycleScope::new();
    let token = Arc::new(WeakToken(Arc::downgrade(&screen)));

    let call = h
        .engine
        .submit(
            &say,
            vec![json!("anyone?")],
            CallOptions::new().callback(recorder.clone()).bound_to(token),
        )
        .unwrap();
    drop(screen);
    call.wait().await;
    h.engine.flush_events().await;

    assert_eq!(recorder.labels(call.id()), vec!["finish"]);
}

#[tokio::test]
async fn test_most_specific_handler_wins() {
    let transport = ScriptedTransport::new();
    transport.respond("echo.say", |_| Reply::api_error(404, "missing"));
    let h = Harness::new(EngineConfig::default(), [echo_api()], transport).unwrap();
    let say = h.engine.method("Echo", "say").unwrap();
    let recorder = RecordingCallback::new();

    let any = Arc::new(AtomicUsize::new(0));
    let kind = Arc::new(AtomicUsize::new(0));
    let code = Arc::new(AtomicUsize::new(0));
    let handlers = {
        let (any, kind, code) = (any.clone(), kind.clone(), code.clone());
        ErrorHandlers::new()
            .on(ErrorMatcher::Any, move |_| {
                any.fetch_add(1, Ordering::SeqCst);
            })
            .on(ErrorMatcher::Kind(ErrorKind::Api), move |_| {
                kind.fetch_add(1, Ordering::SeqCst);
            })
            .on(ErrorMatcher::ApiCode(404), move |_| {
                code.fetch_add(1, Ordering::SeqCst);
            })
    };

    let call = h
        .engine
        .submit(
            &say,
            vec![json!("x")],
            CallOptions::new().callback(recorder.clone()).handlers(handlers),
        )
        .unwrap();
    call.wait().await;

    assert_eq!(any.load(Ordering::SeqCst), 0);
    assert_eq!(kind.load(Ordering::SeqCst), 0);
    assert_eq!(code.load(Ordering::SeqCst), 1);
    // The handler took the error; the generic callback did not see it
    assert_eq!(recorder.labels(call.id()), vec!["start", "finish"]);
    // Observers see every terminal error regardless
    assert_eq!(h.observer.errors().len(), 1);
}

#[tokio::test]
async fn test_kind_handler_beats_catch_all() {
    let transport = ScriptedTransport::new();
    transport.respond("echo.say", |_| Reply::connection_failure("offline"));
    let h = Harness::new(EngineConfig::default(), [echo_api()], transport).unwrap();
    let say = h.engine.method("Echo", "say").unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let handlers = {
        let hits = hits.clone();
        ErrorHandlers::new()
            .on(ErrorMatcher::Any, |_| panic!("catch-all must not run"))
            .on(ErrorMatcher::Kind(ErrorKind::Connection), move |err| {
                assert!(err.is_connection());
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .on(ErrorMatcher::ApiCode(500), |_| panic!("code handler must not run"))
    };

    let call = h
        .engine
        .submit(&say, vec![json!("x")], CallOptions::new().handlers(handlers))
        .unwrap();
    call.wait().await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_errors_without_handler_reach_callback() {
    let transport = ScriptedTransport::new();
    transport.respond("echo.say", |_| Reply::api_error(503, "busy"));
    let h = Harness::new(EngineConfig::default(), [echo_api()], transport).unwrap();
    let say = h.engine.method("Echo", "say").unwrap();
    let recorder = RecordingCallback::new();

    let call = h
        .engine
        .submit(&say, vec![json!("x")], CallOptions::new().callback(recorder.clone()))
        .unwrap();
    call.wait().await;

    let events = recorder.events(call.id());
    assert_lifecycle_order(&events);
    assert!(matches!(
        events.as_slice(),
        [
            Observed::Start { cached: false },
            Observed::Error(RpcError::Api { code: 503, .. }),
            Observed::Finish
        ]
    ));
    let observed = h.observer.errors();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].0, call.id());
}

#[tokio::test]
async fn test_latency_is_recorded_per_wire_name() {
    let h = echo_harness(ScriptedTransport::new());
    let say = h.engine.method("Echo", "say").unwrap();
    for text in ["a", "b"] {
        h.engine
            .submit(&say, vec![json!(text)], CallOptions::new())
            .unwrap()
            .wait()
            .await;
    }

    let snapshot = h.engine.latency_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].wire_name, "echo.say");
    assert_eq!(snapshot[0].samples, 2);
}

#[tokio::test]
async fn test_headers_and_timing_are_kept() {
    let h = echo_harness(ScriptedTransport::new());
    let say = h.engine.method("Echo", "say").unwrap();
    let call = h
        .engine
        .submit(&say, vec![json!("hdr")], CallOptions::new())
        .unwrap();
    call.wait().await;

    let headers = call.headers().unwrap();
    assert_eq!(headers.get("x-script"), Some(&vec!["echo.say".to_owned()]));
    let timing = call.timing();
    assert!(timing.started_ms.is_some());
    assert_eq!(timing.duration_ms(), Some(0));
}
