//! Engine construction, configuration loading and the inline call path

use assert_matches::assert_matches;
use courier_core::{
    ApiSpec, BatchOptions, BatchTimeoutMode, CacheMode, CallOptions, CallState, Engine,
    EngineConfig, MethodSpec, RpcError,
};
use courier_testkit::{
    weather_api, Harness, JsonCodec, RecordingCallback, Reply, ScriptedTransport, WeatherClient,
    WEATHER,
};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn weather(transport: ScriptedTransport) -> Harness {
    Harness::new(EngineConfig::default(), [weather_api()], transport).unwrap()
}

#[tokio::test]
async fn test_inline_call_returns_typed_value() {
    let transport = ScriptedTransport::new();
    transport.respond("weather.currentTemperature", |params| {
        assert_eq!(params, &json!(["Oslo"]));
        Reply::value(json!(21.5))
    });
    let h = weather(transport);
    let client = WeatherClient::new(&h.engine).unwrap();

    let celsius = client.current_temperature("Oslo").await.unwrap();
    assert!((celsius - 21.5).abs() < f64::EPSILON);
    assert_eq!(h.transport.sends(), 1);
}

#[tokio::test]
async fn test_inline_call_reports_progress_nowhere() {
    let transport = ScriptedTransport::new().with_ticks(vec![40, 60]);
    transport.respond("weather.currentTemperature", |_| Reply::value(json!(3.0)));
    transport.respond("weather.stations", |_| Reply::value(json!(["OSL"])));
    let h = weather(transport);
    let client = WeatherClient::new(&h.engine).unwrap();

    client.current_temperature("Bergen").await.unwrap();
    assert_eq!(h.transport.detached_sinks(), 1);

    client.stations(CallOptions::new()).unwrap().wait().await;
    assert_eq!(h.transport.detached_sinks(), 1);
    assert_eq!(h.transport.sends(), 2);
}

#[tokio::test]
async fn test_inline_call_errors_reach_observers() {
    let transport = ScriptedTransport::new();
    transport.respond("weather.currentTemperature", |_| Reply::api_error(502, "upstream"));
    let h = weather(transport);
    let client = WeatherClient::new(&h.engine).unwrap();

    let err = client.current_temperature("Oslo").await.unwrap_err();
    assert_matches!(err, RpcError::Api { code: 502, .. });
    assert_eq!(h.observer.errors().len(), 1);
}

#[tokio::test]
async fn test_typed_call_reports_shape_mismatch_as_parse_error() {
    let transport = ScriptedTransport::new();
    transport.respond("weather.currentTemperature", |_| Reply::value(json!("warm")));
    let h = weather(transport);
    let client = WeatherClient::new(&h.engine).unwrap();

    let err = client.current_temperature("Oslo").await.unwrap_err();
    assert_matches!(err, RpcError::Parse { .. });
}

#[tokio::test]
async fn test_submit_rejects_synchronous_method() {
    let h = weather(ScriptedTransport::new());
    let method = h.engine.method(WEATHER, "currentTemperature").unwrap();
    let err = h
        .engine
        .submit(&method, vec![json!("Oslo")], CallOptions::new())
        .unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });

    let mut batch = h.engine.batch();
    let err = batch
        .submit(&method, vec![json!("Oslo")], CallOptions::new())
        .unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });
    assert!(batch.is_empty());
}

#[tokio::test]
async fn test_method_lookup() {
    let api = ApiSpec::new("Geo")
        .method(MethodSpec::asynchronous("find").signature("String"))
        .method(MethodSpec::asynchronous("find").signature("f64,f64"));
    let h = Harness::new(EngineConfig::default(), [weather_api(), api], ScriptedTransport::new())
        .unwrap();

    assert_matches!(h.engine.method(WEATHER, "nope"), Err(RpcError::Configuration { .. }));
    assert_matches!(h.engine.method("Geo", "find"), Err(RpcError::Configuration { .. }));
    let by_coords = h.engine.method_with_signature("Geo", "find", "f64,f64").unwrap();
    let by_name = h.engine.method_with_signature("Geo", "find", "String").unwrap();
    assert_ne!(by_coords.id, by_name.id);
    assert_eq!(by_coords.wire_name, "find");
}

#[tokio::test]
async fn test_methods_from_another_engine_are_rejected() {
    let first = weather(ScriptedTransport::new());
    let other = Harness::new(
        EngineConfig::default(),
        [ApiSpec::new("Other").method(MethodSpec::asynchronous("ping"))],
        ScriptedTransport::new(),
    )
    .unwrap();
    let foreign = other.engine.method("Other", "ping").unwrap();
    let err = first
        .engine
        .submit(&foreign, Vec::new(), CallOptions::new())
        .unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });
}

#[tokio::test]
async fn test_duplicate_declaration_is_rejected() {
    let err = Harness::new(
        EngineConfig::default(),
        [weather_api(), weather_api()],
        ScriptedTransport::new(),
    )
    .unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });
}

#[tokio::test]
async fn test_build_requires_codec_and_transport() {
    let err = Engine::builder().codec(Arc::new(JsonCodec)).build().unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });
    let err = Engine::builder()
        .transport(Arc::new(ScriptedTransport::new()))
        .build()
        .unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });
}

#[test]
fn test_build_requires_runtime() {
    let err = Harness::new(EngineConfig::default(), [weather_api()], ScriptedTransport::new())
        .unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });
}

#[tokio::test]
async fn test_invalid_config_fails_build() {
    let config = EngineConfig {
        worker_threads: 0,
        ..EngineConfig::default()
    };
    let err = Harness::new(config, [weather_api()], ScriptedTransport::new()).unwrap_err();
    assert_matches!(err, RpcError::Configuration { .. });
}

#[tokio::test]
async fn test_reset_and_resubmit_keep_identity() {
    let transport = ScriptedTransport::new();
    transport.respond("weather.report", |_| Reply::value(json!(null)));
    let h = weather(transport);
    let client = WeatherClient::new(&h.engine).unwrap();

    let call = client.report("Oslo", "sunny", CallOptions::new()).unwrap();
    let id = call.id();
    assert_matches!(h.engine.resubmit(&call), Err(RpcError::Configuration { .. }));
    call.wait().await;
    assert_eq!(call.state(), CallState::Done);

    call.reset().unwrap();
    assert_eq!(call.state(), CallState::Created);
    assert!(call.result().is_none());

    h.engine.resubmit(&call).unwrap();
    call.wait().await;
    assert_eq!(call.state(), CallState::Done);
    assert_eq!(call.id(), id);
    assert_eq!(h.transport.sends(), 2);
}

#[tokio::test]
async fn test_reset_rejects_running_call() {
    let h = weather(ScriptedTransport::new());
    h.transport.pause();
    let client = WeatherClient::new(&h.engine).unwrap();
    let call = client.report("Oslo", "fog", CallOptions::new()).unwrap();
    assert_matches!(call.reset(), Err(RpcError::Configuration { .. }));
    call.cancel();
    assert!(call.reset().is_ok());
}

#[tokio::test]
async fn test_shutdown_cancels_buffered_calls() {
    let config = EngineConfig {
        auto_batch_window_ms: Some(60_000),
        ..EngineConfig::default()
    };
    let h = Harness::new(config, [weather_api()], ScriptedTransport::new()).unwrap();
    let client = WeatherClient::new(&h.engine).unwrap();
    let recorder = RecordingCallback::new();

    let call = client
        .forecast("Oslo", 1, CallOptions::new().callback(recorder.clone()))
        .unwrap();
    assert!(call.is_running());
    h.engine.shutdown();
    assert!(call.is_cancelled());
    assert_eq!(h.transport.sends(), 0);

    h.engine.flush_events().await;
    assert_eq!(recorder.labels(call.id()), vec!["finish"]);
}

#[tokio::test]
async fn test_shutdown_settles_calls_mid_exchange() {
    let h = weather(ScriptedTransport::new());
    h.transport.pause();
    let client = WeatherClient::new(&h.engine).unwrap();
    let recorder = RecordingCallback::new();

    let call = client
        .forecast("Oslo", 2, CallOptions::new().callback(recorder.clone()))
        .unwrap();
    // Let the worker reach the paused transport
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(call.is_running());

    h.engine.shutdown();
    tokio::time::timeout(Duration::from_millis(500), call.wait())
        .await
        .expect("wait resolves after shutdown");
    assert!(call.is_cancelled());

    h.engine.flush_events().await;
    let labels = recorder.labels(call.id());
    assert_eq!(labels.last(), Some(&"finish"));
    assert_eq!(labels.iter().filter(|l| **l == "finish").count(), 1);
}

#[tokio::test]
async fn test_shutdown_cancels_dispatched_batch() {
    let h = weather(ScriptedTransport::new());
    h.transport.pause();
    let client = WeatherClient::new(&h.engine).unwrap();
    let forecast = client.forecast_method();

    let mut batch = h.engine.batch();
    let north = batch
        .submit(forecast, vec![json!("Tromsø"), json!(1)], CallOptions::new())
        .unwrap();
    let south = batch
        .submit(forecast, vec![json!("Kristiansand"), json!(1)], CallOptions::new())
        .unwrap();
    let handle = batch.flush(BatchOptions::new());
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.engine.shutdown();
    tokio::time::timeout(Duration::from_millis(500), handle.wait())
        .await
        .expect("batch wait resolves after shutdown");
    assert!(handle.is_cancelled());
    assert!(north.is_cancelled());
    assert!(south.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_blocking_from_plain_thread() {
    let transport = ScriptedTransport::new();
    transport.respond("weather.stations", |_| Reply::value(json!(["OSL"])));
    let h = weather(transport);
    let client = WeatherClient::new(&h.engine).unwrap();

    let call = client.stations(CallOptions::new()).unwrap();
    let waiter = call.clone();
    tokio::task::spawn_blocking(move || waiter.wait_blocking())
        .await
        .unwrap();
    assert!(call.is_done());
}

#[test]
fn test_config_loads_from_file() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        r#"
default_timeout_ms = 2500
batch_timeout_mode = "sum"
cache_mode = "shared"
auto_batch_window_ms = 15
"#
    )?;

    let config = EngineConfig::load(file.path())?;
    assert_eq!(config.default_timeout_ms, 2_500);
    assert_eq!(config.batch_timeout_mode, BatchTimeoutMode::Sum);
    assert_eq!(config.cache_mode, CacheMode::Shared);
    assert_eq!(config.auto_batch_window_ms, Some(15));
    assert_eq!(config.worker_threads, 4);
    Ok(())
}

#[test]
fn test_config_errors_name_the_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "progress_ticks = 0").unwrap();
    let err = EngineConfig::load(file.path()).unwrap_err();
    match err {
        RpcError::Configuration { message } => {
            assert!(message.contains(&file.path().display().to_string()), "{message}");
        }
        other => panic!("expected configuration error, got {other:?}"),
    }

    let missing = EngineConfig::load(std::path::Path::new("/nonexistent/courier.toml"));
    assert_matches!(missing, Err(RpcError::Configuration { .. }));
}

#[tokio::test]
async fn test_concurrent_waits_all_resolve() {
    let transport = ScriptedTransport::new();
    transport.respond("weather.forecast", |params| Reply::value(params["days"].clone()));
    let h = weather(transport);
    let client = WeatherClient::new(&h.engine).unwrap();

    let calls: Vec<_> = (1..=6)
        .map(|days| client.forecast("Oslo", days, CallOptions::new()).unwrap())
        .collect();
    futures::future::join_all(calls.iter().map(|call| call.wait())).await;

    for (days, call) in (1..=6).zip(&calls) {
        assert_eq!(*call.result().unwrap().unwrap(), json!(days));
    }
    assert_eq!(h.transport.sends(), 6);
}
