//! Courier Testing Infrastructure
//!
//! Scripted collaborators for exercising the engine without a network: a
//! JSON codec, a transport that answers from per-method scripts, an
//! in-memory durable store, a manual clock and recording callbacks.
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier_testkit::*;
//!
//! #[tokio::test]
//! async fn forecast_is_cached() {
//!     let transport = ScriptedTransport::new();
//!     transport.respond("weather.forecast", |_| Reply::value(json!({"high": 12})));
//!     let harness = Harness::new(EngineConfig::default(), [weather_api()], transport).unwrap();
//!     // ... test logic
//! }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod clock;
pub mod codec;
pub mod demo;
pub mod logging;
pub mod recorder;
pub mod store;
pub mod transport;

pub use clock::ManualClock;
pub use codec::JsonCodec;
pub use demo::{weather_api, WeatherClient, WEATHER};
pub use logging::init_tracing;
pub use recorder::{
    assert_lifecycle_order, BatchObserved, Observed, RecordingBatchCallback, RecordingCallback,
    RecordingObserver,
};
pub use store::MemoryDurableStore;
pub use transport::{Reply, ScriptedTransport};

use courier_core::{ApiSpec, Engine, EngineConfig, Result};
use std::sync::Arc;

/// Engine wired to scripted collaborators
#[derive(Debug)]
pub struct Harness {
    /// Engine under test
    pub engine: Engine,
    /// Scripted transport shared with the engine
    pub transport: Arc<ScriptedTransport>,
    /// Clock driving cache TTLs
    pub clock: Arc<ManualClock>,
    /// Durable cache tier
    pub store: Arc<MemoryDurableStore>,
    /// Observer of every terminal error
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    /// Build an engine for `apis`. Must run inside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        apis: impl IntoIterator<Item = ApiSpec>,
        transport: ScriptedTransport,
    ) -> Result<Self> {
        init_tracing();
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryDurableStore::new(clock.clone()));
        let observer = RecordingObserver::new();

        let mut builder = Engine::builder()
            .config(config)
            .codec(Arc::new(JsonCodec))
            .transport(transport.clone())
            .durable_store(store.clone())
            .clock(clock.clone())
            .observer(observer.clone());
        for api in apis {
            builder = builder.register_api(api);
        }

        Ok(Self {
            engine: builder.build()?,
            transport,
            clock,
            store,
            observer,
        })
    }
}
