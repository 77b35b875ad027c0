//! # Courier Core - Client-Side RPC Execution Engine
//!
//! Given a declarative description of a remote method (name, timeout, cache
//! and single-flight policy), this crate decides how and when each call is
//! performed, reconciles results back to callers and delivers lifecycle
//! events in order.
//!
//! ## Purpose
//!
//! - Per-call lifecycle state machine with cancellation and reset
//! - Manual and time-windowed automatic batching of independent calls
//! - Two-tier result cache (memory LRU + pluggable durable store) with TTL
//!   and error fallback
//! - Single-flight admission per method identity
//! - Weighted ordering and timeout budgets for batched calls
//! - Ordered single-consumer delivery of `start`, `progress`, outcome and
//!   `finish` events
//!
//! ## What Does NOT Belong Here
//!
//! - Wire formats (implement [`ProtocolCodec`])
//! - Network I/O, retries and redirects (implement [`Transport`])
//! - Disk I/O of the durable tier (implement [`DurableStore`])
//! - Test doubles (belong in courier-testkit)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_core::{ApiSpec, CachePolicy, CallOptions, Engine, MethodSpec};
//!
//! let api = ApiSpec::new("WeatherApi")
//!     .prefix("weather.")
//!     .method(MethodSpec::asynchronous("forecast").cache(CachePolicy::new().ttl_ms(60_000)));
//!
//! let engine = Engine::builder()
//!     .register_api(api)
//!     .codec(codec)
//!     .transport(transport)
//!     .build()?;
//!
//! let forecast = engine.method("WeatherApi", "forecast")?;
//! let call = engine.submit(&forecast, vec![json!("Oslo")], CallOptions::new().callback(cb))?;
//! call.wait().await;
//! ```

pub mod batch;
pub mod cache;
pub mod call;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod method;
pub mod protocol;
mod reconcile;
pub mod schedule;
pub mod single_flight;
pub mod stats;

pub use batch::{Batch, BatchHandle, BatchId, BatchOptions, BatchOutcome};
pub use cache::{ArgKey, CacheHit, CachedValue, DurableStore, MemoryCache, ResultCache};
pub use call::{CacheInfo, CallHandle, CallId, CallOptions, CallState, CallTiming, Headers};
pub use clock::{Clock, SystemClock};
pub use config::{BatchTimeoutMode, CacheMode, EngineConfig};
pub use delivery::{BatchCallback, CallCallback, ErrorObserver, ProgressSink};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorKind, Result, RpcError};
pub use handlers::{ErrorHandlers, ErrorMatcher};
pub use lifecycle::{Canceller, LifecycleScope, LifecycleToken, WeakToken};
pub use method::{
    ApiSpec, CachePolicy, CallMode, FallbackMode, MethodId, MethodRef, MethodSpec, PersistenceLevel,
    ResolvedCachePolicy, ResolvedMethod, ReturnShape, SingleFlightMode,
};
pub use protocol::{ProtocolCodec, Transport, WireRequest, WireResponse, WireResult};
pub use single_flight::{Admission, SingleFlightRegistry};
pub use stats::{LatencyStats, LatencySummary};
