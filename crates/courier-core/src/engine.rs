//! Engine construction and the call paths
//!
//! [`EngineBuilder`] validates configuration and method specs once, spawns
//! the delivery consumer and returns a cheaply cloneable [`Engine`].
//! Synchronous calls run inline on the caller's task; asynchronous calls go
//! through single-flight admission and then either to the automatic batch
//! window or straight to the worker pool.

use crate::batch::{self, AutoBatcher, Batch, BatchHandle, BatchId};
use crate::cache::{DurableStore, ResultCache};
use crate::call::{CacheInfo, CallContext, CallHandle, CallId, CallOptions, CallState, Headers};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::delivery::{self, DeliverySender, ErrorObserver, ProgressSink};
use crate::error::{Result, RpcError};
use crate::method::{ApiSpec, CallMode, FallbackMode, MethodId, MethodRef};
use parking_lot::Mutex;
use crate::protocol::{ProtocolCodec, Transport, WireResult};
use crate::reconcile::{accept_success, fallback};
use crate::schedule::WorkerPool;
use crate::single_flight::{Admission, SingleFlightRegistry};
use crate::stats::{LatencyStats, LatencySummary};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    apis: Vec<ApiSpec>,
    codec: Option<Arc<dyn ProtocolCodec>>,
    transport: Option<Arc<dyn Transport>>,
    durable: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn ErrorObserver>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            apis: Vec::new(),
            codec: None,
            transport: None,
            durable: None,
            clock: Arc::new(SystemClock),
            observers: Vec::new(),
        }
    }
}

impl EngineBuilder {
    /// Replace the configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an API; its methods are resolved at [`build`](Self::build)
    pub fn register_api(mut self, api: ApiSpec) -> Self {
        self.apis.push(api);
        self
    }

    /// Set the protocol codec (required)
    pub fn codec(mut self, codec: Arc<dyn ProtocolCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set the transport (required)
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Back the memory cache with a durable tier
    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Replace the wall clock
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add an error observer
    pub fn observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate everything and start the engine.
    ///
    /// Must be called from within a tokio runtime; the engine spawns its
    /// workers and delivery consumer onto that runtime.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            RpcError::configuration("the engine must be built inside a tokio runtime")
        })?;
        let codec = self
            .codec
            .ok_or_else(|| RpcError::configuration("no protocol codec configured"))?;
        let transport = self
            .transport
            .ok_or_else(|| RpcError::configuration("no transport configured"))?;

        let mut by_id: HashMap<MethodId, MethodRef> = HashMap::new();
        let mut by_name: HashMap<(String, String), Vec<MethodRef>> = HashMap::new();
        for api in &self.apis {
            for method in api.resolve(&self.config)? {
                if let Some(existing) = by_id.get(&method.id) {
                    return Err(RpcError::configuration(format!(
                        "{}::{} is declared twice (identity {} already used by {}::{})",
                        method.interface, method.name, method.id, existing.interface, existing.name
                    )));
                }
                let method = Arc::new(method);
                by_name
                    .entry((method.interface.clone(), method.name.clone()))
                    .or_default()
                    .push(method.clone());
                by_id.insert(method.id, method);
            }
        }

        let (delivery, events) = delivery::channel();
        let observers: Arc<[Arc<dyn ErrorObserver>]> = self.observers.into();
        // The consumer outlives shutdown and stops once every sender is gone
        runtime.spawn(delivery::run_consumer(events, observers.clone()));
        let pool = WorkerPool::new(runtime, self.config.worker_threads);

        let auto = self.config.auto_batch_window().map(AutoBatcher::new);
        let cache = ResultCache::new(
            self.config.cache_enabled,
            self.config.cache_mode,
            self.durable,
            self.clock.clone(),
        );

        info!(
            methods = by_id.len(),
            workers = self.config.worker_threads,
            auto_batch_window_ms = ?self.config.auto_batch_window_ms,
            "engine started"
        );

        Ok(Engine {
            shared: Arc::new(Shared {
                stats: LatencyStats::new(self.config.latency_window),
                config: self.config,
                by_id,
                by_name,
                codec,
                transport,
                cache,
                single_flight: Arc::new(SingleFlightRegistry::new()),
                pool,
                live: LiveWork::default(),
                delivery,
                clock: self.clock,
                observers,
                auto,
                next_call: AtomicU64::new(1),
                next_batch: AtomicU64::new(1),
            }),
        })
    }
}

pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    by_id: HashMap<MethodId, MethodRef>,
    by_name: HashMap<(String, String), Vec<MethodRef>>,
    codec: Arc<dyn ProtocolCodec>,
    transport: Arc<dyn Transport>,
    pub(crate) cache: ResultCache,
    single_flight: Arc<SingleFlightRegistry>,
    pub(crate) stats: LatencyStats,
    pub(crate) pool: WorkerPool,
    live: LiveWork,
    pub(crate) delivery: DeliverySender,
    clock: Arc<dyn Clock>,
    observers: Arc<[Arc<dyn ErrorObserver>]>,
    pub(crate) auto: Option<AutoBatcher>,
    next_call: AtomicU64,
    next_batch: AtomicU64,
}

/// Calls and batches handed to the worker pool and not yet terminal
#[derive(Default)]
struct LiveWork {
    calls: Mutex<Vec<CallHandle>>,
    batches: Mutex<Vec<BatchHandle>>,
}

impl LiveWork {
    fn track_call(&self, call: &CallHandle) {
        let mut calls = self.calls.lock();
        calls.retain(|c| !c.state().is_terminal());
        calls.push(call.clone());
    }

    fn track_batch(&self, batch: &BatchHandle) {
        let mut batches = self.batches.lock();
        batches.retain(|b| !b.state().is_terminal());
        batches.push(batch.clone());
    }

    /// Cancel everything still live; returns how many were cancelled
    fn cancel_all(&self) -> usize {
        let batches = std::mem::take(&mut *self.batches.lock());
        let calls = std::mem::take(&mut *self.calls.lock());
        let mut cancelled = 0;
        for batch in batches.iter().filter(|b| !b.state().is_terminal()) {
            batch.cancel();
            cancelled += 1;
        }
        for call in calls.iter().filter(|c| !c.state().is_terminal()) {
            call.cancel();
            cancelled += 1;
        }
        cancelled
    }
}

impl Shared {
    pub(crate) fn registered(&self, method: &MethodRef) -> Result<MethodRef> {
        self.by_id.get(&method.id).cloned().ok_or_else(|| {
            RpcError::configuration(format!(
                "{}::{} is not registered with this engine",
                method.interface, method.name
            ))
        })
    }

    pub(crate) fn new_call(&self, method: MethodRef, args: Vec<Value>, options: CallOptions, quiet: bool) -> CallHandle {
        let id = CallId(self.next_call.fetch_add(1, Ordering::Relaxed));
        let ctx = CallContext {
            delivery: self.delivery.clone(),
            single_flight: self.single_flight.clone(),
            clock: self.clock.clone(),
        };
        CallHandle::new(id, method, args, options, quiet, ctx)
    }

    pub(crate) fn next_batch_id(&self) -> BatchId {
        BatchId(self.next_batch.fetch_add(1, Ordering::Relaxed))
    }

    /// Record a terminal outcome and queue its delivery
    pub(crate) fn finish(&self, call: &CallHandle, outcome: Result<Arc<Value>>, headers: Headers) -> bool {
        if !call.complete(outcome, headers) {
            trace!(call_id = call.id().0, "outcome dropped for cancelled call");
            return false;
        }
        if call.is_quiet() {
            call.settle();
        } else {
            self.delivery.outcome(call);
        }
        true
    }

    pub(crate) fn admit(&self, call: &CallHandle) -> Admission {
        match call.method().single_flight {
            Some(mode) => self.single_flight.register(call, mode),
            None => Admission::Admitted,
        }
    }

    fn enqueue(self: &Arc<Self>, call: CallHandle) {
        if self.admit(&call) == Admission::Rejected {
            return;
        }
        call.mark_running();
        debug!(call_id = call.id().0, method = %call.method().wire_name, "call admitted");
        match &self.auto {
            Some(auto) => auto.enqueue(self, call),
            None => self.spawn_single(call),
        }
    }

    pub(crate) fn spawn_single(self: &Arc<Self>, call: CallHandle) {
        self.live.track_call(&call);
        let shared = self.clone();
        let task_call = call.clone();
        let abort = self.pool.spawn(async move {
            let _ = shared.execute_single(&task_call).await;
        });
        call.set_abort(abort);
    }

    pub(crate) fn spawn_batch(self: &Arc<Self>, batch: BatchHandle, members: Vec<CallHandle>) {
        self.live.track_batch(&batch);
        let shared = self.clone();
        self.pool.spawn(async move {
            batch::dispatch(shared, batch, members).await;
        });
    }

    /// Run one call outside any batch and record its outcome
    pub(crate) async fn execute_single(&self, call: &CallHandle) -> Result<Arc<Value>> {
        let method = call.method().clone();
        if method.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(method.delay_ms)).await;
        }
        if call.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        let reserve = match self.cache.get(&method, call.arg_key()).await {
            Some(hit) if method.cache.map(|p| p.fallback) == Some(FallbackMode::Never) => {
                trace!(call_id = call.id().0, age_ms = hit.age_ms, "served from cache");
                self.delivery.start(call, CacheInfo::hit(hit.age_ms));
                let value = hit.value.clone();
                self.finish(call, Ok(hit.value), hit.headers);
                return Ok(value);
            }
            reserve => reserve,
        };

        self.delivery.start(call, CacheInfo::miss());
        let sink = if call.is_quiet() {
            ProgressSink::detached()
        } else {
            ProgressSink::new(vec![call.clone()], self.config.progress_ticks, self.delivery.clone())
        };
        let started = tokio::time::Instant::now();
        let exchange = async {
            let request = self.codec.encode(call)?;
            let response = self
                .transport
                .send(request, Duration::from_millis(method.timeout_ms), &sink)
                .await?;
            let value = self.codec.decode(call, &response)?;
            Ok((value, response.headers))
        };
        let result = bounded(method.timeout_ms, exchange).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.stats.record(&method.wire_name, elapsed_ms);
        debug!(call_id = call.id().0, method = %method.wire_name, elapsed_ms, ok = result.is_ok(), "call returned");

        let (outcome, headers) = match result {
            Ok((value, headers)) => (Ok(accept_success(call, value, &headers, &self.cache).await), headers),
            Err(error) => fallback(call, reserve, error),
        };
        self.finish(call, outcome.clone(), headers);
        outcome
    }

    /// One batch exchange bounded by `budget_ms`
    pub(crate) async fn exchange_batch(
        &self,
        calls: &[CallHandle],
        budget_ms: u64,
        sink: &ProgressSink,
    ) -> Result<Vec<WireResult>> {
        let exchange = async {
            let request = self.codec.encode_batch(calls)?;
            let response = self
                .transport
                .send_batch(request, Duration::from_millis(budget_ms), sink)
                .await?;
            self.codec.decode_batch(calls, &response)
        };
        bounded(budget_ms, exchange).await
    }
}

async fn bounded<T>(budget_ms: u64, exchange: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(Duration::from_millis(budget_ms), exchange).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::timeout(budget_ms)),
    }
}

/// Client-side RPC engine
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Active configuration
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Look up a registered method by interface and name
    pub fn method(&self, interface: &str, name: &str) -> Result<MethodRef> {
        let key = (interface.to_owned(), name.to_owned());
        match self.shared.by_name.get(&key).map(Vec::as_slice) {
            Some([method]) => Ok(method.clone()),
            Some([]) | None => Err(RpcError::configuration(format!(
                "unknown method {interface}::{name}"
            ))),
            Some(_) => Err(RpcError::configuration(format!(
                "{interface}::{name} is overloaded; look it up by signature"
            ))),
        }
    }

    /// Look up one overload of a registered method
    pub fn method_with_signature(&self, interface: &str, name: &str, signature: &str) -> Result<MethodRef> {
        let id = MethodId::derive(interface, name, signature);
        self.shared.by_id.get(&id).cloned().ok_or_else(|| {
            RpcError::configuration(format!("unknown method {interface}::{name}({signature})"))
        })
    }

    /// Execute `method` inline and return its value.
    ///
    /// No callback is involved; terminal errors still reach the error
    /// observers. Methods with single-flight admission cannot be called
    /// this way.
    pub async fn call(&self, method: &MethodRef, args: Vec<Value>) -> Result<Arc<Value>> {
        let method = self.shared.registered(method)?;
        if method.single_flight.is_some() {
            return Err(RpcError::configuration(format!(
                "{}::{} uses single-flight admission and must be submitted",
                method.interface, method.name
            )));
        }
        let call = self.shared.new_call(method, args, CallOptions::default(), true);
        call.mark_running();
        let outcome = self.shared.execute_single(&call).await;
        if let Err(error) = &outcome {
            if !error.is_cancelled() {
                for observer in self.shared.observers.iter() {
                    observer.on_error(error, &call);
                }
            }
        }
        outcome
    }

    /// [`call`](Self::call) and deserialize the value into `T`
    pub async fn call_typed<T: DeserializeOwned>(&self, method: &MethodRef, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(Value::clone(&value))?)
    }

    /// Submit `method` for asynchronous execution
    pub fn submit(&self, method: &MethodRef, args: Vec<Value>, options: CallOptions) -> Result<CallHandle> {
        let method = self.shared.registered(method)?;
        if method.mode == CallMode::Sync {
            return Err(RpcError::configuration(format!(
                "{}::{} is synchronous; use Engine::call",
                method.interface, method.name
            )));
        }
        let call = self.shared.new_call(method, args, options, false);
        self.shared.enqueue(call.clone());
        Ok(call)
    }

    /// Execute a call again after [`CallHandle::reset`], keeping its id
    pub fn resubmit(&self, call: &CallHandle) -> Result<()> {
        self.shared.registered(call.method())?;
        if call.state() != CallState::Created {
            return Err(RpcError::configuration(format!(
                "call {} must be reset before it is resubmitted",
                call.id()
            )));
        }
        call.bind_lifecycle();
        self.shared.enqueue(call.clone());
        Ok(())
    }

    /// Open a manual batch
    pub fn batch(&self) -> Batch {
        Batch::new(self.shared.clone())
    }

    /// Drop the memory cache tier of every method
    pub fn clear_cache(&self) {
        self.shared.cache.clear();
    }

    /// Drop the memory cache tier of one method
    pub fn clear_method_cache(&self, method: &MethodRef) {
        self.shared.cache.clear_method(method.id);
    }

    /// Whether the memory tier holds an entry for `method` with `args`
    pub fn is_cached(&self, method: &MethodRef, args: &[Value]) -> bool {
        self.shared
            .cache
            .memory()
            .contains(method.id, &crate::cache::ArgKey::from_args(args))
    }

    /// Resolve once every event queued so far has been delivered
    pub async fn flush_events(&self) {
        self.shared.delivery.barrier().await;
    }

    /// Rolling latency per wire name
    pub fn latency_snapshot(&self) -> Vec<LatencySummary> {
        self.shared.stats.snapshot()
    }

    /// Id of the single-flight call currently in flight for `method`
    pub fn in_flight(&self, method: &MethodRef) -> Option<CallId> {
        self.shared.single_flight.in_flight(method.id)
    }

    /// Cancel every buffered or running call and batch, then abort the
    /// worker tasks. Cancelled calls still receive their `finish`.
    pub fn shutdown(&self) {
        let mut cancelled = 0;
        if let Some(auto) = &self.shared.auto {
            for call in auto.take() {
                call.cancel();
                cancelled += 1;
            }
        }
        cancelled += self.shared.live.cancel_all();
        let live = self.shared.pool.live_tasks();
        self.shared.pool.shutdown();
        info!(cancelled, aborted_tasks = live, "engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("methods", &self.shared.by_id.len())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}
