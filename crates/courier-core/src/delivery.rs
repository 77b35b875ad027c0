//! Ordered single-consumer event delivery
//!
//! Workers never invoke caller callbacks directly. Every lifecycle event of
//! every asynchronous call and batch is pushed onto one unbounded channel
//! and a single consumer task drains it, so per-call order is exactly the
//! push order: `start`, `progress*`, `success | error`, `finish`.
//!
//! The consumer is also where cancellation is enforced for delivery: before
//! each event it polls the call's lifecycle token and skips everything for
//! a cancelled call except its one `finish`.

use crate::batch::BatchHandle;
use crate::call::{CacheInfo, CallHandle};
use crate::error::RpcError;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Lifecycle callback of one asynchronous call
///
/// Every method runs on the delivery consumer and must not block.
pub trait CallCallback: Send + Sync {
    /// Execution started; `cache` says whether the cache answered
    fn on_start(&self, _call: &CallHandle, _cache: CacheInfo) {}
    /// Normalised progress in percent
    fn on_progress(&self, _call: &CallHandle, _percent: u8) {}
    /// Successful result
    fn on_success(&self, _call: &CallHandle, _value: &Arc<Value>) {}
    /// Terminal error not taken by an error handler
    fn on_error(&self, _call: &CallHandle, _error: &RpcError) {}
    /// Always the last event, including for cancelled calls
    fn on_finish(&self, _call: &CallHandle) {}
}

/// Aggregate callback of one batch
pub trait BatchCallback: Send + Sync {
    /// The batch started
    fn on_start(&self, _batch: &BatchHandle) {}
    /// Share of member calls resolved, in percent
    fn on_progress(&self, _batch: &BatchHandle, _percent: u8) {}
    /// Member values ordered by call id
    fn on_success(&self, _batch: &BatchHandle, _values: &[Arc<Value>]) {}
    /// The first batch-fatal member error
    fn on_error(&self, _batch: &BatchHandle, _error: &RpcError) {}
    /// Always the last event
    fn on_finish(&self, _batch: &BatchHandle) {}
}

/// Telemetry hook for terminal errors; never affects control flow
pub trait ErrorObserver: Send + Sync {
    /// A call ended with `error`
    fn on_error(&self, error: &RpcError, call: &CallHandle);
}

pub(crate) enum Event {
    Start(CallHandle, CacheInfo),
    Progress(CallHandle, u8),
    Outcome(CallHandle),
    Finish(CallHandle),
    BatchStart(BatchHandle),
    BatchProgress(BatchHandle, u8),
    BatchOutcome(BatchHandle),
    BatchFinish(BatchHandle),
    Barrier(oneshot::Sender<()>),
}

/// Producer side of the delivery channel
#[derive(Clone)]
pub(crate) struct DeliverySender {
    tx: mpsc::UnboundedSender<Event>,
}

impl DeliverySender {
    pub(crate) fn push(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("delivery consumer stopped; event dropped");
        }
    }

    pub(crate) fn start(&self, call: &CallHandle, cache: CacheInfo) {
        if !call.is_quiet() {
            self.push(Event::Start(call.clone(), cache));
        }
    }

    pub(crate) fn progress(&self, call: &CallHandle, percent: u8) {
        if !call.is_quiet() {
            self.push(Event::Progress(call.clone(), percent));
        }
    }

    pub(crate) fn outcome(&self, call: &CallHandle) {
        if !call.is_quiet() {
            self.push(Event::Outcome(call.clone()));
        }
    }

    /// Resolves once every event pushed before it has been delivered
    pub(crate) async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        self.push(Event::Barrier(tx));
        let _ = rx.await;
    }
}

pub(crate) fn channel() -> (DeliverySender, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (DeliverySender { tx }, rx)
}

/// Drain the channel until every sender is gone
pub(crate) async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<Event>,
    observers: Arc<[Arc<dyn ErrorObserver>]>,
) {
    while let Some(event) = rx.recv().await {
        deliver(event, &observers);
    }
    tracing::debug!("delivery consumer stopped");
}

fn call_suppressed(call: &CallHandle) -> bool {
    if let Some(token) = call.lifecycle() {
        if !token.is_still_relevant() {
            call.cancel();
            return true;
        }
    }
    call.is_cancelled()
}

fn batch_suppressed(batch: &BatchHandle) -> bool {
    if let Some(token) = batch.lifecycle() {
        if !token.is_still_relevant() {
            batch.cancel();
            return true;
        }
    }
    batch.is_cancelled()
}

fn deliver(event: Event, observers: &[Arc<dyn ErrorObserver>]) {
    match event {
        Event::Start(call, cache) => {
            if call_suppressed(&call) {
                return;
            }
            tracing::trace!(call_id = call.id().0, cached = cache.cached, "deliver start");
            if let Some(callback) = call.callback() {
                callback.on_start(&call, cache);
            }
        }
        Event::Progress(call, percent) => {
            if call_suppressed(&call) {
                return;
            }
            if let Some(callback) = call.callback() {
                callback.on_progress(&call, percent);
            }
        }
        Event::Outcome(call) => {
            if !call_suppressed(&call) {
                deliver_outcome(&call, observers);
            }
            deliver_finish(&call);
            call.settle();
        }
        Event::Finish(call) => {
            deliver_finish(&call);
            call.settle();
        }
        Event::BatchStart(batch) => {
            if batch_suppressed(&batch) {
                return;
            }
            tracing::trace!(batch_id = batch.id().0, "deliver batch start");
            if let Some(callback) = batch.callback() {
                callback.on_start(&batch);
            }
        }
        Event::BatchProgress(batch, percent) => {
            if batch_suppressed(&batch) {
                return;
            }
            if let Some(callback) = batch.callback() {
                callback.on_progress(&batch, percent);
            }
        }
        Event::BatchOutcome(batch) => {
            if !batch_suppressed(&batch) {
                match batch.result() {
                    Some(Ok(values)) => {
                        if let Some(callback) = batch.callback() {
                            callback.on_success(&batch, &values);
                        }
                    }
                    Some(Err(error)) => {
                        if !batch.handlers().dispatch(&error) {
                            if let Some(callback) = batch.callback() {
                                callback.on_error(&batch, &error);
                            }
                        }
                    }
                    None => {}
                }
            }
            deliver_batch_finish(&batch);
            batch.settle();
        }
        Event::BatchFinish(batch) => {
            deliver_batch_finish(&batch);
            batch.settle();
        }
        Event::Barrier(done) => {
            let _ = done.send(());
        }
    }
}

fn deliver_outcome(call: &CallHandle, observers: &[Arc<dyn ErrorObserver>]) {
    match call.result() {
        Some(Ok(value)) => {
            tracing::trace!(call_id = call.id().0, "deliver success");
            if let Some(callback) = call.callback() {
                callback.on_success(call, &value);
            }
        }
        Some(Err(error)) => {
            tracing::trace!(call_id = call.id().0, error = %error, "deliver error");
            if !call.handlers().dispatch(&error) {
                if let Some(callback) = call.callback() {
                    callback.on_error(call, &error);
                }
            }
            if !error.is_cancelled() {
                for observer in observers {
                    observer.on_error(&error, call);
                }
            }
        }
        None => {}
    }
}

fn deliver_finish(call: &CallHandle) {
    if call.claim_finish() {
        tracing::trace!(call_id = call.id().0, "deliver finish");
        if let Some(callback) = call.callback() {
            callback.on_finish(call);
        }
    }
}

fn deliver_batch_finish(batch: &BatchHandle) {
    if batch.claim_finish() {
        if let Some(callback) = batch.callback() {
            callback.on_finish(batch);
        }
    }
}

/// Progress percentage of `ticks` on a scale of `scale`
pub fn percent(ticks: u32, scale: u32) -> u8 {
    let scale = u64::from(scale.max(1));
    let pct = (u64::from(ticks) * 100 / scale).min(100);
    u8::try_from(pct).unwrap_or(100)
}

/// Progress reporter handed to the transport for one exchange.
///
/// Ticks accumulate on the engine's tick scale and are forwarded, as a
/// percentage, to every call taking part in the exchange.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Option<Arc<ProgressInner>>,
}

struct ProgressInner {
    targets: Vec<CallHandle>,
    scale: u32,
    ticks: AtomicU32,
    last: AtomicU8,
    delivery: DeliverySender,
}

impl ProgressSink {
    pub(crate) fn new(targets: Vec<CallHandle>, scale: u32, delivery: DeliverySender) -> Self {
        Self {
            inner: Some(Arc::new(ProgressInner {
                targets,
                scale,
                ticks: AtomicU32::new(0),
                last: AtomicU8::new(0),
                delivery,
            })),
        }
    }

    /// A sink that reports nowhere
    pub fn detached() -> Self {
        Self { inner: None }
    }

    /// Whether ticks on this sink are discarded
    pub fn is_detached(&self) -> bool {
        self.inner.is_none()
    }

    /// Add `ticks` units of progress
    pub fn tick(&self, ticks: u32) {
        let Some(inner) = &self.inner else {
            return;
        };
        let total = inner.ticks.fetch_add(ticks, Ordering::SeqCst).saturating_add(ticks);
        let pct = percent(total, inner.scale);
        if inner.last.fetch_max(pct, Ordering::SeqCst) >= pct {
            return;
        }
        for call in &inner.targets {
            inner.delivery.progress(call, pct);
        }
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("ProgressSink")
                .field("targets", &inner.targets.len())
                .field("ticks", &inner.ticks.load(Ordering::SeqCst))
                .finish(),
            None => f.write_str("ProgressSink(detached)"),
        }
    }
}
