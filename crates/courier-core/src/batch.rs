//! Batch coordination
//!
//! Calls can share one wire exchange in two ways. A manual [`Batch`]
//! buffers calls until [`Batch::flush`]. With an automatic window
//! configured, the first asynchronous call opens a buffer and a timer;
//! every call submitted before the timer fires joins it. A window that
//! closes with a single live call runs that call on its own.
//!
//! Dispatch drops cancelled members, answers clean cache hits without the
//! wire, orders the rest by priority and weight, and reconciles the
//! response. Member events and batch progress are queued as each member
//! settles; the batch's own outcome follows the last member.

use crate::call::{CacheInfo, CallHandle, CallOptions, CallState};
use crate::delivery::{percent, BatchCallback, DeliverySender, Event, ProgressSink};
use crate::engine::Shared;
use crate::error::{Result, RpcError};
use crate::handlers::ErrorHandlers;
use crate::lifecycle::{Canceller, LifecycleToken};
use crate::method::{CallMode, FallbackMode, MethodRef};
use crate::reconcile::{reconcile, Dispatched};
use crate::schedule::{batch_timeout, order_for_dispatch};
use crate::single_flight::Admission;
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Client-unique batch identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(pub u64);

/// Options for one batch
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Aggregate callback
    pub callback: Option<Arc<dyn BatchCallback>>,
    /// Handlers for the batch error
    pub handlers: ErrorHandlers,
    /// Relevance token polled before every batch event
    pub lifecycle: Option<Arc<dyn LifecycleToken>>,
}

impl BatchOptions {
    /// Options with no callback
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an aggregate callback
    pub fn callback(mut self, callback: Arc<dyn BatchCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Attach handlers for the batch error
    pub fn handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Bind the batch to a lifecycle token
    pub fn bound_to(mut self, token: Arc<dyn LifecycleToken>) -> Self {
        self.lifecycle = Some(token);
        self
    }
}

/// Aggregate outcome of a batch
pub type BatchOutcome = Result<Arc<[Arc<Value>]>>;

struct BatchStatus {
    state: CallState,
    outcome: Option<BatchOutcome>,
    finish_claimed: bool,
    settled: bool,
}

struct BatchInner {
    id: BatchId,
    callback: Option<Arc<dyn BatchCallback>>,
    handlers: ErrorHandlers,
    lifecycle: Option<Arc<dyn LifecycleToken>>,
    members: Vec<CallHandle>,
    status: Mutex<BatchStatus>,
    settled_cv: Condvar,
    settled: Notify,
    delivery: DeliverySender,
}

/// Shared handle to one dispatched batch
#[derive(Clone)]
pub struct BatchHandle {
    inner: Arc<BatchInner>,
}

impl BatchHandle {
    pub(crate) fn new(id: BatchId, options: BatchOptions, members: Vec<CallHandle>, delivery: DeliverySender) -> Self {
        let handle = Self {
            inner: Arc::new(BatchInner {
                id,
                callback: options.callback,
                handlers: options.handlers,
                lifecycle: options.lifecycle,
                members,
                status: Mutex::new(BatchStatus {
                    state: CallState::Created,
                    outcome: None,
                    finish_claimed: false,
                    settled: false,
                }),
                settled_cv: Condvar::new(),
                settled: Notify::new(),
                delivery,
            }),
        };
        if let Some(token) = &handle.inner.lifecycle {
            let weak: Weak<BatchInner> = Arc::downgrade(&handle.inner);
            let watched = weak.clone();
            token.bind(Canceller::new(
                move || {
                    if let Some(inner) = weak.upgrade() {
                        BatchHandle { inner }.cancel();
                    }
                },
                move || {
                    watched
                        .upgrade()
                        .is_some_and(|inner| !inner.status.lock().state.is_terminal())
                },
            ));
        }
        handle
    }

    /// Batch identifier
    pub fn id(&self) -> BatchId {
        self.inner.id
    }

    /// Calls submitted to this batch, in submission order
    pub fn members(&self) -> &[CallHandle] {
        &self.inner.members
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.inner.status.lock().state
    }

    /// Whether the batch finished
    pub fn is_done(&self) -> bool {
        self.state() == CallState::Done
    }

    /// Whether the batch was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state() == CallState::Cancelled
    }

    /// Aggregate outcome: member values ordered by call id, or the first
    /// batch-fatal error
    pub fn result(&self) -> Option<BatchOutcome> {
        self.inner.status.lock().outcome.clone()
    }

    pub(crate) fn callback(&self) -> Option<&Arc<dyn BatchCallback>> {
        self.inner.callback.as_ref()
    }

    pub(crate) fn handlers(&self) -> &ErrorHandlers {
        &self.inner.handlers
    }

    pub(crate) fn lifecycle(&self) -> Option<&Arc<dyn LifecycleToken>> {
        self.inner.lifecycle.as_ref()
    }

    fn mark_running(&self) -> bool {
        let mut status = self.inner.status.lock();
        if status.state != CallState::Created {
            return false;
        }
        status.state = CallState::Running;
        true
    }

    fn complete(&self, outcome: BatchOutcome) -> bool {
        let mut status = self.inner.status.lock();
        if status.state.is_terminal() {
            return false;
        }
        status.state = CallState::Done;
        status.outcome = Some(outcome);
        true
    }

    pub(crate) fn settle(&self) {
        self.inner.status.lock().settled = true;
        self.inner.settled_cv.notify_all();
        self.inner.settled.notify_waiters();
    }

    pub(crate) fn claim_finish(&self) -> bool {
        let mut status = self.inner.status.lock();
        !std::mem::replace(&mut status.finish_claimed, true)
    }

    /// Cancel the batch and every member call.
    ///
    /// Members already on the wire are not retracted; their results are
    /// simply not delivered. The batch still receives its `finish`.
    pub fn cancel(&self) {
        {
            let mut status = self.inner.status.lock();
            if status.state.is_terminal() {
                return;
            }
            status.state = CallState::Cancelled;
            status.outcome = Some(Err(RpcError::Cancelled));
            status.settled = true;
        }
        self.inner.settled_cv.notify_all();
        self.inner.settled.notify_waiters();
        for call in &self.inner.members {
            call.cancel();
        }
        debug!(batch_id = self.inner.id.0, "batch cancelled");
        self.inner.delivery.push(Event::BatchFinish(self.clone()));
    }

    /// Resolve once the batch is done or cancelled and its callbacks ran
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.status.lock().settled {
                return;
            }
            notified.await;
        }
    }

    /// Blocking variant of [`wait`](Self::wait)
    pub fn wait_blocking(&self) {
        let mut status = self.inner.status.lock();
        while !status.settled {
            self.inner.settled_cv.wait(&mut status);
        }
    }
}

impl fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchHandle")
            .field("id", &self.inner.id)
            .field("members", &self.inner.members.len())
            .field("state", &self.state())
            .finish()
    }
}

/// Manually flushed batch
///
/// Calls still buffered when the batch is dropped without a flush are
/// cancelled.
pub struct Batch {
    shared: Arc<Shared>,
    calls: Vec<CallHandle>,
}

impl Batch {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            calls: Vec::new(),
        }
    }

    /// Buffer a call. Single-flight admission runs now; a rejected call is
    /// returned already cancelled and is not buffered.
    pub fn submit(&mut self, method: &MethodRef, args: Vec<Value>, options: CallOptions) -> Result<CallHandle> {
        let method = self.shared.registered(method)?;
        if method.mode == CallMode::Sync {
            return Err(RpcError::configuration(format!(
                "{}::{} is synchronous and cannot be batched",
                method.interface, method.name
            )));
        }
        let call = self.shared.new_call(method, args, options, false);
        if self.shared.admit(&call) == Admission::Rejected {
            return Ok(call);
        }
        call.mark_running();
        self.calls.push(call.clone());
        Ok(call)
    }

    /// Number of buffered calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Dispatch the buffered calls as one batch
    pub fn flush(mut self, options: BatchOptions) -> BatchHandle {
        let members = std::mem::take(&mut self.calls);
        let batch = BatchHandle::new(
            self.shared.next_batch_id(),
            options,
            members.clone(),
            self.shared.delivery.clone(),
        );
        self.shared.spawn_batch(batch.clone(), members);
        batch
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        for call in self.calls.drain(..) {
            call.cancel();
        }
    }
}

/// Time-windowed buffer for automatic batching
pub(crate) struct AutoBatcher {
    window: Duration,
    pending: Mutex<Option<Vec<CallHandle>>>,
}

impl AutoBatcher {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(None),
        }
    }

    /// Add `call` to the open window, opening one if needed
    pub(crate) fn enqueue(&self, shared: &Arc<Shared>, call: CallHandle) {
        let opened = {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(buffer) => {
                    buffer.push(call);
                    false
                }
                None => {
                    *pending = Some(vec![call]);
                    true
                }
            }
        };
        if opened {
            let window = self.window;
            let timer_shared = shared.clone();
            shared.pool.spawn_unbounded(async move {
                tokio::time::sleep(window).await;
                close_window(timer_shared);
            });
        }
    }

    /// Close the window and take its calls
    pub(crate) fn take(&self) -> Vec<CallHandle> {
        self.pending.lock().take().unwrap_or_default()
    }
}

fn close_window(shared: Arc<Shared>) {
    let Some(auto) = &shared.auto else {
        return;
    };
    let mut calls: Vec<CallHandle> = auto.take().into_iter().filter(|c| !c.is_cancelled()).collect();
    match calls.len() {
        0 => {}
        1 => {
            if let Some(call) = calls.pop() {
                debug!(call_id = call.id().0, "batch window closed with one call; running it alone");
                shared.spawn_single(call);
            }
        }
        n => {
            let batch = BatchHandle::new(
                shared.next_batch_id(),
                BatchOptions::default(),
                calls.clone(),
                shared.delivery.clone(),
            );
            debug!(batch_id = batch.id().0, members = n, "batch window closed");
            shared.spawn_batch(batch, calls);
        }
    }
}

fn push_progress(shared: &Shared, batch: &BatchHandle, resolved: usize, total: usize) {
    let pct = if total == 0 {
        100
    } else {
        percent(
            u32::try_from(resolved).unwrap_or(u32::MAX),
            u32::try_from(total).unwrap_or(u32::MAX),
        )
    };
    shared.delivery.push(Event::BatchProgress(batch.clone(), pct));
}

fn aggregate(resolved: &mut [CallHandle], violation: Option<RpcError>) -> BatchOutcome {
    if let Some(violation) = violation {
        return Err(violation);
    }
    resolved.sort_by_key(CallHandle::id);
    let outcomes: Vec<Result<Arc<Value>>> = resolved
        .iter()
        .map(|call| call.result().unwrap_or(Err(RpcError::Cancelled)))
        .collect();
    let fatal = resolved
        .iter()
        .zip(&outcomes)
        .find_map(|(call, outcome)| match outcome {
            Err(error) if call.is_batch_fatal() && !error.is_cancelled() => Some(error.clone()),
            _ => None,
        });
    if let Some(error) = fatal {
        return Err(error);
    }
    Ok(outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap_or_else(|_| Arc::new(Value::Null)))
        .collect())
}

/// Run one batch on a worker
pub(crate) async fn dispatch(shared: Arc<Shared>, batch: BatchHandle, members: Vec<CallHandle>) {
    if !batch.mark_running() {
        return;
    }
    shared.delivery.push(Event::BatchStart(batch.clone()));

    let members: Vec<CallHandle> = members
        .into_iter()
        .filter(|call| !call.is_cancelled() && (call.is_running() || call.mark_running()))
        .collect();
    let total = members.len();
    let mut resolved: Vec<CallHandle> = Vec::with_capacity(total);

    // Clean cache hits never reach the wire; fallback hits are held in reserve.
    let mut dispatched = Vec::with_capacity(total);
    for call in members {
        let method = call.method().clone();
        match shared.cache.get(&method, call.arg_key()).await {
            Some(hit) if method.cache.map(|p| p.fallback) == Some(FallbackMode::Never) => {
                shared.delivery.start(&call, CacheInfo::hit(hit.age_ms));
                shared.finish(&call, Ok(hit.value), hit.headers);
                resolved.push(call);
                push_progress(&shared, &batch, resolved.len(), total);
            }
            reserve => dispatched.push(Dispatched { call, reserve }),
        }
    }

    let mut violation = None;
    if dispatched.is_empty() {
        if total == 0 {
            push_progress(&shared, &batch, 0, 0);
        }
    } else {
        for d in &dispatched {
            shared.delivery.start(&d.call, CacheInfo::miss());
        }
        let mut calls: Vec<CallHandle> = dispatched.iter().map(|d| d.call.clone()).collect();
        order_for_dispatch(&mut calls, &shared.stats);
        let budget_ms = batch_timeout(&calls, shared.config.batch_timeout_mode);
        debug!(
            batch_id = batch.id().0,
            members = calls.len(),
            cached = resolved.len(),
            budget_ms,
            "dispatching batch"
        );
        let sink = ProgressSink::new(calls.clone(), shared.config.progress_ticks, shared.delivery.clone());
        let wire = shared.exchange_batch(&calls, budget_ms, &sink).await;

        let reconciled = reconcile(dispatched, wire, &shared.cache).await;
        violation = reconciled.violation;
        for settled in reconciled.settled {
            shared.finish(&settled.call, settled.outcome, settled.headers);
            resolved.push(settled.call);
            push_progress(&shared, &batch, resolved.len(), total);
        }
    }

    let outcome = aggregate(&mut resolved, violation);
    debug!(batch_id = batch.id().0, ok = outcome.is_ok(), "batch finished");
    if batch.complete(outcome) {
        shared.delivery.push(Event::BatchOutcome(batch));
    }
}
