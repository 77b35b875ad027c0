//! Per-call lifecycle state
//!
//! A [`CallHandle`] is the shared view of one logical remote invocation.
//! Workers drive it through `created -> running -> done`, any holder may
//! cancel it, and callers wait on it. State transitions happen under the
//! call's own lock and are monotonic; only [`CallHandle::reset`] rewinds a
//! terminal call so it can be resubmitted.

use crate::cache::ArgKey;
use crate::clock::Clock;
use crate::delivery::{CallCallback, DeliverySender, Event};
use crate::error::{Result, RpcError};
use crate::handlers::ErrorHandlers;
use crate::lifecycle::{Canceller, LifecycleToken};
use crate::method::MethodRef;
use crate::single_flight::SingleFlightRegistry;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

/// Response metadata, keyed by header name
pub type Headers = BTreeMap<String, Vec<String>>;

/// Client-unique call identifier, assigned once at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a call or batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Built, not yet executing
    Created,
    /// Executing or buffered for dispatch
    Running,
    /// Finished with a success or an error
    Done,
    /// Cancelled before finishing
    Cancelled,
}

impl CallState {
    /// Whether no further transition can happen
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Done | CallState::Cancelled)
    }
}

/// Wall-clock timestamps of a call, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTiming {
    /// When the call was built or last reset
    pub created_ms: u64,
    /// When execution began
    pub started_ms: Option<u64>,
    /// When the call became terminal
    pub finished_ms: Option<u64>,
}

impl CallTiming {
    /// Time from start to terminal state
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_ms, self.finished_ms) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

/// Whether a `start` event was served from the result cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// The result came from the cache without touching the wire
    pub cached: bool,
    /// Age of the cached entry
    pub age_ms: u64,
}

impl CacheInfo {
    /// Start of a wire call
    pub fn miss() -> Self {
        Self::default()
    }

    /// Start of a call answered from the cache
    pub fn hit(age_ms: u64) -> Self {
        Self {
            cached: true,
            age_ms,
        }
    }
}

/// Per-call options for asynchronous submission
#[derive(Clone)]
pub struct CallOptions {
    /// Lifecycle callback, invoked on the delivery consumer
    pub callback: Option<Arc<dyn CallCallback>>,
    /// Error handlers consulted before `on_error`
    pub handlers: ErrorHandlers,
    /// Relevance token polled before every event
    pub lifecycle: Option<Arc<dyn LifecycleToken>>,
    /// Whether an error of this call fails its batch
    pub batch_fatal: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            callback: None,
            handlers: ErrorHandlers::new(),
            lifecycle: None,
            batch_fatal: true,
        }
    }
}

impl CallOptions {
    /// Options with no callback
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a lifecycle callback
    pub fn callback(mut self, callback: Arc<dyn CallCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Attach error handlers
    pub fn handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Bind the call to a lifecycle token
    pub fn bound_to(mut self, token: Arc<dyn LifecycleToken>) -> Self {
        self.lifecycle = Some(token);
        self
    }

    /// Keep this call's errors from failing its batch
    pub fn non_fatal(mut self) -> Self {
        self.batch_fatal = false;
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("callback", &self.callback.is_some())
            .field("handlers", &self.handlers)
            .field("lifecycle", &self.lifecycle.is_some())
            .field("batch_fatal", &self.batch_fatal)
            .finish()
    }
}

/// Engine services a call needs to cancel itself
#[derive(Clone)]
pub(crate) struct CallContext {
    pub delivery: DeliverySender,
    pub single_flight: Arc<SingleFlightRegistry>,
    pub clock: Arc<dyn Clock>,
}

struct CallStatus {
    state: CallState,
    outcome: Option<Result<Arc<Value>>>,
    headers: Option<Headers>,
    timing: CallTiming,
    abort: Option<AbortHandle>,
    finish_claimed: bool,
    settled: bool,
}

struct CallInner {
    id: CallId,
    method: MethodRef,
    args: Vec<Value>,
    arg_key: ArgKey,
    batch_fatal: bool,
    quiet: bool,
    callback: Option<Arc<dyn CallCallback>>,
    handlers: ErrorHandlers,
    lifecycle: Option<Arc<dyn LifecycleToken>>,
    status: Mutex<CallStatus>,
    settled_cv: Condvar,
    settled: Notify,
    ctx: CallContext,
}

/// Shared handle to one call
#[derive(Clone)]
pub struct CallHandle {
    inner: Arc<CallInner>,
}

impl CallHandle {
    /// Build a call. Quiet calls (the synchronous path) push no events.
    pub(crate) fn new(
        id: CallId,
        method: MethodRef,
        args: Vec<Value>,
        options: CallOptions,
        quiet: bool,
        ctx: CallContext,
    ) -> Self {
        let arg_key = ArgKey::from_args(&args);
        let timing = CallTiming {
            created_ms: ctx.clock.now_ms(),
            ..CallTiming::default()
        };
        let handle = Self {
            inner: Arc::new(CallInner {
                id,
                method,
                args,
                arg_key,
                batch_fatal: options.batch_fatal,
                quiet,
                callback: options.callback,
                handlers: options.handlers,
                lifecycle: options.lifecycle,
                status: Mutex::new(CallStatus {
                    state: CallState::Created,
                    outcome: None,
                    headers: None,
                    timing,
                    abort: None,
                    finish_claimed: false,
                    settled: false,
                }),
                settled_cv: Condvar::new(),
                settled: Notify::new(),
                ctx,
            }),
        };
        handle.bind_lifecycle();
        handle
    }

    /// Hand the lifecycle token a canceller for this execution
    pub(crate) fn bind_lifecycle(&self) {
        let Some(token) = &self.inner.lifecycle else {
            return;
        };
        let weak: Weak<CallInner> = Arc::downgrade(&self.inner);
        let watched = weak.clone();
        token.bind(Canceller::new(
            move || {
                if let Some(inner) = weak.upgrade() {
                    CallHandle { inner }.cancel();
                }
            },
            move || {
                watched
                    .upgrade()
                    .is_some_and(|inner| !inner.status.lock().state.is_terminal())
            },
        ));
    }

    /// Call identifier
    pub fn id(&self) -> CallId {
        self.inner.id
    }

    /// Resolved method this call invokes
    pub fn method(&self) -> &MethodRef {
        &self.inner.method
    }

    /// Ordered argument values
    pub fn args(&self) -> &[Value] {
        &self.inner.args
    }

    /// Structural key of the arguments
    pub fn arg_key(&self) -> &ArgKey {
        &self.inner.arg_key
    }

    /// Whether this call's error fails its batch
    pub fn is_batch_fatal(&self) -> bool {
        self.inner.batch_fatal
    }

    pub(crate) fn is_quiet(&self) -> bool {
        self.inner.quiet
    }

    pub(crate) fn callback(&self) -> Option<&Arc<dyn CallCallback>> {
        self.inner.callback.as_ref()
    }

    pub(crate) fn handlers(&self) -> &ErrorHandlers {
        &self.inner.handlers
    }

    pub(crate) fn lifecycle(&self) -> Option<&Arc<dyn LifecycleToken>> {
        self.inner.lifecycle.as_ref()
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.inner.status.lock().state
    }

    /// Whether the call finished with a success or an error
    pub fn is_done(&self) -> bool {
        self.state() == CallState::Done
    }

    /// Whether the call was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state() == CallState::Cancelled
    }

    /// Whether the call is executing or buffered for dispatch
    pub fn is_running(&self) -> bool {
        self.state() == CallState::Running
    }

    /// Terminal outcome, once there is one
    pub fn result(&self) -> Option<Result<Arc<Value>>> {
        self.inner.status.lock().outcome.clone()
    }

    /// Response headers, present once the call is done
    pub fn headers(&self) -> Option<Headers> {
        self.inner.status.lock().headers.clone()
    }

    /// Timestamps recorded so far
    pub fn timing(&self) -> CallTiming {
        self.inner.status.lock().timing
    }

    pub(crate) fn set_abort(&self, abort: AbortHandle) {
        let mut status = self.inner.status.lock();
        if status.state.is_terminal() {
            abort.abort();
        } else {
            status.abort = Some(abort);
        }
    }

    /// `created -> running`; false if the call already moved on
    pub(crate) fn mark_running(&self) -> bool {
        let mut status = self.inner.status.lock();
        if status.state != CallState::Created {
            return false;
        }
        status.state = CallState::Running;
        status.timing.started_ms = Some(self.inner.ctx.clock.now_ms());
        true
    }

    /// Record the terminal outcome; false if the call was cancelled first
    pub(crate) fn complete(&self, outcome: Result<Arc<Value>>, headers: Headers) -> bool {
        {
            let mut status = self.inner.status.lock();
            if status.state.is_terminal() {
                return false;
            }
            let now = self.inner.ctx.clock.now_ms();
            status.state = CallState::Done;
            status.outcome = Some(outcome);
            status.headers = Some(headers);
            status.timing.started_ms.get_or_insert(now);
            status.timing.finished_ms = Some(now);
            status.abort = None;
        }
        self.inner
            .ctx
            .single_flight
            .release(self.inner.method.id, self.inner.id);
        true
    }

    /// Mark every callback for the terminal state as delivered and wake waiters
    pub(crate) fn settle(&self) {
        self.inner.status.lock().settled = true;
        self.inner.settled_cv.notify_all();
        self.inner.settled.notify_waiters();
    }

    /// Claim the single `finish` delivery for this call
    pub(crate) fn claim_finish(&self) -> bool {
        let mut status = self.inner.status.lock();
        !std::mem::replace(&mut status.finish_claimed, true)
    }

    /// Cancel the call.
    ///
    /// Sets the call terminal immediately, frees its single-flight slot and
    /// aborts its running task. A `finish` event is still delivered. A no-op
    /// once the call is terminal.
    pub fn cancel(&self) {
        let abort = {
            let mut status = self.inner.status.lock();
            if status.state.is_terminal() {
                return;
            }
            status.state = CallState::Cancelled;
            status.outcome = Some(Err(RpcError::Cancelled));
            status.timing.finished_ms = Some(self.inner.ctx.clock.now_ms());
            status.settled = true;
            status.abort.take()
        };
        self.inner.settled_cv.notify_all();
        self.inner.settled.notify_waiters();
        if let Some(abort) = abort {
            abort.abort();
        }
        self.inner
            .ctx
            .single_flight
            .release(self.inner.method.id, self.inner.id);
        tracing::debug!(call_id = self.inner.id.0, method = %self.inner.method.name, "call cancelled");
        if !self.inner.quiet {
            self.inner.ctx.delivery.push(Event::Finish(self.clone()));
        }
    }

    /// Rewind a terminal call to `created` so it can be resubmitted with
    /// the same id through `Engine::resubmit`.
    pub fn reset(&self) -> Result<()> {
        let mut status = self.inner.status.lock();
        if !status.state.is_terminal() {
            return Err(RpcError::configuration(format!(
                "call {} is still in flight and cannot be reset",
                self.inner.id
            )));
        }
        status.state = CallState::Created;
        status.outcome = None;
        status.headers = None;
        status.abort = None;
        status.finish_claimed = false;
        status.settled = false;
        status.timing = CallTiming {
            created_ms: self.inner.ctx.clock.now_ms(),
            ..CallTiming::default()
        };
        Ok(())
    }

    /// Resolve once the call is done or cancelled and its callbacks ran
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

    /// Blocking variant of [`wait`](Self::wait) for threads outside the runtime
    pub fn wait_blocking(&self) {
        let mut status = self.inner.status.lock();
        while !status.settled {
            self.inner.settled_cv.wait(&mut status);
        }
    }

    /// Whether two handles refer to the same call
    pub fn same_call(&self, other: &CallHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.inner.id)
            .field("method", &self.inner.method.wire_name)
            .field("state", &self.state())
            .finish()
    }
}
