//! Weighted scheduling and the bounded worker pool

use crate::call::CallHandle;
use crate::config::BatchTimeoutMode;
use crate::method::ResolvedMethod;
use crate::stats::LatencyStats;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};

/// Expected cost of one call of `method`: its mean latency, or half its
/// timeout when nothing has been observed yet.
pub fn weight(method: &ResolvedMethod, stats: &LatencyStats) -> u64 {
    match stats.mean(&method.wire_name) {
        Some(mean) => mean.max(1),
        None => method.timeout_ms / 2,
    }
}

/// Order calls for one batch: high priority first, then heavier first.
/// Equal keys keep their submission order.
pub fn order_for_dispatch(calls: &mut [CallHandle], stats: &LatencyStats) {
    calls.sort_by_cached_key(|call| {
        let method = call.method();
        (!method.high_priority, std::cmp::Reverse(weight(method, stats)))
    });
}

/// Timeout budget of a batch
pub fn batch_timeout(calls: &[CallHandle], mode: BatchTimeoutMode) -> u64 {
    let timeouts = calls.iter().map(|call| call.method().timeout_ms);
    match mode {
        BatchTimeoutMode::Sum => timeouts.fold(0u64, u64::saturating_add),
        BatchTimeoutMode::Max => timeouts.max().unwrap_or(0),
    }
}

/// Tracks spawned work so shutdown can abort it
#[derive(Debug, Default)]
pub(crate) struct TaskRegistry {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRegistry {
    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    fn live(&self) -> usize {
        self.handles.lock().iter().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

/// Bounded pool: every unit of work holds one permit while it runs
pub(crate) struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    tasks: TaskRegistry,
}

impl WorkerPool {
    pub(crate) fn new(runtime: Handle, workers: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(workers)),
            tasks: TaskRegistry::default(),
        }
    }

    /// Run `work` once a worker is free
    pub(crate) fn spawn<F>(&self, work: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let handle = self.runtime.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
        let abort = handle.abort_handle();
        self.tasks.track(handle);
        abort
    }

    /// Run `work` without taking a worker (batch window timers)
    pub(crate) fn spawn_unbounded<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.runtime.spawn(work);
        self.tasks.track(handle);
    }

    /// Number of tracked tasks still running
    pub(crate) fn live_tasks(&self) -> usize {
        self.tasks.live()
    }

    /// Refuse new permits and abort every tracked task
    pub(crate) fn shutdown(&self) {
        self.permits.close();
        self.tasks.shutdown();
    }
}
