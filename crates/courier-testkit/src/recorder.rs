//! Recording callbacks and observers

use courier_core::{
    BatchCallback, BatchHandle, CacheInfo, CallCallback, CallHandle, CallId, ErrorObserver, RpcError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// One event seen by a [`RecordingCallback`]
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// `on_start`
    Start {
        /// Whether the cache answered
        cached: bool,
    },
    /// `on_progress`
    Progress(u8),
    /// `on_success`
    Success(Value),
    /// `on_error`
    Error(RpcError),
    /// `on_finish`
    Finish,
}

impl Observed {
    /// Short label for sequence assertions
    pub fn label(&self) -> &'static str {
        match self {
            Observed::Start { .. } => "start",
            Observed::Progress(_) => "progress",
            Observed::Success(_) => "success",
            Observed::Error(_) => "error",
            Observed::Finish => "finish",
        }
    }
}

/// Call callback that records every event per call id
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<(CallId, Observed)>>,
}

impl RecordingCallback {
    /// New shared recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: &CallHandle, event: Observed) {
        self.events.lock().push((call.id(), event));
    }

    /// Events of one call, in delivery order
    pub fn events(&self, id: CallId) -> Vec<Observed> {
        self.events
            .lock()
            .iter()
            .filter(|(call, _)| *call == id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Event labels of one call, progress omitted
    pub fn labels(&self, id: CallId) -> Vec<&'static str> {
        self.events(id)
            .iter()
            .filter(|event| !matches!(event, Observed::Progress(_)))
            .map(Observed::label)
            .collect()
    }

    /// Every event of every call
    pub fn all(&self) -> Vec<(CallId, Observed)> {
        self.events.lock().clone()
    }
}

impl CallCallback for RecordingCallback {
    fn on_start(&self, call: &CallHandle, cache: CacheInfo) {
        self.record(call, Observed::Start { cached: cache.cached });
    }

    fn on_progress(&self, call: &CallHandle, percent: u8) {
        self.record(call, Observed::Progress(percent));
    }

    fn on_success(&self, call: &CallHandle, value: &Arc<Value>) {
        self.record(call, Observed::Success(Value::clone(value)));
    }

    fn on_error(&self, call: &CallHandle, error: &RpcError) {
        self.record(call, Observed::Error(error.clone()));
    }

    fn on_finish(&self, call: &CallHandle) {
        self.record(call, Observed::Finish);
    }
}

/// One event seen by a [`RecordingBatchCallback`]
#[derive(Debug, Clone, PartialEq)]
pub enum BatchObserved {
    /// `on_start`
    Start,
    /// `on_progress`
    Progress(u8),
    /// `on_success`
    Success(Vec<Value>),
    /// `on_error`
    Error(RpcError),
    /// `on_finish`
    Finish,
}

/// Batch callback that records every event
#[derive(Debug, Default)]
pub struct RecordingBatchCallback {
    events: Mutex<Vec<BatchObserved>>,
}

impl RecordingBatchCallback {
    /// New shared recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorded events in delivery order
    pub fn events(&self) -> Vec<BatchObserved> {
        self.events.lock().clone()
    }

    /// Recorded progress percentages
    pub fn progress(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BatchObserved::Progress(pct) => Some(*pct),
                _ => None,
            })
            .collect()
    }
}

impl BatchCallback for RecordingBatchCallback {
    fn on_start(&self, _batch: &BatchHandle) {
        self.events.lock().push(BatchObserved::Start);
    }

    fn on_progress(&self, _batch: &BatchHandle, percent: u8) {
        self.events.lock().push(BatchObserved::Progress(percent));
    }

    fn on_success(&self, _batch: &BatchHandle, values: &[Arc<Value>]) {
        let values = values.iter().map(|v| Value::clone(v)).collect();
        self.events.lock().push(BatchObserved::Success(values));
    }

    fn on_error(&self, _batch: &BatchHandle, error: &RpcError) {
        self.events.lock().push(BatchObserved::Error(error.clone()));
    }

    fn on_finish(&self, _batch: &BatchHandle) {
        self.events.lock().push(BatchObserved::Finish);
    }
}

/// Error observer that records `(call id, error)` pairs
#[derive(Debug, Default)]
pub struct RecordingObserver {
    errors: Mutex<Vec<(CallId, RpcError)>>,
}

impl RecordingObserver {
    /// New shared observer
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Recorded errors
    pub fn errors(&self) -> Vec<(CallId, RpcError)> {
        self.errors.lock().clone()
    }
}

impl ErrorObserver for RecordingObserver {
    fn on_error(&self, error: &RpcError, call: &CallHandle) {
        self.errors.lock().push((call.id(), error.clone()));
    }
}

/// Assert `events` is a prefix-consistent subsequence of
/// `start, progress*, (success | error), finish`.
pub fn assert_lifecycle_order(events: &[Observed]) {
    // 0 = before start, 1 = started, 2 = outcome seen, 3 = finished
    let mut stage = 0u8;
    for event in events {
        let next = match event {
            Observed::Start { .. } => 1,
            Observed::Progress(_) => 1,
            Observed::Success(_) | Observed::Error(_) => 2,
            Observed::Finish => 3,
        };
        let repeatable = matches!(event, Observed::Progress(_));
        assert!(
            next > stage || (repeatable && next == stage),
            "event {:?} out of order in {:?}",
            event,
            events
        );
        stage = next;
    }
}
