//! Single-flight admission
//!
//! At most one call per method identity is in flight for methods that opt
//! in. The registry is a passive map: calls remove themselves when they
//! complete or are cancelled, and a losing call is cancelled only after the
//! map lock has been released.

use crate::call::{CallHandle, CallId};
use crate::method::{MethodId, SingleFlightMode};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Outcome of [`SingleFlightRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The call may execute
    Admitted,
    /// The call was cancelled in favour of the one in flight
    Rejected,
}

/// Method identity to in-flight call
#[derive(Default)]
pub struct SingleFlightRegistry {
    entries: Mutex<HashMap<MethodId, CallHandle>>,
}

impl SingleFlightRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `call` under `mode`, cancelling the loser of any conflict
    pub fn register(&self, call: &CallHandle, mode: SingleFlightMode) -> Admission {
        let method = call.method().id;
        let loser = {
            let mut entries = self.entries.lock();
            let conflict = entries
                .get(&method)
                .is_some_and(|current| !current.state().is_terminal() && !current.same_call(call));
            match (conflict, mode) {
                (false, _) => {
                    entries.insert(method, call.clone());
                    None
                }
                (true, SingleFlightMode::CancelNew) => Some((call.clone(), Admission::Rejected)),
                (true, SingleFlightMode::CancelOld) => entries
                    .insert(method, call.clone())
                    .map(|old| (old, Admission::Admitted)),
            }
        };

        match loser {
            Some((loser, admission)) => {
                tracing::debug!(
                    call_id = call.id().0,
                    cancelled = loser.id().0,
                    method = %call.method().name,
                    ?mode,
                    "single-flight conflict"
                );
                loser.cancel();
                admission
            }
            None => Admission::Admitted,
        }
    }

    /// Remove the entry for `method` if it still belongs to call `id`
    pub fn release(&self, method: MethodId, id: CallId) {
        let mut entries = self.entries.lock();
        if entries.get(&method).is_some_and(|current| current.id() == id) {
            entries.remove(&method);
        }
    }

    /// Id of the call in flight for `method`, if any
    pub fn in_flight(&self, method: MethodId) -> Option<CallId> {
        self.entries
            .lock()
            .get(&method)
            .filter(|call| !call.state().is_terminal())
            .map(CallHandle::id)
    }
}
