//! Matching wire results back to calls
//!
//! Results are paired with calls by id, never by position. A result count
//! that differs from the dispatched count is a protocol violation and fails
//! every dispatched call with the same `Parse` error. Otherwise each call
//! gets its own outcome: a wire error may be replaced by the call's reserved
//! cache value, and a wire success is written to the cache before the
//! caller's copy is taken.

use crate::cache::{CacheHit, ResultCache};
use crate::call::{CallHandle, CallId, Headers};
use crate::error::{Result, RpcError};
use crate::method::ReturnShape;
use crate::protocol::WireResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A call that went on the wire, with its fallback value if it has one
pub(crate) struct Dispatched {
    pub call: CallHandle,
    pub reserve: Option<CacheHit>,
}

/// Final outcome of one call
pub(crate) struct Settled {
    pub call: CallHandle,
    pub outcome: Result<Arc<Value>>,
    pub headers: Headers,
}

pub(crate) struct Reconciled {
    /// One entry per dispatched call, sorted by call id
    pub settled: Vec<Settled>,
    /// Set when the response broke the protocol contract
    pub violation: Option<RpcError>,
}

/// Cache a fresh wire value and return the caller's copy
pub(crate) async fn accept_success(
    call: &CallHandle,
    value: Value,
    headers: &Headers,
    cache: &ResultCache,
) -> Arc<Value> {
    let method = call.method();
    let value = match method.return_shape {
        ReturnShape::Unit => Value::Null,
        _ => value,
    };
    let value = Arc::new(value);
    if method.caches_results() {
        cache
            .put(method, call.arg_key(), value.clone(), headers.clone())
            .await;
        cache.isolate(value)
    } else {
        value
    }
}

/// Replace `error` with the reserved cache value when the call's policy
/// allows it; otherwise prefix the error with the call's wire name.
pub(crate) fn fallback(call: &CallHandle, reserve: Option<CacheHit>, error: RpcError) -> (Result<Arc<Value>>, Headers) {
    let absorbs = call
        .method()
        .cache
        .is_some_and(|policy| policy.fallback.absorbs(&error));
    match reserve {
        Some(hit) if absorbs => {
            tracing::debug!(
                call_id = call.id().0,
                method = %call.method().wire_name,
                error = %error,
                age_ms = hit.age_ms,
                "serving cached value after wire error"
            );
            (Ok(hit.value), hit.headers)
        }
        _ => (Err(error.with_context(&call.method().wire_name)), Headers::new()),
    }
}

fn describe(result: &WireResult) -> String {
    match &result.outcome {
        Ok(value) => value.to_string(),
        Err(error) => error.to_string(),
    }
}

/// Pair `wire` with `dispatched` and settle every call
pub(crate) async fn reconcile(
    mut dispatched: Vec<Dispatched>,
    wire: Result<Vec<WireResult>>,
    cache: &ResultCache,
) -> Reconciled {
    dispatched.sort_by_key(|d| d.call.id());

    let results = match wire {
        Ok(results) => results,
        Err(error) => dispatched
            .iter()
            .map(|d| WireResult::err(d.call.id(), error.clone()))
            .collect(),
    };

    if results.len() != dispatched.len() {
        let requests: Vec<&str> = dispatched
            .iter()
            .map(|d| d.call.method().wire_name.as_str())
            .collect();
        let responses: Vec<String> = results.iter().map(describe).collect();
        let violation = RpcError::parse(format!(
            "wrong server response: expected {} batch responses, got {}; requests: [{}]; responses: [{}]",
            dispatched.len(),
            results.len(),
            requests.join(", "),
            responses.join(", ")
        ));
        tracing::warn!(
            expected = dispatched.len(),
            received = results.len(),
            "batch response count mismatch"
        );
        let settled = dispatched
            .into_iter()
            .map(|d| Settled {
                call: d.call,
                outcome: Err(violation.clone()),
                headers: Headers::new(),
            })
            .collect();
        return Reconciled {
            settled,
            violation: Some(violation),
        };
    }

    let mut by_id: HashMap<CallId, WireResult> = results.into_iter().map(|r| (r.id, r)).collect();
    let mut settled = Vec::with_capacity(dispatched.len());
    for Dispatched { call, reserve } in dispatched {
        let (outcome, headers) = match by_id.remove(&call.id()) {
            Some(WireResult {
                outcome: Ok(value),
                headers,
                ..
            }) => {
                let value = accept_success(&call, value, &headers, cache).await;
                (Ok(value), headers)
            }
            Some(WireResult {
                outcome: Err(error),
                ..
            }) => fallback(&call, reserve, error),
            None => {
                tracing::warn!(call_id = call.id().0, "batch response has no result for call");
                let error = RpcError::parse(format!("batch response has no result for call {}", call.id()));
                fallback(&call, reserve, error)
            }
        };
        settled.push(Settled {
            call,
            outcome,
            headers,
        });
    }

    Reconciled {
        settled,
        violation: None,
    }
}
