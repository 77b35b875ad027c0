//! Wire collaborators
//!
//! The engine never looks inside a request or response body. A
//! [`ProtocolCodec`] turns calls into [`WireRequest`]s and responses back
//! into values; a [`Transport`] moves the bytes. Both must report their
//! failures inside the engine's error taxonomy: decode problems as
//! `Parse`, network problems as `Connection`, peer-reported failures as
//! `Api`.

use crate::call::{CallHandle, CallId, Headers};
use crate::delivery::ProgressSink;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// One outgoing exchange
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireRequest {
    /// Wire name for single calls; `None` for batch envelopes
    pub method: Option<String>,
    /// Encoded body
    pub body: Vec<u8>,
    /// MIME type of `body`
    pub content_type: String,
    /// Request headers
    pub headers: Headers,
}

/// One incoming exchange
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WireResponse {
    /// Encoded body
    pub body: Vec<u8>,
    /// Response headers
    pub headers: Headers,
}

/// One decoded member of a batch response, tagged with its call id
#[derive(Debug, Clone, PartialEq)]
pub struct WireResult {
    /// Originating call
    pub id: CallId,
    /// Value or peer-reported error
    pub outcome: Result<Value>,
    /// Per-member headers, if the protocol has any
    pub headers: Headers,
}

impl WireResult {
    /// Successful member
    pub fn ok(id: CallId, value: Value) -> Self {
        Self {
            id,
            outcome: Ok(value),
            headers: Headers::new(),
        }
    }

    /// Failed member
    pub fn err(id: CallId, error: crate::error::RpcError) -> Self {
        Self {
            id,
            outcome: Err(error),
            headers: Headers::new(),
        }
    }
}

/// Encoder/decoder for one wire protocol
pub trait ProtocolCodec: Send + Sync {
    /// Encode a single call
    fn encode(&self, call: &CallHandle) -> Result<WireRequest>;

    /// Encode several calls into one exchange
    fn encode_batch(&self, calls: &[CallHandle]) -> Result<WireRequest>;

    /// Decode the response to a single call
    fn decode(&self, call: &CallHandle, response: &WireResponse) -> Result<Value>;

    /// Decode a batch response into id-tagged member results.
    ///
    /// The result count is not checked here; the engine treats a count
    /// that differs from `calls.len()` as a protocol violation.
    fn decode_batch(&self, calls: &[CallHandle], response: &WireResponse) -> Result<Vec<WireResult>>;
}

/// Byte transport
///
/// Retries, redirects and connection reuse are the transport's concern.
/// The engine bounds every exchange by `budget` on its own as well.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one exchange
    async fn send(&self, request: WireRequest, budget: Duration, progress: &ProgressSink) -> Result<WireResponse>;

    /// Perform one batch exchange
    async fn send_batch(
        &self,
        request: WireRequest,
        budget: Duration,
        progress: &ProgressSink,
    ) -> Result<WireResponse> {
        self.send(request, budget, progress).await
    }
}
