//! JSON-RPC style codec
//!
//! Requests are `{"id", "method", "params"}` objects; batches are arrays of
//! them. Responses carry either `result` or `error: {code, message}`.
//! Parameters are sent by name when the method declares names for every
//! argument.

use courier_core::{
    CallHandle, CallId, Headers, ProtocolCodec, Result, RpcError, WireRequest, WireResponse, WireResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Content type of every request
pub const CONTENT_TYPE: &str = "application/json";

/// One request object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Call id
    pub id: u64,
    /// Wire name
    pub method: String,
    /// Positional array or named object
    pub params: Value,
}

/// Error member of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    /// Peer-defined code
    pub code: i64,
    /// Peer message
    pub message: String,
}

/// One response object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the request answered
    pub id: u64,
    /// Value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    fn into_outcome(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(RpcError::api(error.code, error.message)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Codec for the scripted transport
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    fn request(call: &CallHandle) -> RpcRequest {
        let method = call.method();
        let params = if !method.param_names.is_empty() && method.param_names.len() == call.args().len() {
            let named: Map<String, Value> = method
                .param_names
                .iter()
                .cloned()
                .zip(call.args().iter().cloned())
                .collect();
            Value::Object(named)
        } else {
            Value::Array(call.args().to_vec())
        };
        RpcRequest {
            id: call.id().0,
            method: method.wire_name.clone(),
            params,
        }
    }
}

impl ProtocolCodec for JsonCodec {
    fn encode(&self, call: &CallHandle) -> Result<WireRequest> {
        let request = Self::request(call);
        Ok(WireRequest {
            method: Some(request.method.clone()),
            body: serde_json::to_vec(&request)?,
            content_type: CONTENT_TYPE.to_owned(),
            headers: Headers::new(),
        })
    }

    fn encode_batch(&self, calls: &[CallHandle]) -> Result<WireRequest> {
        let requests: Vec<RpcRequest> = calls.iter().map(Self::request).collect();
        Ok(WireRequest {
            method: None,
            body: serde_json::to_vec(&requests)?,
            content_type: CONTENT_TYPE.to_owned(),
            headers: Headers::new(),
        })
    }

    fn decode(&self, _call: &CallHandle, response: &WireResponse) -> Result<Value> {
        let response: RpcResponse = serde_json::from_slice(&response.body)?;
        response.into_outcome()
    }

    fn decode_batch(&self, _calls: &[CallHandle], response: &WireResponse) -> Result<Vec<WireResult>> {
        let responses: Vec<RpcResponse> = serde_json::from_slice(&response.body)?;
        Ok(responses
            .into_iter()
            .map(|response| {
                let id = CallId(response.id);
                WireResult {
                    id,
                    outcome: response.into_outcome(),
                    headers: Headers::new(),
                }
            })
            .collect())
    }
}
