//! Scripted transport
//!
//! Decodes the JSON codec's requests, answers each wire name from a
//! registered script and records every exchange. Knobs cover latency,
//! progress ticks, paused delivery and malformed batch responses.

use crate::codec::{RpcErrorBody, RpcRequest, RpcResponse};
use async_trait::async_trait;
use courier_core::{Headers, ProgressSink, Result, RpcError, Transport, WireRequest, WireResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Scripted answer to one request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Successful value
    Value(Value),
    /// Peer-reported failure
    ApiError {
        /// Peer code
        code: i64,
        /// Peer message
        message: String,
    },
    /// The exchange fails before any response
    ConnectionFailure(String),
    /// The exchange never completes
    Hang,
}

impl Reply {
    /// Successful value
    pub fn value(value: Value) -> Self {
        Reply::Value(value)
    }

    /// Peer-reported failure
    pub fn api_error(code: i64, message: impl Into<String>) -> Self {
        Reply::ApiError {
            code,
            message: message.into(),
        }
    }

    /// Network failure
    pub fn connection_failure(message: impl Into<String>) -> Self {
        Reply::ConnectionFailure(message.into())
    }
}

type Script = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// Transport answering from per-method scripts
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    exchanges: Mutex<Vec<Vec<String>>>,
    sends: AtomicUsize,
    batch_sends: AtomicUsize,
    detached_sinks: AtomicUsize,
    latency: Option<Duration>,
    ticks: Vec<u32>,
    drop_last_batch_result: bool,
    reverse_batch_results: bool,
    open: watch::Sender<bool>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("scripts", &self.scripts.lock().len())
            .field("sends", &self.sends())
            .field("batch_sends", &self.batch_sends())
            .finish_non_exhaustive()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Transport with no scripts; unknown methods get API error -32601
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self {
            scripts: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(Vec::new()),
            sends: AtomicUsize::new(0),
            batch_sends: AtomicUsize::new(0),
            detached_sinks: AtomicUsize::new(0),
            latency: None,
            ticks: Vec::new(),
            drop_last_batch_result: false,
            reverse_batch_results: false,
            open,
        }
    }

    /// Delay every exchange
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Report these progress ticks during every exchange
    pub fn with_ticks(mut self, ticks: Vec<u32>) -> Self {
        self.ticks = ticks;
        self
    }

    /// Omit the last member of every batch response
    pub fn dropping_last_batch_result(mut self) -> Self {
        self.drop_last_batch_result = true;
        self
    }

    /// Return batch members in reverse request order
    pub fn reversing_batch_results(mut self) -> Self {
        self.reverse_batch_results = true;
        self
    }

    /// Script the answer for `wire_name`, replacing any earlier script
    pub fn respond(&self, wire_name: &str, script: impl Fn(&Value) -> Reply + Send + Sync + 'static) {
        self.scripts.lock().insert(wire_name.to_owned(), Arc::new(script));
    }

    /// Hold every exchange until [`resume`](Self::resume)
    pub fn pause(&self) {
        self.open.send_replace(false);
    }

    /// Release held exchanges
    pub fn resume(&self) {
        self.open.send_replace(true);
    }

    /// Number of single exchanges performed
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Number of batch exchanges performed
    pub fn batch_sends(&self) -> usize {
        self.batch_sends.load(Ordering::SeqCst)
    }

    /// Number of exchanges handed a progress sink that reports nowhere
    pub fn detached_sinks(&self) -> usize {
        self.detached_sinks.load(Ordering::SeqCst)
    }

    /// Wire names of every exchange, in request order
    pub fn exchanges(&self) -> Vec<Vec<String>> {
        self.exchanges.lock().clone()
    }

    fn answer(&self, request: &RpcRequest) -> Reply {
        let script = self.scripts.lock().get(&request.method).cloned();
        match script {
            Some(script) => script(&request.params),
            None => {
                debug!(method = %request.method, "no script registered");
                Reply::api_error(-32601, format!("method not found: {}", request.method))
            }
        }
    }

    async fn exchange_prelude(&self, progress: &ProgressSink) {
        if progress.is_detached() {
            self.detached_sinks.fetch_add(1, Ordering::SeqCst);
        }
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        for ticks in &self.ticks {
            progress.tick(*ticks);
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn response(request: &RpcRequest, reply: Reply) -> RpcResponse {
        match reply {
            Reply::Value(value) => RpcResponse {
                id: request.id,
                result: Some(value),
                error: None,
            },
            Reply::ApiError { code, message } => RpcResponse {
                id: request.id,
                result: None,
                error: Some(RpcErrorBody { code, message }),
            },
            Reply::ConnectionFailure(_) | Reply::Hang => RpcResponse {
                id: request.id,
                result: None,
                error: None,
            },
        }
    }
}

fn decode_request<T: serde::de::DeserializeOwned>(request: &WireRequest) -> Result<T> {
    serde_json::from_slice(&request.body).map_err(|e| RpcError::connection(format!("peer rejected request: {e}")))
}

async fn fail_or_hang(reply: &Reply) -> Result<()> {
    match reply {
        Reply::ConnectionFailure(message) => Err(RpcError::connection(message.clone())),
        Reply::Hang => {
            std::future::pending::<()>().await;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: WireRequest, _budget: Duration, progress: &ProgressSink) -> Result<WireResponse> {
        let request: RpcRequest = decode_request(&request)?;
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.exchanges.lock().push(vec![request.method.clone()]);
        self.exchange_prelude(progress).await;

        let reply = self.answer(&request);
        fail_or_hang(&reply).await?;
        let mut headers = Headers::new();
        headers.insert("x-script".to_owned(), vec![request.method.clone()]);
        Ok(WireResponse {
            body: serde_json::to_vec(&Self::response(&request, reply))?,
            headers,
        })
    }

    async fn send_batch(&self, request: WireRequest, _budget: Duration, progress: &ProgressSink) -> Result<WireResponse> {
        let requests: Vec<RpcRequest> = decode_request(&request)?;
        self.batch_sends.fetch_add(1, Ordering::SeqCst);
        self.exchanges
            .lock()
            .push(requests.iter().map(|r| r.method.clone()).collect());
        self.exchange_prelude(progress).await;

        let mut responses = Vec::with_capacity(requests.len());
        for request in &requests {
            let reply = self.answer(request);
            fail_or_hang(&reply).await?;
            responses.push(Self::response(request, reply));
        }
        if self.reverse_batch_results {
            responses.reverse();
        }
        if self.drop_last_batch_result {
            responses.pop();
        }
        Ok(WireResponse {
            body: serde_json::to_vec(&responses)?,
            headers: Headers::new(),
        })
    }
}
