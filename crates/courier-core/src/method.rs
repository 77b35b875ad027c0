//! Static method configuration
//!
//! Each remote API is described once by an [`ApiSpec`]: the methods it
//! exposes and, per method, timeout, priority, cache and single-flight
//! policy. Specs are resolved against the [`EngineConfig`] defaults when the
//! engine is built; the resulting [`ResolvedMethod`]s are shared by every
//! call and never change afterwards.

use crate::config::EngineConfig;
use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identity of a remote method
///
/// Derived from the declaring interface and the method signature, never
/// from the display or wire name, so renaming the wire endpoint keeps
/// cached results and single-flight entries addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(pub u64);

impl MethodId {
    /// Derive the identity of `interface::name(signature)`
    pub fn derive(interface: &str, name: &str, signature: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(interface.as_bytes());
        hasher.update(b"::");
        hasher.update(name.as_bytes());
        hasher.update(b"(");
        hasher.update(signature.as_bytes());
        hasher.update(b")");
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        Self(u64::from_be_bytes(prefix))
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Whether a method is invoked inline or through a call handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// `Engine::call`: the caller waits for the value
    Sync,
    /// `Engine::submit`: the caller receives a handle immediately
    Async,
}

/// Declared shape of a method's result, passed to the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnShape {
    /// No value; never cached
    Unit,
    /// Structured JSON value
    Json,
    /// Raw text body
    Text,
    /// Raw byte body
    Bytes,
}

/// Which cache tiers a method's results live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceLevel {
    /// In-memory tier only
    MemoryOnly,
    /// In-memory tier backed by the durable store
    Durable,
}

/// When a cached value may stand in for a failed wire call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Cache hits are served directly; the wire is skipped
    Never,
    /// The wire is always called; the cached value replaces connection errors
    OnConnectionError,
    /// The wire is always called; the cached value replaces any error
    OnAnyError,
}

impl FallbackMode {
    /// Whether a reserved cache value should replace `error`
    pub fn absorbs(self, error: &RpcError) -> bool {
        match self {
            FallbackMode::Never => false,
            FallbackMode::OnConnectionError => error.is_connection(),
            FallbackMode::OnAnyError => !error.is_cancelled(),
        }
    }
}

/// Conflict policy for calls sharing a method identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleFlightMode {
    /// Reject and cancel the incoming call
    CancelNew,
    /// Cancel the in-flight call and admit the incoming one
    CancelOld,
}

/// Cache policy as declared on a method; unset fields use client defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Memory TTL in milliseconds (0 = never expires)
    pub ttl_ms: Option<u64>,
    /// Maximum number of argument keys kept for this method
    pub capacity: Option<usize>,
    /// Tiers the results are written to
    pub persistence: Option<PersistenceLevel>,
    /// Error fallback behaviour
    pub fallback: Option<FallbackMode>,
}

impl CachePolicy {
    /// Policy using every client default
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the memory TTL
    pub fn ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// Override the per-method capacity
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Override the persistence level
    pub fn persistence(mut self, persistence: PersistenceLevel) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Override the error fallback mode
    pub fn fallback(mut self, fallback: FallbackMode) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn resolve(&self, config: &EngineConfig) -> ResolvedCachePolicy {
        ResolvedCachePolicy {
            ttl_ms: self.ttl_ms.unwrap_or(config.default_cache_ttl_ms),
            capacity: self.capacity.unwrap_or(config.default_cache_capacity),
            persistence: self.persistence.unwrap_or(config.default_persistence),
            fallback: self.fallback.unwrap_or(config.default_fallback),
        }
    }
}

/// Cache policy with every default applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCachePolicy {
    /// Memory TTL in milliseconds (0 = never expires)
    pub ttl_ms: u64,
    /// Maximum number of argument keys kept for the method
    pub capacity: usize,
    /// Tiers the results are written to
    pub persistence: PersistenceLevel,
    /// Error fallback behaviour
    pub fallback: FallbackMode,
}

/// Declaration of one remote method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Method name as seen by callers
    pub name: String,
    /// Wire name override; prefix and suffix rules still apply
    pub wire_name: Option<String>,
    /// Signature text distinguishing overloads
    pub signature: String,
    /// Invocation mode
    pub mode: CallMode,
    /// Timeout in milliseconds (0 = client default)
    pub timeout_ms: u64,
    /// Sort before normal-priority calls in a batch
    pub high_priority: bool,
    /// Result caching, if any
    pub cache: Option<CachePolicy>,
    /// Single-flight policy, if any
    pub single_flight: Option<SingleFlightMode>,
    /// Declared result shape
    pub return_shape: ReturnShape,
    /// Parameter names for codecs that send named parameters
    pub param_names: Vec<String>,
    /// Artificial delay before execution
    pub delay_ms: u64,
}

impl MethodSpec {
    fn with_mode(name: impl Into<String>, mode: CallMode) -> Self {
        Self {
            name: name.into(),
            wire_name: None,
            signature: String::new(),
            mode,
            timeout_ms: 0,
            high_priority: false,
            cache: None,
            single_flight: None,
            return_shape: ReturnShape::Json,
            param_names: Vec::new(),
            delay_ms: 0,
        }
    }

    /// A method invoked through `Engine::submit`
    pub fn asynchronous(name: impl Into<String>) -> Self {
        Self::with_mode(name, CallMode::Async)
    }

    /// A method invoked inline through `Engine::call`
    pub fn synchronous(name: impl Into<String>) -> Self {
        Self::with_mode(name, CallMode::Sync)
    }

    /// Send this method under a different wire name
    pub fn wire_name(mut self, wire_name: impl Into<String>) -> Self {
        self.wire_name = Some(wire_name.into());
        self
    }

    /// Set the signature text used for the method identity
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Override the client default timeout
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Mark as high priority
    pub fn high_priority(mut self) -> Self {
        self.high_priority = true;
        self
    }

    /// Enable result caching
    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    /// Enable single-flight admission
    pub fn single_flight(mut self, mode: SingleFlightMode) -> Self {
        self.single_flight = Some(mode);
        self
    }

    /// Declare the result shape
    pub fn returns(mut self, shape: ReturnShape) -> Self {
        self.return_shape = shape;
        self
    }

    /// Declare parameter names
    pub fn param_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Delay execution by `delay_ms`
    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

/// Declaration of one remote API interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSpec {
    /// Interface name; part of every method identity
    pub interface: String,
    /// Prepended to every wire name
    pub name_prefix: Option<String>,
    /// Appended to every wire name
    pub name_suffix: Option<String>,
    /// Declared methods
    pub methods: Vec<MethodSpec>,
}

impl ApiSpec {
    /// Start an API declaration
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            name_prefix: None,
            name_suffix: None,
            methods: Vec::new(),
        }
    }

    /// Prefix every wire name
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Suffix every wire name
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.name_suffix = Some(suffix.into());
        self
    }

    /// Add a method
    pub fn method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }

    /// Resolve every method against client defaults
    pub fn resolve(&self, config: &EngineConfig) -> Result<Vec<ResolvedMethod>> {
        self.methods
            .iter()
            .map(|spec| ResolvedMethod::resolve(self, spec, config))
            .collect()
    }
}

/// A method with every client default applied
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMethod {
    /// Stable identity
    pub id: MethodId,
    /// Declaring interface
    pub interface: String,
    /// Display name
    pub name: String,
    /// Name sent on the wire
    pub wire_name: String,
    /// Invocation mode
    pub mode: CallMode,
    /// Effective timeout
    pub timeout_ms: u64,
    /// Batch priority flag
    pub high_priority: bool,
    /// Effective cache policy
    pub cache: Option<ResolvedCachePolicy>,
    /// Single-flight policy
    pub single_flight: Option<SingleFlightMode>,
    /// Declared result shape
    pub return_shape: ReturnShape,
    /// Parameter names
    pub param_names: Vec<String>,
    /// Delay before execution
    pub delay_ms: u64,
}

/// Shared reference to a resolved method, handed out by the engine
pub type MethodRef = Arc<ResolvedMethod>;

impl ResolvedMethod {
    fn resolve(api: &ApiSpec, spec: &MethodSpec, config: &EngineConfig) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(RpcError::configuration(format!(
                "{}: method name must not be empty",
                api.interface
            )));
        }
        if spec.mode == CallMode::Sync && spec.single_flight.is_some() {
            return Err(RpcError::configuration(format!(
                "{}::{}: single-flight is not supported on synchronous methods",
                api.interface, spec.name
            )));
        }
        if let Some(CachePolicy {
            capacity: Some(0), ..
        }) = spec.cache
        {
            return Err(RpcError::configuration(format!(
                "{}::{}: cache capacity must be at least 1",
                api.interface, spec.name
            )));
        }

        let base = spec.wire_name.as_deref().unwrap_or(&spec.name);
        let wire_name = format!(
            "{}{}{}",
            api.name_prefix.as_deref().unwrap_or_default(),
            base,
            api.name_suffix.as_deref().unwrap_or_default()
        );
        let timeout_ms = if spec.timeout_ms == 0 {
            config.default_timeout_ms
        } else {
            spec.timeout_ms
        };

        Ok(Self {
            id: MethodId::derive(&api.interface, &spec.name, &spec.signature),
            interface: api.interface.clone(),
            name: spec.name.clone(),
            wire_name,
            mode: spec.mode,
            timeout_ms,
            high_priority: spec.high_priority,
            cache: spec.cache.as_ref().map(|policy| policy.resolve(config)),
            single_flight: spec.single_flight,
            return_shape: spec.return_shape,
            param_names: spec.param_names.clone(),
            delay_ms: spec.delay_ms,
        })
    }

    /// Whether successful results of this method go into the result cache
    pub fn caches_results(&self) -> bool {
        self.cache.is_some() && self.return_shape != ReturnShape::Unit
    }
}
