//! Two-tier result cache
//!
//! The memory tier is a strict LRU per method identity, keyed by the hash of
//! the structural argument representation. The optional durable tier sits
//! behind the [`DurableStore`] trait and is consulted on a memory miss for
//! methods whose persistence level asks for it; a durable hit re-populates
//! memory.
//!
//! TTL is checked at read time only. An expired entry reads as a miss and
//! stays in place until LRU eviction or the next `put` for its key.

use crate::call::Headers;
use crate::clock::Clock;
use crate::config::CacheMode;
use crate::error::Result;
use crate::method::{MethodId, PersistenceLevel, ResolvedMethod};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Structural key of an argument list
///
/// Equal argument values produce equal keys. Object members are written in
/// sorted key order so map insertion order never matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArgKey {
    hash: blake3::Hash,
    repr: String,
}

impl ArgKey {
    /// Key of `args`
    pub fn from_args(args: &[Value]) -> Self {
        let mut repr = String::new();
        repr.push('[');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                repr.push(',');
            }
            write_canonical(&mut repr, arg);
        }
        repr.push(']');
        Self {
            hash: blake3::hash(repr.as_bytes()),
            repr,
        }
    }

    /// Canonical JSON text; the durable tier's key
    pub fn repr(&self) -> &str {
        &self.repr
    }

    /// Digest used by the memory tier
    pub fn hash(&self) -> &blake3::Hash {
        &self.hash
    }
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(key.clone()));
                if let Some(member) = map.get(key) {
                    write_canonical(out, member);
                }
            }
            out.push('}');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

/// One stored result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    /// Result value
    pub value: Arc<Value>,
    /// Response headers of the call that produced it
    pub headers: Headers,
    /// When the value was stored
    pub created_ms: u64,
}

impl CachedValue {
    fn is_fresh(&self, ttl_ms: u64, now_ms: u64) -> bool {
        ttl_ms == 0 || now_ms.saturating_sub(self.created_ms) < ttl_ms
    }
}

/// Result of a successful cache lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// Value handed to the caller
    pub value: Arc<Value>,
    /// Stored response headers
    pub headers: Headers,
    /// Age of the entry at lookup time
    pub age_ms: u64,
}

/// Secondary cache tier
///
/// Implementations serialise their own access. The engine holds no lock
/// while awaiting them and downgrades their failures to a cache miss.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Stored value for `(method, arg_key)` no older than `ttl_ms` (0 = any age)
    async fn get(&self, method: MethodId, arg_key: &str, ttl_ms: u64) -> Result<Option<CachedValue>>;

    /// Store `entry` for `(method, arg_key)`
    async fn put(&self, method: MethodId, arg_key: &str, entry: &CachedValue) -> Result<()>;
}

struct MethodEntries {
    capacity: usize,
    entries: IndexMap<blake3::Hash, CachedValue>,
}

/// In-memory LRU tier
#[derive(Default)]
pub struct MemoryCache {
    methods: Mutex<HashMap<MethodId, MethodEntries>>,
}

impl MemoryCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh entry for `key`; a hit becomes the most recently used entry
    pub fn get(&self, method: MethodId, key: &ArgKey, ttl_ms: u64, now_ms: u64) -> Option<CachedValue> {
        let mut methods = self.methods.lock();
        let slot = methods.get_mut(&method)?;
        let index = slot.entries.get_index_of(key.hash())?;
        if !slot.entries.get_index(index)?.1.is_fresh(ttl_ms, now_ms) {
            return None;
        }
        let last = slot.entries.len() - 1;
        slot.entries.move_index(index, last);
        slot.entries.get_index(last).map(|(_, entry)| entry.clone())
    }

    /// Store `entry`, evicting the least recently used key beyond `capacity`
    pub fn put(&self, method: MethodId, key: &ArgKey, capacity: usize, entry: CachedValue) {
        let mut methods = self.methods.lock();
        let slot = methods.entry(method).or_insert_with(|| MethodEntries {
            capacity,
            entries: IndexMap::new(),
        });
        slot.capacity = capacity.max(1);
        slot.entries.shift_remove(key.hash());
        slot.entries.insert(*key.hash(), entry);
        while slot.entries.len() > slot.capacity {
            slot.entries.shift_remove_index(0);
        }
    }

    /// Whether an entry, fresh or not, is stored for `key`
    pub fn contains(&self, method: MethodId, key: &ArgKey) -> bool {
        self.methods
            .lock()
            .get(&method)
            .is_some_and(|slot| slot.entries.contains_key(key.hash()))
    }

    /// Number of entries stored for `method`
    pub fn len(&self, method: MethodId) -> usize {
        self.methods
            .lock()
            .get(&method)
            .map_or(0, |slot| slot.entries.len())
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.methods.lock().clear();
    }

    /// Drop every entry of one method
    pub fn clear_method(&self, method: MethodId) {
        self.methods.lock().remove(&method);
    }
}

/// Both tiers behind the engine's cache policy
pub struct ResultCache {
    memory: MemoryCache,
    durable: Option<Arc<dyn DurableStore>>,
    clock: Arc<dyn Clock>,
    mode: CacheMode,
    enabled: bool,
}

impl ResultCache {
    /// Build the cache
    pub fn new(
        enabled: bool,
        mode: CacheMode,
        durable: Option<Arc<dyn DurableStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            memory: MemoryCache::new(),
            durable,
            clock,
            mode,
            enabled,
        }
    }

    /// Memory tier, for inspection
    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }

    /// Look up a cached result for `method` with `key`
    pub async fn get(&self, method: &ResolvedMethod, key: &ArgKey) -> Option<CacheHit> {
        if !self.enabled || !method.caches_results() {
            return None;
        }
        let policy = method.cache?;
        let now = self.clock.now_ms();

        if let Some(entry) = self.memory.get(method.id, key, policy.ttl_ms, now) {
            tracing::trace!(method = %method.wire_name, "memory cache hit");
            return Some(self.hit(entry, now));
        }

        if policy.persistence != PersistenceLevel::Durable {
            return None;
        }
        let store = self.durable.as_ref()?;
        match store.get(method.id, key.repr(), policy.ttl_ms).await {
            Ok(Some(entry)) => {
                tracing::trace!(method = %method.wire_name, "durable cache hit");
                self.memory.put(method.id, key, policy.capacity, entry.clone());
                Some(self.hit(entry, now))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(method = %method.wire_name, error = %e, "durable cache read failed");
                None
            }
        }
    }

    /// Store a successful result in every tier the method's policy names
    pub async fn put(&self, method: &ResolvedMethod, key: &ArgKey, value: Arc<Value>, headers: Headers) {
        if !self.enabled || !method.caches_results() {
            return;
        }
        let Some(policy) = method.cache else {
            return;
        };
        let entry = CachedValue {
            value,
            headers,
            created_ms: self.clock.now_ms(),
        };
        self.memory.put(method.id, key, policy.capacity, entry.clone());
        if policy.persistence == PersistenceLevel::Durable {
            if let Some(store) = &self.durable {
                if let Err(e) = store.put(method.id, key.repr(), &entry).await {
                    tracing::warn!(method = %method.wire_name, error = %e, "durable cache write failed");
                }
            }
        }
    }

    /// Copy of `value` isolated from the cache when clone-on-read is set
    pub fn isolate(&self, value: Arc<Value>) -> Arc<Value> {
        match self.mode {
            CacheMode::Shared => value,
            CacheMode::CloneOnRead => Arc::new(Value::clone(&value)),
        }
    }

    fn hit(&self, entry: CachedValue, now_ms: u64) -> CacheHit {
        CacheHit {
            value: self.isolate(entry.value),
            headers: entry.headers,
            age_ms: now_ms.saturating_sub(entry.created_ms),
        }
    }

    /// Drop the memory tier of every method
    pub fn clear(&self) {
        self.memory.clear();
    }

    /// Drop the memory tier of one method
    pub fn clear_method(&self, method: MethodId) {
        self.memory.clear_method(method);
    }
}
