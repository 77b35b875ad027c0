//! In-memory durable cache tier

use async_trait::async_trait;
use courier_core::{CachedValue, Clock, DurableStore, MethodId, Result, RpcError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Durable store backed by a map, with read/write counters
#[derive(Debug)]
pub struct MemoryDurableStore {
    entries: Mutex<HashMap<(MethodId, String), CachedValue>>,
    clock: Arc<dyn Clock>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryDurableStore {
    /// Empty store judging TTLs by `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with a connection error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `get` calls
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of successful `put` calls
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored entry, ignoring TTL
    pub fn entry(&self, method: MethodId, arg_key: &str) -> Option<CachedValue> {
        self.entries.lock().get(&(method, arg_key.to_owned())).cloned()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RpcError::connection("durable store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn get(&self, method: MethodId, arg_key: &str, ttl_ms: u64) -> Result<Option<CachedValue>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let now = self.clock.now_ms();
        Ok(self
            .entries
            .lock()
            .get(&(method, arg_key.to_owned()))
            .filter(|entry| ttl_ms == 0 || now.saturating_sub(entry.created_ms) < ttl_ms)
            .cloned())
    }

    async fn put(&self, method: MethodId, arg_key: &str, entry: &CachedValue) -> Result<()> {
        self.check()?;
        self.entries
            .lock()
            .insert((method, arg_key.to_owned()), entry.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
