//! Wall-clock source for TTL checks and call timing
//!
//! All time arithmetic in the engine goes through an injected [`Clock`] so
//! tests can drive cache expiry deterministically.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond wall clock
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// Clock backed by [`SystemTime`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().try_into().unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}
