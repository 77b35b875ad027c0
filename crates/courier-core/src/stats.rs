//! Rolling latency statistics per wire name

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Latency summary of one wire name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    /// Wire name the samples belong to
    pub wire_name: String,
    /// Mean of the retained samples
    pub mean_ms: u64,
    /// Number of retained samples
    pub samples: usize,
}

/// Rolling mean over the last `window` samples of each wire name
pub struct LatencyStats {
    window: usize,
    samples: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl LatencyStats {
    /// Keep `window` samples per wire name
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: Mutex::new(HashMap::new()),
        }
    }

    /// Record one exchange
    pub fn record(&self, wire_name: &str, elapsed_ms: u64) {
        let mut samples = self.samples.lock();
        let ring = samples.entry(wire_name.to_owned()).or_default();
        if ring.len() == self.window {
            ring.pop_front();
        }
        ring.push_back(elapsed_ms);
    }

    /// Mean latency, if any sample exists
    pub fn mean(&self, wire_name: &str) -> Option<u64> {
        let samples = self.samples.lock();
        let ring = samples.get(wire_name).filter(|ring| !ring.is_empty())?;
        Some(ring.iter().sum::<u64>() / ring.len() as u64)
    }

    /// Summaries of every wire name, sorted by name
    pub fn snapshot(&self) -> Vec<LatencySummary> {
        let samples = self.samples.lock();
        let mut out: Vec<LatencySummary> = samples
            .iter()
            .filter(|(_, ring)| !ring.is_empty())
            .map(|(name, ring)| LatencySummary {
                wire_name: name.clone(),
                mean_ms: ring.iter().sum::<u64>() / ring.len() as u64,
                samples: ring.len(),
            })
            .collect();
        out.sort_by(|a, b| a.wire_name.cmp(&b.wire_name));
        out
    }
}
