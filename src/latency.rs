//! Per-key latency sampling for hedge triggers.
//!
//! A fixed-size ring buffer of recent attempt durations feeds quantile
//! snapshots to latency-based hedge triggers.

use crate::policy::PolicyKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Default number of samples retained per key.
pub const DEFAULT_TRACKER_CAPACITY: usize = 256;

/// Point-in-time quantiles over the tracked samples.
///
/// All zeros when no samples have been recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub count: usize,
    pub p50: Duration,
    pub p90: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl LatencySnapshot {
    /// Look up a quantile by its wire name (`p50`, `p90`, `p95`, `p99`).
    pub fn percentile(&self, name: &str) -> Option<Duration> {
        match name {
            "p50" => Some(self.p50),
            "p90" => Some(self.p90),
            "p95" => Some(self.p95),
            "p99" => Some(self.p99),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Ring {
    samples: Vec<Duration>,
    next: usize,
    filled: bool,
}

/// Fixed-size circular sample buffer.
///
/// Writers take the write lock; `snapshot` copies live samples under the read
/// lock so readers never block writers beyond the copy.
#[derive(Debug)]
pub struct RingBufferTracker {
    capacity: usize,
    inner: RwLock<Ring>,
}

impl RingBufferTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: RwLock::new(Ring {
                samples: Vec::with_capacity(capacity),
                next: 0,
                filled: false,
            }),
        }
    }

    pub fn record(&self, sample: Duration) {
        let mut ring = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if ring.filled {
            let next = ring.next;
            ring.samples[next] = sample;
        } else {
            ring.samples.push(sample);
        }
        ring.next = (ring.next + 1) % self.capacity;
        if !ring.filled && ring.samples.len() == self.capacity {
            ring.filled = true;
        }
    }

    /// Consistent copy of the live samples, reduced to nearest-rank quantiles:
    /// `sorted[(len - 1) * q]`.
    pub fn snapshot(&self) -> LatencySnapshot {
        let mut samples = {
            let ring = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            ring.samples.clone()
        };
        if samples.is_empty() {
            return LatencySnapshot::default();
        }
        samples.sort_unstable();

        let rank = |q: f64| -> Duration {
            let idx = ((samples.len() - 1) as f64 * q) as usize;
            samples[idx]
        };
        LatencySnapshot {
            count: samples.len(),
            p50: rank(0.50),
            p90: rank(0.90),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

/// Trackers keyed by policy key, created on first use.
#[derive(Debug)]
pub struct LatencyRegistry {
    capacity: usize,
    inner: RwLock<HashMap<PolicyKey, Arc<RingBufferTracker>>>,
}

impl LatencyRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), inner: RwLock::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, key: &PolicyKey) -> Arc<RingBufferTracker> {
        if let Some(tracker) = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return tracker.clone();
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.clone())
            .or_insert_with(|| Arc::new(RingBufferTracker::new(self.capacity)))
            .clone()
    }
}

impl Default for LatencyRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_CAPACITY)
    }
}
