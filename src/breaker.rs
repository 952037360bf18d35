//! Consecutive-failure circuit breaker with half-open probe accounting.

use crate::clock::Clock;
use crate::policy::{CircuitPolicy, PolicyKey};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Reason attached to a denial while the circuit is open.
pub const CIRCUIT_OPEN: &str = "circuit_open";
/// Reason attached to a denial when half-open probe slots are exhausted.
pub const CIRCUIT_HALF_OPEN_PROBE_LIMIT: &str = "circuit_half_open_probe_limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowDecision {
    pub allowed: bool,
    pub state: CircuitState,
    pub reason: &'static str,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_ms: u64,
    probes_sent: u32,
    probe_successes: u32,
}

/// Per-key breaker. All transitions are serialized under one mutex; the
/// Open → HalfOpen transition is evaluated lazily whenever the breaker is
/// consulted, so no timer task is needed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitPolicy,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_ms: 0,
                probes_sent: 0,
                probe_successes: 0,
            }),
        }
    }

    /// Gate a call. In half-open, an allow consumes a probe slot atomically.
    pub fn allow(&self) -> AllowDecision {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        self.update_state_locked(&mut inner, now);

        match inner.state {
            CircuitState::Closed => AllowDecision {
                allowed: true,
                state: CircuitState::Closed,
                reason: "",
            },
            CircuitState::Open => AllowDecision {
                allowed: false,
                state: CircuitState::Open,
                reason: CIRCUIT_OPEN,
            },
            CircuitState::HalfOpen => {
                if inner.probes_sent < self.config.max_probes {
                    inner.probes_sent += 1;
                    tracing::debug!(
                        breaker = %self.name,
                        probes_in_flight = inner.probes_sent,
                        max = self.config.max_probes,
                        "circuit breaker: half-open probe allowed"
                    );
                    AllowDecision {
                        allowed: true,
                        state: CircuitState::HalfOpen,
                        reason: "",
                    }
                } else {
                    AllowDecision {
                        allowed: false,
                        state: CircuitState::HalfOpen,
                        reason: CIRCUIT_HALF_OPEN_PROBE_LIMIT,
                    }
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        self.update_state_locked(&mut inner, now);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.probes_required {
                    self.enter_locked(&mut inner, CircuitState::Closed, now);
                } else {
                    // Free the probe slot for the next probe in this cycle.
                    inner.probes_sent = inner.probes_sent.saturating_sub(1);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        self.update_state_locked(&mut inner, now);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        threshold = self.config.threshold,
                        "circuit breaker → open"
                    );
                    self.enter_locked(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "circuit breaker: probe failed → open");
                self.enter_locked(&mut inner, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, after lazily applying the cooldown transition.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        self.update_state_locked(&mut inner, now);
        inner.state
    }

    /// Force the breaker back to Closed, clearing all counters.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        self.enter_locked(&mut inner, CircuitState::Closed, now);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_state_locked(&self, inner: &mut BreakerInner, now: u64) {
        if inner.state == CircuitState::Open
            && now.saturating_sub(inner.opened_at_ms) >= self.config.cooldown.as_millis() as u64
        {
            tracing::info!(breaker = %self.name, "circuit breaker → half-open");
            self.enter_locked(inner, CircuitState::HalfOpen, now);
        }
    }

    fn enter_locked(&self, inner: &mut BreakerInner, state: CircuitState, now: u64) {
        inner.state = state;
        match state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at_ms = 0;
                inner.probes_sent = 0;
                inner.probe_successes = 0;
                tracing::info!(breaker = %self.name, "circuit breaker → closed");
            }
            CircuitState::Open => {
                inner.opened_at_ms = now;
            }
            CircuitState::HalfOpen => {
                inner.probes_sent = 0;
                inner.probe_successes = 0;
            }
        }
    }
}

/// Registry of breakers keyed by policy key. Breakers are created lazily on
/// first use and live as long as the registry.
#[derive(Debug)]
pub struct BreakerRegistry {
    clock: Arc<dyn Clock>,
    inner: RwLock<HashMap<PolicyKey, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, inner: RwLock::new(HashMap::new()) }
    }

    /// Get the breaker for `key`, creating it with `config` if absent.
    ///
    /// The config is bound at creation; later policy changes for the same key
    /// do not reconfigure a live breaker.
    pub fn get_or_create(&self, key: &PolicyKey, config: &CircuitPolicy) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return breaker.clone();
        }
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    key.to_string(),
                    config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, key: &PolicyKey) -> Option<Arc<CircuitBreaker>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Reset a breaker by key. Returns false if no breaker exists for it.
    pub fn reset(&self, key: &PolicyKey) -> bool {
        match self.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Snapshot of all breaker states, sorted by key.
    pub fn snapshot(&self) -> Vec<(PolicyKey, CircuitState)> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(PolicyKey, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
