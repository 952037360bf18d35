//! Policy model: keys, retry/hedge/circuit configuration, and normalization.
//!
//! Policies are pure data. Providers hand them to the executor, which always
//! normalizes before use: out-of-range numeric fields are clamped into safe
//! ranges and every clamp is recorded in the policy's metadata.

use crate::jitter::JitterKind;
use std::time::Duration;

/// Hard ceiling on attempts per call, post-normalization.
pub const MAX_ATTEMPTS_CEILING: u32 = 10;
/// Smallest backoff the executor will schedule.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1);
/// Largest backoff the executor will schedule.
pub const MAX_BACKOFF_CEILING: Duration = Duration::from_secs(30);
/// Hard ceiling on hedges per retry slot, post-normalization.
pub const MAX_HEDGES_CEILING: u32 = 10;

/// Stable identifier for an operation: `(namespace, name)`.
///
/// Used for policy lookup, breaker keying, and latency tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PolicyKey {
    namespace: String,
    name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into().trim().to_string(),
            name: name.into().trim().to_string(),
        }
    }

    /// Parse `"namespace.name"`. Whitespace is trimmed, the split happens at
    /// the *first* dot, and everything after it joins into the name. A key
    /// without a dot has an empty namespace.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.split_once('.') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new("", raw),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}.{}", self.namespace, self.name)
        }
    }
}

impl From<&str> for PolicyKey {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// Where a policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PolicyOrigin {
    /// Looked up in a static in-process map.
    Static,
    /// Built-in defaults, used when no source knows the key.
    Default,
    /// Fetched from a remote source (possibly through the cache).
    Remote,
}

impl PolicyOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyOrigin::Static => "static",
            PolicyOrigin::Default => "default",
            PolicyOrigin::Remote => "remote",
        }
    }
}

/// Record of what `normalize` changed, if anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Normalization {
    pub changed: bool,
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PolicyMeta {
    pub origin: PolicyOrigin,
    pub normalization: Normalization,
}

/// Reference to a named budget plus the per-attempt cost to debit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BudgetRef {
    /// Budget name in the executor's budget registry. Empty means no budget.
    pub name: String,
    pub cost: u64,
}

impl Default for BudgetRef {
    fn default() -> Self {
        Self { name: String::new(), cost: 1 }
    }
}

/// Retry sequencing configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub jitter: JitterKind,
    /// Deadline applied to each individual attempt.
    pub timeout_per_attempt: Option<Duration>,
    /// Deadline applied to the whole call, including backoff sleeps.
    pub overall_timeout: Option<Duration>,
    /// Classifier name in the executor's classifier registry. Empty means the
    /// executor default.
    pub classifier: String,
    pub budget: BudgetRef,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: JitterKind::Full,
            timeout_per_attempt: None,
            overall_timeout: None,
            classifier: String::new(),
            budget: BudgetRef::default(),
        }
    }
}

/// Speculative hedging configuration for a retry slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HedgePolicy {
    pub enabled: bool,
    /// Maximum sibling attempts beyond the primary.
    pub max_hedges: u32,
    /// Trigger name in the executor's trigger registry. When missing, a fixed
    /// delay trigger built from `hedge_delay` is used.
    pub trigger: String,
    pub hedge_delay: Duration,
    /// Fail the slot as soon as any attempt classifies NonRetryable/Abort,
    /// cancelling its siblings.
    pub cancel_on_first_terminal: bool,
}

/// Client-side circuit breaking configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CircuitPolicy {
    pub enabled: bool,
    /// Consecutive call failures that open the circuit.
    pub threshold: u32,
    /// How long the circuit stays open before probing.
    pub cooldown: Duration,
    /// Concurrent probes allowed in half-open.
    pub max_probes: u32,
    /// Consecutive probe successes required to close.
    pub probes_required: u32,
}

/// A fully resolved policy for one key.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EffectivePolicy {
    pub key: PolicyKey,
    pub id: String,
    pub retry: RetryPolicy,
    pub hedge: HedgePolicy,
    pub circuit: CircuitPolicy,
    pub meta: PolicyMeta,
}

impl EffectivePolicy {
    /// Built-in defaults for a key no source knows about.
    pub fn default_for(key: &PolicyKey) -> Self {
        Self {
            key: key.clone(),
            id: format!("default:{key}"),
            retry: RetryPolicy::default(),
            hedge: HedgePolicy::default(),
            circuit: CircuitPolicy::default(),
            meta: PolicyMeta {
                origin: PolicyOrigin::Default,
                normalization: Normalization::default(),
            },
        }
    }

    /// The smallest useful policy: one attempt, nothing else.
    pub fn minimal(key: &PolicyKey) -> Self {
        let mut policy = Self::default_for(key);
        policy.id = format!("minimal:{key}");
        policy.retry.max_attempts = 1;
        policy
    }

    /// Clamp every field into its safe range, recording each change.
    ///
    /// Normalizing an already-normalized policy is a no-op apart from the
    /// `changed` flag carrying over.
    pub fn normalize(mut self) -> Self {
        let mut changed: Vec<&'static str> = Vec::new();

        let retry = &mut self.retry;
        if retry.max_attempts < 1 {
            retry.max_attempts = 1;
            changed.push("retry.max_attempts");
        } else if retry.max_attempts > MAX_ATTEMPTS_CEILING {
            retry.max_attempts = MAX_ATTEMPTS_CEILING;
            changed.push("retry.max_attempts");
        }
        if retry.initial_backoff < MIN_BACKOFF {
            retry.initial_backoff = MIN_BACKOFF;
            changed.push("retry.initial_backoff");
        }
        if retry.max_backoff > MAX_BACKOFF_CEILING {
            retry.max_backoff = MAX_BACKOFF_CEILING;
            changed.push("retry.max_backoff");
        }
        if retry.max_backoff < retry.initial_backoff {
            retry.max_backoff = retry.initial_backoff;
            changed.push("retry.max_backoff");
        }
        if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
            retry.backoff_multiplier = 1.0;
            changed.push("retry.backoff_multiplier");
        } else if retry.backoff_multiplier > 10.0 {
            retry.backoff_multiplier = 10.0;
            changed.push("retry.backoff_multiplier");
        }
        if retry.budget.cost < 1 {
            retry.budget.cost = 1;
            changed.push("retry.budget.cost");
        }

        if self.hedge.enabled {
            let hedge = &mut self.hedge;
            if hedge.max_hedges < 1 {
                hedge.max_hedges = 1;
                changed.push("hedge.max_hedges");
            } else if hedge.max_hedges > MAX_HEDGES_CEILING {
                hedge.max_hedges = MAX_HEDGES_CEILING;
                changed.push("hedge.max_hedges");
            }
            if hedge.hedge_delay < MIN_BACKOFF {
                hedge.hedge_delay = MIN_BACKOFF;
                changed.push("hedge.hedge_delay");
            }
        }

        if self.circuit.enabled {
            let circuit = &mut self.circuit;
            if circuit.threshold < 1 {
                circuit.threshold = 1;
                changed.push("circuit.threshold");
            }
            if circuit.cooldown < MIN_BACKOFF {
                circuit.cooldown = MIN_BACKOFF;
                changed.push("circuit.cooldown");
            }
            if circuit.max_probes < 1 {
                circuit.max_probes = 1;
                changed.push("circuit.max_probes");
            }
            if circuit.probes_required < 1 {
                circuit.probes_required = 1;
                changed.push("circuit.probes_required");
            }
        }

        if !changed.is_empty() {
            tracing::debug!(
                key = %self.key,
                fields = ?changed,
                "policy fields clamped during normalization"
            );
            self.meta.normalization.changed = true;
            for field in changed {
                if !self.meta.normalization.changed_fields.iter().any(|f| f == field) {
                    self.meta.normalization.changed_fields.push(field.to_string());
                }
            }
        }
        self
    }
}
