//! Policy resolution: sources, the static provider, and the caching provider.

use crate::clock::{Clock, MonotonicClock};
use crate::policy::{EffectivePolicy, PolicyKey, PolicyOrigin};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// How long positive cache entries live by default.
pub const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(60);
/// How long negative (not-found) cache entries live by default.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(10);

/// Errors from policy lookup.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Sentinel: the source definitively does not know this key.
    #[error("policy not found")]
    NotFound,
    /// Transient fetch failure; retry behavior is caller-driven.
    #[error("policy fetch failed: {0}")]
    Fetch(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl PolicyError {
    pub fn fetch(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Fetch(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// An abstract backing store of policies (remote config service, file, ...).
///
/// Misses must be reported with [`PolicyError::NotFound`]; any other error is
/// treated as transient and is never cached.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn get_policy(&self, key: &PolicyKey) -> Result<EffectivePolicy, PolicyError>;
}

/// Resolves a key to an effective policy. This is the seam the executor
/// consumes; providers do not normalize, the executor always does.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn effective_policy(&self, key: &PolicyKey) -> Result<EffectivePolicy, PolicyError>;
}

/// Provider backed by an in-process map.
#[derive(Default)]
pub struct StaticProvider {
    policies: HashMap<PolicyKey, EffectivePolicy>,
    default: Option<EffectivePolicy>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, key: PolicyKey, mut policy: EffectivePolicy) -> Self {
        policy.key = key.clone();
        policy.meta.origin = PolicyOrigin::Static;
        self.policies.insert(key, policy);
        self
    }

    /// Fallback returned for unknown keys, re-keyed to the requested key.
    pub fn with_default(mut self, policy: EffectivePolicy) -> Self {
        self.default = Some(policy);
        self
    }
}

#[async_trait]
impl PolicyProvider for StaticProvider {
    async fn effective_policy(&self, key: &PolicyKey) -> Result<EffectivePolicy, PolicyError> {
        if let Some(policy) = self.policies.get(key) {
            return Ok(policy.clone());
        }
        if let Some(default) = &self.default {
            let mut policy = default.clone();
            policy.key = key.clone();
            policy.meta.origin = PolicyOrigin::Static;
            return Ok(policy);
        }
        Ok(EffectivePolicy::default_for(key))
    }
}

struct CacheEntry {
    /// `None` marks a cached not-found.
    policy: Option<EffectivePolicy>,
    expires_at_ms: u64,
}

/// Caching provider over an abstract [`PolicySource`].
///
/// Positive hits and not-found results are cached with separate TTLs; other
/// fetch errors pass through uncached so retry behavior stays caller-driven.
/// No stampede suppression: concurrent misses may each fetch once.
pub struct CachedProvider {
    source: Arc<dyn PolicySource>,
    clock: Arc<dyn Clock>,
    positive_ttl: Duration,
    negative_ttl: Duration,
    entries: Mutex<HashMap<PolicyKey, CacheEntry>>,
}

impl CachedProvider {
    pub fn new(source: Arc<dyn PolicySource>) -> Self {
        Self {
            source,
            clock: Arc::new(MonotonicClock::default()),
            positive_ttl: DEFAULT_POSITIVE_TTL,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttls(mut self, positive: Duration, negative: Duration) -> Self {
        self.positive_ttl = positive;
        self.negative_ttl = negative;
        self
    }

    /// Cache lookup distinguishing "absent" from "cached absent".
    fn lookup(&self, key: &PolicyKey) -> Option<Option<EffectivePolicy>> {
        let now = self.clock.now_millis();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if now < entry.expires_at_ms => Some(entry.policy.clone()),
            _ => None,
        }
    }

    fn insert(&self, key: &PolicyKey, policy: Option<EffectivePolicy>, ttl: Duration) {
        let expires_at_ms = self.clock.now_millis().saturating_add(ttl.as_millis() as u64);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.clone(), CacheEntry { policy, expires_at_ms });
    }
}

#[async_trait]
impl PolicyProvider for CachedProvider {
    async fn effective_policy(&self, key: &PolicyKey) -> Result<EffectivePolicy, PolicyError> {
        match self.lookup(key) {
            Some(Some(policy)) => return Ok(policy),
            Some(None) => return Err(PolicyError::NotFound),
            None => {}
        }

        match self.source.get_policy(key).await {
            Ok(policy) => {
                self.insert(key, Some(policy.clone()), self.positive_ttl);
                Ok(policy)
            }
            Err(PolicyError::NotFound) => {
                tracing::debug!(key = %key, "caching negative policy entry");
                self.insert(key, None, self.negative_ttl);
                Err(PolicyError::NotFound)
            }
            Err(err) => Err(err),
        }
    }
}
