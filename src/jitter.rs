//! Jitter strategies applied to backoff delays to prevent thundering herd.

use rand::Rng;
use std::time::Duration;

/// Error returned when a jitter name in a policy does not match a known kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown jitter kind: {0:?}")]
pub struct UnknownJitter(pub String);

/// Jitter strategy for randomizing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum JitterKind {
    /// No jitter, use the exact backoff delay.
    #[default]
    None,
    /// Random between 0 and the delay.
    Full,
    /// Random between delay/2 and the delay.
    Equal,
}

impl JitterKind {
    /// Parse a jitter name as it appears in policy documents.
    ///
    /// The empty string means no jitter; anything else outside
    /// `none`/`full`/`equal` is an error.
    pub fn parse(name: &str) -> Result<Self, UnknownJitter> {
        match name.trim() {
            "" | "none" => Ok(JitterKind::None),
            "full" => Ok(JitterKind::Full),
            "equal" => Ok(JitterKind::Equal),
            other => Err(UnknownJitter(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JitterKind::None => "none",
            JitterKind::Full => "full",
            JitterKind::Equal => "equal",
        }
    }

    /// Apply jitter to a delay duration.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::rng())
    }

    /// Apply jitter with a caller-supplied RNG (deterministic in tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            JitterKind::None => delay,
            JitterKind::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            JitterKind::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                let half = millis / 2;
                Duration::from_millis(rng.random_range(half..=millis))
            }
        }
    }
}

impl std::str::FromStr for JitterKind {
    type Err = UnknownJitter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for JitterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
