//! Retry policy for generation calls.
//!
//! Pure decision logic: given how a call failed and how many times the current
//! model has been tried, decide whether to retry the same model or move on to
//! the next candidate.
//!
//! | Error class | Decision                                                   |
//! |-------------|------------------------------------------------------------|
//! | `Quota`     | switch model, regardless of attempt                        |
//! | `NotFound`  | switch model, regardless of attempt                        |
//! | `Transient` | retry same model while `attempt < max - 1`, then switch    |
//! | `Unknown`   | same as `Transient`                                        |
//!
//! `Abort` is never produced by [`decide`]; the executor turns a
//! `SwitchModel` into `Abort` when the ladder has no further candidates
//! (see [`RetryDecision::or_abort`]).
//!
//! Backoff before a same-model retry after attempt `k`:
//! `base_delay * 2^k + uniform(0, jitter_ceiling)`.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Failure classification of a single generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network hiccup, timeout or 5xx; the call may succeed if repeated.
    Transient,
    /// Quota / rate budget exhausted for this model.
    Quota,
    /// The model identifier is unknown or retired.
    NotFound,
    /// Anything that did not match a known failure shape.
    Unknown,
}

impl ErrorClass {
    /// `true` when the failure says the *model* is unusable rather than the call.
    pub fn is_model_unusable(self) -> bool {
        matches!(self, Self::Quota | Self::NotFound)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Quota => write!(f, "quota"),
            Self::NotFound => write!(f, "not_found"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What the executor should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    RetrySameModel,
    SwitchModel,
    Abort,
}

impl RetryDecision {
    /// Turn `SwitchModel` into `Abort` when there is no model left to switch to.
    pub fn or_abort(self, has_next_model: bool) -> Self {
        match self {
            Self::SwitchModel if !has_next_model => Self::Abort,
            other => other,
        }
    }
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetrySameModel => write!(f, "retry_same_model"),
            Self::SwitchModel => write!(f, "switch_model"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Decide how to proceed after a failure on attempt `attempt_index` (0-based).
pub fn decide(error: ErrorClass, attempt_index: u32, max_attempts_per_model: u32) -> RetryDecision {
    match error {
        ErrorClass::Quota | ErrorClass::NotFound => RetryDecision::SwitchModel,
        ErrorClass::Transient | ErrorClass::Unknown => {
            if attempt_index.saturating_add(1) < max_attempts_per_model {
                RetryDecision::RetrySameModel
            } else {
                RetryDecision::SwitchModel
            }
        }
    }
}

/// Invalid retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("max_attempts_per_model must be > 0")]
    ZeroAttempts,
}

/// Per-model attempt ceiling and backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed on one model before switching (>= 1).
    pub max_attempts_per_model: u32,
    /// Backoff base in milliseconds; doubled per attempt.
    pub base_delay_ms: u64,
    /// Upper bound (inclusive) of the uniform jitter added to each backoff.
    pub jitter_ceiling_ms: u64,
}

impl Default for RetryPolicy {
    /// 3 attempts per model, 1s base, up to 500ms jitter.
    fn default() -> Self {
        Self {
            max_attempts_per_model: 3,
            base_delay_ms: 1_000,
            jitter_ceiling_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_attempts_per_model == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        Ok(())
    }

    /// [`decide`] with this policy's attempt ceiling.
    pub fn decide(&self, error: ErrorClass, attempt_index: u32) -> RetryDecision {
        decide(error, attempt_index, self.max_attempts_per_model)
    }

    /// Deterministic part of the backoff: `base_delay * 2^attempt`, saturating.
    pub fn backoff_floor(&self, attempt_index: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// Full backoff using the thread-local RNG for jitter.
    pub fn backoff_delay(&self, attempt_index: u32) -> Duration {
        self.backoff_delay_with(attempt_index, &mut rand::thread_rng())
    }

    /// Full backoff with a caller-supplied RNG. The result lies in
    /// `[backoff_floor(k), backoff_floor(k) + jitter_ceiling]`.
    pub fn backoff_delay_with<R: Rng + ?Sized>(&self, attempt_index: u32, rng: &mut R) -> Duration {
        let jitter = if self.jitter_ceiling_ms == 0 {
            0
        } else {
            rng.gen_range(0..=self.jitter_ceiling_ms)
        };
        self.backoff_floor(attempt_index)
            .saturating_add(Duration::from_millis(jitter))
    }
}
