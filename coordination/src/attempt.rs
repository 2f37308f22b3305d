//! Per-attempt telemetry for generation calls.
//!
//! Every attempt the fallback executor makes yields one
//! [`GenerationAttemptRecord`]. Records are transient: they are logged and
//! handed to an optional [`AttemptSink`], never persisted with a bundle.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::ErrorClass;

/// How a single attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    /// Failure worth repeating on the same model.
    TransientError,
    /// Failure that disqualifies the model for this request.
    HardError,
}

impl AttemptOutcome {
    pub fn from_class(class: ErrorClass) -> Self {
        if class.is_model_unusable() {
            Self::HardError
        } else {
            Self::TransientError
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationAttemptRecord {
    pub model: String,
    /// 0-based attempt index on `model`.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationAttemptRecord {
    pub fn success(model: &str, attempt_number: u32, elapsed: Duration) -> Self {
        Self {
            model: model.to_string(),
            attempt_number,
            outcome: AttemptOutcome::Success,
            elapsed_ms: elapsed.as_millis() as u64,
            error_class: None,
            error: None,
        }
    }

    pub fn failure(
        model: &str,
        attempt_number: u32,
        class: ErrorClass,
        elapsed: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            model: model.to_string(),
            attempt_number,
            outcome: AttemptOutcome::from_class(class),
            elapsed_ms: elapsed.as_millis() as u64,
            error_class: Some(class),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

/// Receiver for attempt records.
pub trait AttemptSink: Send + Sync {
    fn record(&self, record: &GenerationAttemptRecord);
}

/// In-memory sink that keeps every record in arrival order.
#[derive(Debug, Default)]
pub struct AttemptLog {
    records: Mutex<Vec<GenerationAttemptRecord>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all records seen so far.
    pub fn snapshot(&self) -> Vec<GenerationAttemptRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records with the given outcome.
    pub fn count(&self, outcome: AttemptOutcome) -> usize {
        self.lock().iter().filter(|rec| rec.outcome == outcome).count()
    }

    // A panic elsewhere while holding the lock leaves the Vec intact.
    fn lock(&self) -> MutexGuard<'_, Vec<GenerationAttemptRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AttemptSink for AttemptLog {
    fn record(&self, record: &GenerationAttemptRecord) {
        self.lock().push(record.clone());
    }
}
