//! Error taxonomy for the report pipeline.
//!
//! Every failure the orchestrator can observe is one of these enums. Callers
//! query [`GenerationError::class`] instead of string matching, and terminal
//! failures always carry their original cause.
//!
//! | Error                 | Raised by             | Handling                          |
//! |-----------------------|-----------------------|-----------------------------------|
//! | `GenerationError`     | generation service    | absorbed by the fallback executor |
//! | `ExecutorError`       | fallback executor     | wrapped into `StageFailed`        |
//! | `ClassificationError` | classifiers           | propagated immediately            |
//! | `StoreError`          | context store         | fails the run, nothing retried    |
//! | `ImageFetchError`     | image source          | bounded retry, then surfaced      |
//! | `PipelineError`       | stage chain           | returned to the caller            |

use coordination::{ClassificationInvalid, ErrorClass};
use thiserror::Error;

use crate::types::StageName;

/// Failure of a single call to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Network failure, timeout or 5xx; worth repeating.
    #[error("transient generation failure: {0}")]
    Transient(String),

    /// Quota or rate budget exhausted for the model.
    #[error("quota exhausted: {0}")]
    Quota(String),

    /// The model identifier does not exist for this key.
    #[error("model not found: {0}")]
    NotFound(String),

    /// Response did not match any known failure shape.
    #[error("generation failure: {0}")]
    Unknown(String),
}

impl GenerationError {
    /// Classify this error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Quota(_) => ErrorClass::Quota,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::Unknown(_) => ErrorClass::Unknown,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Quota(m) | Self::NotFound(m) | Self::Unknown(m) => m,
        }
    }
}

/// Failure of one logical generation request across all candidate models.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The candidate-model list was empty; no call was made.
    #[error("no candidate models configured")]
    NoCandidateModels,

    /// Every candidate failed. Carries the last model's last error.
    #[error("all {models_tried} candidate models exhausted after {attempts} attempts; last error from {last_model}: {last_error}")]
    AllModelsExhausted {
        models_tried: usize,
        attempts: u32,
        last_model: String,
        last_error: GenerationError,
    },

    /// The invoking run was cancelled before a model succeeded.
    #[error("generation cancelled")]
    Cancelled,
}

/// Failure reported by an image classifier.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("classifier {classifier} request failed: {message}")]
    Request { classifier: String, message: String },

    #[error("classifier {classifier} returned {status}: {body}")]
    Status {
        classifier: String,
        status: u16,
        body: String,
    },

    #[error("classifier {classifier} returned an invalid result: {source}")]
    Invalid {
        classifier: String,
        #[source]
        source: ClassificationInvalid,
    },
}

/// Failure of the context store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {key} is corrupt: {source}")]
    Deserialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid store key: {0:?}")]
    InvalidKey(String),

    #[error("record {key} has unexpected kind {found}")]
    UnexpectedKind { key: String, found: &'static str },

    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Failure to acquire the input image.
#[derive(Debug, Error)]
pub enum ImageFetchError {
    #[error("failed to fetch {url} after {attempts} attempts: {message}")]
    Exhausted {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("image at {url} is empty")]
    Empty { url: String },

    #[error("failed to read image file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Terminal failure of one pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid patient reference {0:?}: must be one non-empty key segment")]
    InvalidPatientRef(String),

    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error("stage {stage} failed: {cause}")]
    StageFailed {
        stage: StageName,
        #[source]
        cause: ExecutorError,
    },

    #[error("failed to persist diagnostic bundle: {0}")]
    Store(#[from] StoreError),

    #[error("pipeline run cancelled during {0}")]
    Cancelled(StageName),
}

impl PipelineError {
    /// Name of the stage that failed, for stage-level failures.
    pub fn stage(&self) -> Option<StageName> {
        match self {
            Self::StageFailed { stage, .. } | Self::Cancelled(stage) => Some(*stage),
            _ => None,
        }
    }
}
