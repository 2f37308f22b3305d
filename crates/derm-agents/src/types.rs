//! Domain types handed between pipeline stages and persisted to the store.
//!
//! | Type               | Produced by         | Consumed by                       |
//! |--------------------|---------------------|-----------------------------------|
//! | `ImageInput`       | image source / CLI  | classifiers, image-bearing stages |
//! | `StageResult`      | each stage          | later stages' prompt builders     |
//! | `DiagnosticBundle` | completed pipeline  | context store, caller             |
//! | `LatestContext`    | completed pipeline  | follow-up query path              |

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coordination::ArbitrationOutcome;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Stages ───────────────────────────────────────────────────────────────────

/// The four pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    Verify,
    Diagnose,
    Report,
    Advisory,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::Verify,
        StageName::Diagnose,
        StageName::Report,
        StageName::Advisory,
    ];

    /// Whether this stage sends the image alongside its prompt.
    pub fn attaches_image(self) -> bool {
        !matches!(self, Self::Advisory)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verify => write!(f, "Verify"),
            Self::Diagnose => write!(f, "Diagnose"),
            Self::Report => write!(f, "Report"),
            Self::Advisory => write!(f, "Advisory"),
        }
    }
}

/// Text output of one completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub text: String,
}

impl StageResult {
    pub fn new(stage: StageName, text: impl Into<String>) -> Self {
        Self {
            stage,
            text: text.into(),
        }
    }
}

// ── Image ────────────────────────────────────────────────────────────────────

/// Raw image bytes plus the reference they were loaded from.
///
/// Bytes sit behind an `Arc` so every stage can attach the image without
/// copying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub bytes: Arc<Vec<u8>>,
    pub mime_type: String,
    /// URL or path the image came from; stored as the bundle's `image_ref`.
    pub source: String,
}

impl ImageInput {
    /// Wrap bytes, sniffing the MIME type from the file signature.
    pub fn new(bytes: Vec<u8>, source: impl Into<String>) -> Self {
        let mime_type = sniff_mime(&bytes).to_string();
        Self {
            bytes: Arc::new(bytes),
            mime_type,
            source: source.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Best-effort MIME detection from magic bytes. Unrecognised data is sent as PNG.
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/png",
    }
}

// ── Persisted records ────────────────────────────────────────────────────────

/// Complete output of one successful pipeline run. The unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticBundle {
    pub run_id: Uuid,
    pub patient_ref: String,
    pub image_ref: String,
    pub timestamp: DateTime<Utc>,
    pub arbitration: ArbitrationOutcome,
    pub verify_text: String,
    pub diagnosis_text: String,
    pub report_text: String,
    pub advisory_text: String,
}

impl DiagnosticBundle {
    /// The reduced record written to the process-wide latest slot.
    pub fn latest_context(&self) -> LatestContext {
        LatestContext {
            diagnosis_text: self.diagnosis_text.clone(),
            report_text: self.report_text.clone(),
            advisory_text: self.advisory_text.clone(),
        }
    }
}

/// Reduced, overwritable context used by follow-up queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestContext {
    pub diagnosis_text: String,
    pub report_text: String,
    pub advisory_text: String,
}

impl LatestContext {
    /// Render as a prompt context block.
    pub fn render(&self) -> String {
        format!(
            "Diagnosis: {}\n\nDetailed Report: {}\n\nExpert Recommendations: {}",
            self.diagnosis_text, self.report_text, self.advisory_text
        )
    }
}

impl From<&DiagnosticBundle> for LatestContext {
    fn from(bundle: &DiagnosticBundle) -> Self {
        bundle.latest_context()
    }
}
