//! Classifier results and primary/secondary arbitration.
//!
//! Two independent image classifiers each produce a [`ClassificationResult`].
//! [`arbitrate`] orders them by confidence so that every prompt sees the
//! stronger opinion first.
//!
//! ```text
//! a.confidence >  b.confidence  → primary = a, secondary = b
//! b.confidence >  a.confidence  → primary = b, secondary = a
//! a.confidence == b.confidence  → primary = a, secondary = b
//! ```
//!
//! Ties always favour the first-listed classifier so that identical inputs
//! produce identical prompts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Reasons a raw classifier output is rejected before arbitration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassificationInvalid {
    #[error("classification label is empty")]
    EmptyLabel,

    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),

    #[error("malformed classification: {0}")]
    Malformed(String),
}

/// One classifier's verdict for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Predicted condition (e.g. `"Melanoma"`).
    #[serde(alias = "class")]
    pub label: String,
    /// Softmax probability of `label`, in `[0, 1]`.
    pub confidence: f64,
}

impl ClassificationResult {
    /// Build a result without validation. Use [`Self::validated`] for
    /// untrusted input.
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// Build a result, rejecting empty labels and confidences outside `[0, 1]`
    /// (NaN included).
    pub fn validated(
        label: impl Into<String>,
        confidence: f64,
    ) -> Result<Self, ClassificationInvalid> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(ClassificationInvalid::EmptyLabel);
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ClassificationInvalid::ConfidenceOutOfRange(confidence));
        }
        Ok(Self { label, confidence })
    }

    /// Re-check an already-constructed result (e.g. one deserialized from a
    /// model server response).
    pub fn validate(self) -> Result<Self, ClassificationInvalid> {
        Self::validated(self.label, self.confidence)
    }
}

impl fmt::Display for ClassificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (confidence {:.2})", self.label, self.confidence)
    }
}

fn malformed_pair(s: &str) -> ClassificationInvalid {
    ClassificationInvalid::Malformed(format!("expected <label>=<confidence>, got {s:?}"))
}

/// Parses the CLI form `<label>=<confidence>`, e.g. `"Benign keratosis=0.64"`.
///
/// The split happens on the last `=` so labels may contain `=`.
impl FromStr for ClassificationResult {
    type Err = ClassificationInvalid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (label, confidence) = s
            .rsplit_once('=')
            .ok_or_else(|| malformed_pair(s))?;
        let confidence: f64 = confidence.trim().parse().map_err(|_| malformed_pair(s))?;
        Self::validated(label.trim(), confidence)
    }
}

/// Ordered pair of classifier results for a single request.
///
/// `primary.confidence >= secondary.confidence` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationOutcome {
    pub primary: ClassificationResult,
    pub secondary: ClassificationResult,
}

impl ArbitrationOutcome {
    /// Confidence gap between the two opinions.
    pub fn margin(&self) -> f64 {
        self.primary.confidence - self.secondary.confidence
    }

    /// Whether both classifiers named the same condition.
    pub fn labels_agree(&self) -> bool {
        self.primary
            .label
            .trim()
            .eq_ignore_ascii_case(self.secondary.label.trim())
    }
}

/// Combine two classifier results into a primary/secondary ordering.
pub fn arbitrate(a: ClassificationResult, b: ClassificationResult) -> ArbitrationOutcome {
    let outcome = if b.confidence > a.confidence {
        ArbitrationOutcome {
            primary: b,
            secondary: a,
        }
    } else {
        ArbitrationOutcome {
            primary: a,
            secondary: b,
        }
    };

    debug!(
        primary = %outcome.primary.label,
        primary_confidence = outcome.primary.confidence,
        secondary = %outcome.secondary.label,
        secondary_confidence = outcome.secondary.confidence,
        "classifier arbitration"
    );
    outcome
}
