//! Ordered candidate-model ladders.
//!
//! A ladder lists generation models in the order they should be tried:
//! fastest/cheapest first, most capable later, a generic alias last. The
//! order is deployment configuration, not code, so ladders deserialize from a
//! plain list of names.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelLadder {
    models: Vec<String>,
}

impl ModelLadder {
    /// Create a ladder from an ordered list of models. Blank names are dropped.
    pub fn new<I, S>(models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models
                .into_iter()
                .map(|m| {
                    let m: String = m.into();
                    m.trim().to_string()
                })
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Parse a comma-separated list (e.g. from an environment variable).
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }

    /// The ordered list of models.
    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Whether a candidate exists after position `index`.
    pub fn has_next(&self, index: usize) -> bool {
        index + 1 < self.models.len()
    }
}

impl fmt::Display for ModelLadder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.models.join(" -> "))
    }
}
