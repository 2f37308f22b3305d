//! Image classifiers that seed the pipeline.
//!
//! Two independent classifiers score the image; their results are arbitrated
//! in `coordination::arbitrate` before any generation happens. Classifier
//! failures are never retried here.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use coordination::ClassificationResult;
use tracing::debug;

use crate::errors::ClassificationError;
use crate::types::ImageInput;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        "classifier"
    }

    async fn classify(&self, image: &ImageInput) -> Result<ClassificationResult, ClassificationError>;
}

/// Model-serving endpoint that takes raw image bytes and answers
/// `{"class": "...", "confidence": 0.0..1.0}` (`"label"` is accepted too).
pub struct HttpClassifier {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("Failed to build classifier HTTP client")?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, image: &ImageInput) -> Result<ClassificationResult, ClassificationError> {
        let resp = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, &image.mime_type)
            .body(image.bytes.as_ref().clone())
            .send()
            .await
            .map_err(|e| ClassificationError::Request {
                classifier: self.name.clone(),
                message: e.to_string(),
            })?;

        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| ClassificationError::Request {
            classifier: self.name.clone(),
            message: e.to_string(),
        })?;
        let result = parse_response(&self.name, status, &body)?;
        debug!(classifier = %self.name, label = %result.label, confidence = result.confidence, "Classified image");
        Ok(result)
    }
}

/// Turn a classifier HTTP response into a validated result.
pub fn parse_response(
    classifier: &str,
    status: u16,
    body: &str,
) -> Result<ClassificationResult, ClassificationError> {
    if !(200..300).contains(&status) {
        return Err(ClassificationError::Status {
            classifier: classifier.to_string(),
            status,
            body: body.chars().take(256).collect(),
        });
    }
    let raw: ClassificationResult =
        serde_json::from_str(body).map_err(|e| ClassificationError::Invalid {
            classifier: classifier.to_string(),
            source: coordination::ClassificationInvalid::Malformed(e.to_string()),
        })?;
    raw.validate().map_err(|source| ClassificationError::Invalid {
        classifier: classifier.to_string(),
        source,
    })
}

/// Returns a fixed, pre-computed result. Used when scores come from outside
/// the process (CLI `--primary/--secondary`).
#[derive(Debug, Clone)]
pub struct StaticClassifier {
    name: String,
    result: ClassificationResult,
}

impl StaticClassifier {
    pub fn new(name: impl Into<String>, result: ClassificationResult) -> Self {
        Self {
            name: name.into(),
            result,
        }
    }
}

#[async_trait]
impl Classifier for StaticClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn classify(&self, _image: &ImageInput) -> Result<ClassificationResult, ClassificationError> {
        Ok(self.result.clone())
    }
}
