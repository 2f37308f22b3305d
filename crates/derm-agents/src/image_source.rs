//! Input image acquisition.
//!
//! Remote images are fetched with a fixed number of attempts and a fixed
//! delay between them. Local files are read once.

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::ImageFetchConfig;
use crate::errors::ImageFetchError;
use crate::types::ImageInput;

#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Load the image at `reference` (URL or path).
    async fn fetch(&self, reference: &str) -> Result<ImageInput, ImageFetchError>;
}

/// HTTP(S) image source with bounded retry.
pub struct HttpImageSource {
    http: reqwest::Client,
    config: ImageFetchConfig,
}

impl HttpImageSource {
    pub fn new(config: ImageFetchConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build image HTTP client")?;
        Ok(Self { http, config })
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<ImageInput, ImageFetchError> {
        let bytes = fetch_with_retry(
            url,
            self.config.max_attempts,
            self.config.retry_delay(),
            || self.fetch_once(url),
        )
        .await?;
        if bytes.is_empty() {
            return Err(ImageFetchError::Empty {
                url: url.to_string(),
            });
        }
        let image = ImageInput::new(bytes, url);
        debug!(url, bytes = image.len(), mime = %image.mime_type, "Fetched image");
        Ok(image)
    }
}

/// Run `op` up to `max_attempts` times, sleeping `delay` between failures.
pub async fn fetch_with_retry<F, Fut>(
    url: &str,
    max_attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<Vec<u8>, ImageFetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<u8>, String>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(bytes) => return Ok(bytes),
            Err(message) if attempt >= max_attempts => {
                warn!(url, attempts = attempt, error = %message, "Image fetch failed");
                return Err(ImageFetchError::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    message,
                });
            }
            Err(message) => {
                warn!(url, attempt, max_attempts, error = %message, "Image fetch failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Reads images from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageSource;

#[async_trait]
impl ImageSource for FileImageSource {
    async fn fetch(&self, path: &str) -> Result<ImageInput, ImageFetchError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ImageFetchError::File {
                path: path.to_string(),
                source,
            })?;
        if bytes.is_empty() {
            return Err(ImageFetchError::Empty {
                url: path.to_string(),
            });
        }
        Ok(ImageInput::new(bytes, path))
    }
}

/// Dispatches on the reference: `http://` and `https://` go over the
/// network, anything else is a file path.
pub struct AnyImageSource {
    http: HttpImageSource,
    file: FileImageSource,
}

impl AnyImageSource {
    pub fn new(config: ImageFetchConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpImageSource::new(config)?,
            file: FileImageSource,
        })
    }
}

#[async_trait]
impl ImageSource for AnyImageSource {
    async fn fetch(&self, reference: &str) -> Result<ImageInput, ImageFetchError> {
        if is_remote(reference) {
            self.http.fetch(reference).await
        } else {
            self.file.fetch(reference).await
        }
    }
}

fn is_remote(reference: &str) -> bool {
    let lower = reference.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
