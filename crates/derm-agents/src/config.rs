//! Runtime configuration for the report pipeline.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (`GOOGLE_API_KEY`, `DERM_MODELS`, ...)
//! 2. Values from the TOML file passed to [`PipelineConfig::load`]
//! 3. Built-in defaults
//!
//! ## Candidate models
//!
//! | Stage     | Default ladder                                             |
//! |-----------|------------------------------------------------------------|
//! | verify    | gemini-2.5-flash-lite → gemini-2.5-flash → gemini-flash-latest |
//! | diagnose  | gemini-2.5-flash → gemini-2.5-pro → gemini-flash-latest    |
//! | report    | gemini-2.5-flash → gemini-2.5-pro → gemini-flash-latest    |
//! | advisory  | gemini-2.5-flash → gemini-2.5-pro → gemini-flash-latest    |
//! | follow-up | gemini-2.5-flash → gemini-2.5-pro → gemini-flash-latest    |

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use coordination::{ModelLadder, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generation::{GenerationConfig, SafetyConfig};
use crate::types::StageName;

const DEFAULT_GENERATION_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const FAST_MODEL: &str = "gemini-2.5-flash-lite";
const STANDARD_MODEL: &str = "gemini-2.5-flash";
const CAPABLE_MODEL: &str = "gemini-2.5-pro";
const GENERIC_MODEL: &str = "gemini-flash-latest";

const ENV_API_KEY: &str = "GOOGLE_API_KEY";
const ENV_GENERATION_URL: &str = "DERM_GENERATION_URL";
const ENV_MODELS: &str = "DERM_MODELS";
const ENV_SEARCH_GROUNDING: &str = "DERM_SEARCH_GROUNDING";
const ENV_MAX_ATTEMPTS: &str = "DERM_MAX_ATTEMPTS_PER_MODEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where and how to reach the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    /// Let report, advisory and follow-up calls use the service's search tool.
    pub search_grounding: bool,
}

impl Default for GenerationEndpoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GENERATION_URL.to_string(),
            api_key: String::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            search_grounding: true,
        }
    }
}

/// Candidate-model ladder per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageModels {
    pub verify: ModelLadder,
    pub diagnose: ModelLadder,
    pub report: ModelLadder,
    pub advisory: ModelLadder,
    pub follow_up: ModelLadder,
}

impl Default for StageModels {
    fn default() -> Self {
        let standard = ModelLadder::new([STANDARD_MODEL, CAPABLE_MODEL, GENERIC_MODEL]);
        Self {
            verify: ModelLadder::new([FAST_MODEL, STANDARD_MODEL, GENERIC_MODEL]),
            diagnose: standard.clone(),
            report: standard.clone(),
            advisory: standard.clone(),
            follow_up: standard,
        }
    }
}

impl StageModels {
    pub fn uniform(ladder: ModelLadder) -> Self {
        Self {
            verify: ladder.clone(),
            diagnose: ladder.clone(),
            report: ladder.clone(),
            advisory: ladder.clone(),
            follow_up: ladder,
        }
    }

    pub fn for_stage(&self, stage: StageName) -> &ModelLadder {
        match stage {
            StageName::Verify => &self.verify,
            StageName::Diagnose => &self.diagnose,
            StageName::Report => &self.report,
            StageName::Advisory => &self.advisory,
        }
    }
}

/// Sampling parameters per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingProfiles {
    pub verify: GenerationConfig,
    pub diagnose: GenerationConfig,
    pub report: GenerationConfig,
    pub advisory: GenerationConfig,
    pub follow_up: GenerationConfig,
}

impl Default for SamplingProfiles {
    fn default() -> Self {
        Self {
            verify: GenerationConfig::new(0.2, 512),
            diagnose: GenerationConfig::new(0.2, 1_024),
            report: GenerationConfig::new(0.4, 8_192),
            advisory: GenerationConfig::new(0.4, 2_048),
            follow_up: GenerationConfig::new(0.5, 2_048),
        }
    }
}

impl SamplingProfiles {
    pub fn for_stage(&self, stage: StageName) -> &GenerationConfig {
        match stage {
            StageName::Verify => &self.verify,
            StageName::Diagnose => &self.diagnose,
            StageName::Report => &self.report,
            StageName::Advisory => &self.advisory,
        }
    }
}

/// Bounded retry for image downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageFetchConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ImageFetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1_000,
            timeout_secs: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl ImageFetchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Top-level configuration, passed explicitly to every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub generation: GenerationEndpoint,
    pub models: StageModels,
    pub sampling: SamplingProfiles,
    pub safety: SafetyConfig,
    pub retry: RetryPolicy,
    pub image_fetch: ImageFetchConfig,
}

impl PipelineConfig {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENV_API_KEY) {
            self.generation.api_key = key;
        }
        if let Some(url) = lookup(ENV_GENERATION_URL) {
            self.generation.base_url = url;
        }
        if let Some(flag) = lookup(ENV_SEARCH_GROUNDING) {
            self.generation.search_grounding =
                matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(models) = lookup(ENV_MODELS) {
            let ladder = ModelLadder::from_csv(&models);
            if !ladder.is_empty() {
                self.models = StageModels::uniform(ladder);
            }
        }
        if let Some(max) = lookup(ENV_MAX_ATTEMPTS).and_then(|v| v.trim().parse().ok()) {
            self.retry.max_attempts_per_model = max;
        }
    }

    /// Validate all sub-configs.
    ///
    /// Empty model ladders pass: the executor reports them as
    /// `NoCandidateModels` when a stage is actually run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let profiles = [
            ("verify", &self.sampling.verify),
            ("diagnose", &self.sampling.diagnose),
            ("report", &self.sampling.report),
            ("advisory", &self.sampling.advisory),
            ("follow_up", &self.sampling.follow_up),
        ];
        for (name, profile) in profiles {
            profile
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("sampling.{name}: {e}")))?;
        }

        if self.generation.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "generation.request_timeout_secs must be > 0".into(),
            ));
        }
        if self.image_fetch.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "image_fetch.max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Fail early when a command needs the generation service but no key is set.
    pub fn require_api_key(&self) -> Result<(), ConfigError> {
        if self.generation.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "{ENV_API_KEY} is not set and generation.api_key is empty"
            )));
        }
        Ok(())
    }
}
