//! Generation-service contract and request types.
//!
//! The orchestrator only needs one capability from a text/image generation
//! backend: turn a prompt (optionally with an image) into text on a named
//! model. [`GenerationService`] is that seam; [`crate::gemini::GeminiClient`]
//! is the production implementation and tests substitute scripted fakes.

use async_trait::async_trait;
use coordination::ModelLadder;
use serde::{Deserialize, Serialize};

use crate::errors::GenerationError;
use crate::types::ImageInput;

// ── Sampling / safety ────────────────────────────────────────────────────────

/// Sampling parameters forwarded to the generation service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Sampling randomness.
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    /// Truncation bound on the response.
    pub max_output_tokens: Option<u32>,
}

impl GenerationConfig {
    pub fn new(temperature: f32, max_output_tokens: u32) -> Self {
        Self {
            temperature: Some(temperature),
            top_p: Some(0.95),
            top_k: Some(40),
            max_output_tokens: Some(max_output_tokens),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature must be in [0, 2], got {t}"));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("top_p must be in [0, 1], got {p}"));
            }
        }
        if self.top_k == Some(0) {
            return Err("top_k must be > 0".to_string());
        }
        if self.max_output_tokens == Some(0) {
            return Err("max_output_tokens must be > 0".to_string());
        }
        Ok(())
    }
}

/// Content-filter categories understood by the generation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarmCategory {
    Harassment,
    HateSpeech,
    SexuallyExplicit,
    DangerousContent,
}

impl HarmCategory {
    pub const ALL: [HarmCategory; 4] = [
        HarmCategory::Harassment,
        HarmCategory::HateSpeech,
        HarmCategory::SexuallyExplicit,
        HarmCategory::DangerousContent,
    ];

    pub fn api_name(self) -> &'static str {
        match self {
            Self::Harassment => "HARM_CATEGORY_HARASSMENT",
            Self::HateSpeech => "HARM_CATEGORY_HATE_SPEECH",
            Self::SexuallyExplicit => "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            Self::DangerousContent => "HARM_CATEGORY_DANGEROUS_CONTENT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarmThreshold {
    BlockNone,
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

impl HarmThreshold {
    pub fn api_name(self) -> &'static str {
        match self {
            Self::BlockNone => "BLOCK_NONE",
            Self::BlockOnlyHigh => "BLOCK_ONLY_HIGH",
            Self::BlockMediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
            Self::BlockLowAndAbove => "BLOCK_LOW_AND_ABOVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmThreshold,
}

/// Per-category content filter thresholds.
///
/// Clinical images and treatment discussion trip default filters, so the
/// deployment default is `BLOCK_NONE` everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SafetyConfig {
    pub settings: Vec<SafetySetting>,
}

impl SafetyConfig {
    pub fn permissive() -> Self {
        Self::uniform(HarmThreshold::BlockNone)
    }

    pub fn uniform(threshold: HarmThreshold) -> Self {
        Self {
            settings: HarmCategory::ALL
                .iter()
                .map(|&category| SafetySetting {
                    category,
                    threshold,
                })
                .collect(),
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self::permissive()
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

/// Instruction, user message and optional image for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// System-level instruction (role, output format).
    pub instruction: String,
    /// User turn.
    pub message: String,
    pub image: Option<ImageInput>,
}

impl Prompt {
    pub fn text(instruction: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            message: message.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.image = Some(image);
        self
    }
}

/// One logical generation request, built fresh per stage and not mutated
/// after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    pub candidates: ModelLadder,
    pub generation_config: GenerationConfig,
    pub safety: SafetyConfig,
    /// Ask the service to ground the answer with its search tool.
    pub use_search: bool,
    /// Label for logs and telemetry (stage name, "follow_up", ...).
    pub label: String,
}

impl GenerationRequest {
    pub fn new(prompt: Prompt, candidates: ModelLadder) -> Self {
        Self {
            prompt,
            candidates,
            generation_config: GenerationConfig::default(),
            safety: SafetyConfig::permissive(),
            use_search: false,
            label: String::new(),
        }
    }

    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation_config = config;
        self
    }

    pub fn with_safety(mut self, safety: SafetyConfig) -> Self {
        self.safety = safety;
        self
    }

    pub fn with_search(mut self, use_search: bool) -> Self {
        self.use_search = use_search;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A text/image generation backend addressed by model name.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Run `request` once against `model`. No retries happen here.
    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError>;
}
