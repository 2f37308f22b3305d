//! Gemini `generateContent` client.
//!
//! Speaks the REST API directly with `reqwest` so HTTP status and the error
//! envelope's `status` field are both available for classification:
//!
//! | Signal                                          | Class       |
//! |-------------------------------------------------|-------------|
//! | 429, `RESOURCE_EXHAUSTED`                       | `Quota`     |
//! | 404, `NOT_FOUND`                                | `NotFound`  |
//! | 408, 500, 502, 503, 504, timeouts, connect errs | `Transient` |
//! | empty/blocked candidates, anything else         | `Unknown`   |

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GenerationEndpoint;
use crate::errors::GenerationError;
use crate::generation::{GenerationConfig, GenerationRequest, GenerationService, SafetyConfig};

const API_KEY_HEADER: &str = "x-goog-api-key";
/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(endpoint: &GenerationEndpoint) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.request_timeout_secs))
            .build()
            .context("Failed to build generation HTTP client")?;
        Ok(Self {
            http,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
        })
    }

    fn generate_url(&self, model: &str) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    /// Models available to this key that support `generateContent`.
    pub async fn list_models(&self) -> Result<Vec<String>, GenerationError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .http
                .get(format!("{}/models", self.base_url))
                .header(API_KEY_HEADER, &self.api_key)
                .query(&[("pageSize", "1000")]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let resp = req.send().await.map_err(classify_transport)?;
            let status = resp.status().as_u16();
            let body = resp.text().await.map_err(classify_transport)?;
            if !(200..300).contains(&status) {
                return Err(classify_status(status, &body));
            }

            let page: ModelsPage = serde_json::from_str(&body)
                .map_err(|e| GenerationError::Unknown(format!("malformed model list: {e}")))?;
            names.extend(
                page.models
                    .into_iter()
                    .filter(|m| {
                        m.supported_generation_methods
                            .iter()
                            .any(|method| method == "generateContent")
                    })
                    .map(|m| m.name.trim_start_matches("models/").to_string()),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<String, GenerationError> {
        let body = WireRequest::from_request(request);
        debug!(
            model,
            label = %request.label,
            has_image = request.prompt.image.is_some(),
            search = request.use_search,
            "generateContent"
        );

        let resp = self
            .http
            .post(self.generate_url(model))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(classify_transport)?;
        if !(200..300).contains(&status) {
            return Err(classify_status(status, &text));
        }

        let parsed: WireResponse = serde_json::from_str(&text)
            .map_err(|e| GenerationError::Unknown(format!("malformed response: {e}")))?;
        parsed.into_text()
    }
}

// ── Classification ───────────────────────────────────────────────────────────

/// Classify a transport-level failure from `reqwest`.
pub fn classify_transport(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        GenerationError::Transient(err.to_string())
    } else {
        GenerationError::Unknown(err.to_string())
    }
}

/// Classify a non-2xx response by status code and error envelope.
pub fn classify_status(status: u16, body: &str) -> GenerationError {
    let envelope: Option<ErrorEnvelope> = serde_json::from_str(body).ok();
    let (api_status, message) = match envelope {
        Some(env) => (env.error.status.unwrap_or_default(), env.error.message),
        None => (String::new(), truncate(body, MAX_ERROR_BODY)),
    };
    let message = format!("HTTP {status}: {message}");

    match (status, api_status.as_str()) {
        (429, _) | (_, "RESOURCE_EXHAUSTED") => GenerationError::Quota(message),
        (404, _) | (_, "NOT_FOUND") => GenerationError::NotFound(message),
        (408 | 500 | 502 | 503 | 504, _)
        | (_, "UNAVAILABLE" | "DEADLINE_EXCEEDED" | "INTERNAL") => {
            GenerationError::Transient(message)
        }
        _ => GenerationError::Unknown(message),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

// ── Wire format ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    contents: Vec<WireContent<'a>>,
    generation_config: WireGenerationConfig,
    safety_settings: Vec<WireSafetySetting>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum WirePart<'a> {
    Text(&'a str),
    InlineData {
        #[serde(rename = "mimeType")]
        mime_type: &'a str,
        data: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

impl From<&GenerationConfig> for WireGenerationConfig {
    fn from(c: &GenerationConfig) -> Self {
        Self {
            temperature: c.temperature,
            top_p: c.top_p,
            top_k: c.top_k,
            max_output_tokens: c.max_output_tokens,
        }
    }
}

#[derive(Serialize)]
struct WireSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

fn wire_safety(safety: &SafetyConfig) -> Vec<WireSafetySetting> {
    safety
        .settings
        .iter()
        .map(|s| WireSafetySetting {
            category: s.category.api_name(),
            threshold: s.threshold.api_name(),
        })
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool {
    google_search: serde_json::Map<String, serde_json::Value>,
}

impl<'a> WireRequest<'a> {
    fn from_request(request: &'a GenerationRequest) -> Self {
        let prompt = &request.prompt;
        let system_instruction = (!prompt.instruction.is_empty()).then(|| WireContent {
            role: None,
            parts: vec![WirePart::Text(&prompt.instruction)],
        });

        let mut parts = vec![WirePart::Text(&prompt.message)];
        if let Some(image) = &prompt.image {
            parts.push(WirePart::InlineData {
                mime_type: &image.mime_type,
                data: BASE64.encode(image.bytes.as_slice()),
            });
        }

        let tools = if request.use_search {
            vec![WireTool {
                google_search: serde_json::Map::new(),
            }]
        } else {
            Vec::new()
        };

        Self {
            system_instruction,
            contents: vec![WireContent {
                role: Some("user"),
                parts,
            }],
            generation_config: (&request.generation_config).into(),
            safety_settings: wire_safety(&request.safety),
            tools,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default)]
    prompt_feedback: Option<WirePromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireResponseContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseContent {
    #[serde(default)]
    parts: Vec<WireResponsePart>,
}

#[derive(Deserialize)]
struct WireResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl WireResponse {
    fn into_text(self) -> Result<String, GenerationError> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(GenerationError::Unknown(format!("prompt blocked: {reason}")));
        }

        let Some(candidate) = self.candidates.into_iter().next() else {
            return Err(GenerationError::Unknown("response has no candidates".into()));
        };
        let finish_reason = candidate.finish_reason.unwrap_or_default();
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(GenerationError::Unknown(format!(
                "empty response (finish reason: {})",
                if finish_reason.is_empty() {
                    "none"
                } else {
                    finish_reason.as_str()
                }
            )));
        }
        Ok(text)
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelsPage {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}
