/// Gemini `generateContent` backend.
///
/// One synchronous call per chunk, constrained to JSON output with a fixed response
/// schema and low-variance sampling, so the reply text is parsed as JSON directly.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::{parse_classification, Classifier, Identifier, Platform};
use crate::config::{GeminiConfig, HttpPolicy};
use crate::error::{BackendError, ClassifyError, ConfigurationError};
use crate::http::{parse_json_response, request_with_retry};

const TEMPERATURE: f32 = 0.1;
const TOP_P: f32 = 0.95;

pub struct GeminiClassifier {
    config: GeminiConfig,
    policy: HttpPolicy,
    http: reqwest::Client,
}

impl GeminiClassifier {
    pub fn new(config: GeminiConfig, policy: HttpPolicy) -> Result<Self, ConfigurationError> {
        let http = reqwest::Client::builder()
            .user_agent("announce-ingest")
            .build()
            .map_err(ConfigurationError::HttpClient)?;
        Ok(Self {
            config,
            policy,
            http,
        })
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    fn platform(&self) -> Platform {
        Platform::Gemini
    }

    async fn classify(&self, prompt: &str, model: &str) -> Result<Vec<Identifier>, ClassifyError> {
        let url = format!("{}/models/{model}:generateContent", self.config.base_url);
        let request = GenerateContentRequest::new(prompt);

        let response: GenerateContentResponse =
            request_with_retry(&self.policy, Platform::Gemini, || async {
                let resp = self
                    .http
                    .post(&url)
                    .header("x-goog-api-key", &self.config.api_key)
                    .timeout(self.policy.timeout)
                    .json(&request)
                    .send()
                    .await?;
                parse_json_response(resp, Platform::Gemini, self.policy.max_error_body_bytes).await
            })
            .await?;

        let text = response.text().ok_or_else(|| {
            if let Some(reason) = response.block_reason() {
                warn!(model, reason, "prompt was blocked");
            }
            BackendError::EmptyResponse
        })?;
        debug!(model, chars = text.len(), "gemini response received");

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::MalformedResponse(format!("response is not JSON: {e}")))?;
        Ok(parse_classification(&value)?)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

impl<'a> GenerateContentRequest<'a> {
    fn new(prompt: &'a str) -> Self {
        Self {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                top_p: TOP_P,
                response_mime_type: "application/json",
                response_schema: json!({
                    "type": "OBJECT",
                    "properties": {
                        "serial_numbers": {
                            "type": "ARRAY",
                            "items": {"type": "STRING"}
                        }
                    },
                    "required": ["serial_numbers"]
                }),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    response_mime_type: &'static str,
    response_schema: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate.
    fn text(&self) -> Option<String> {
        let parts = &self.candidates.first()?.content.as_ref()?.parts;
        let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
        (!text.trim().is_empty()).then_some(text)
    }

    fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback.as_ref()?.block_reason.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}
