/// AI backend selection and the classification capability every backend provides.
///
/// A backend choice is a `platform-modelVariant` token such as `openai-gpt-4o-mini`
/// or `gemini-2.0-flash-lite`. The platform must be known; an unknown variant falls
/// back to the platform's default model.
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::config::AiConfig;
use crate::error::{BackendError, ClassifyError, ConfigurationError};
use crate::gemini::GeminiClassifier;
use crate::openai::OpenAiAssistant;

/// Every accepted choice string, in the order they are offered to users.
pub const SUPPORTED_CHOICES: &[&str] = &["openai-gpt-4o-mini", "gemini-2.0-flash-lite"];

pub const DEFAULT_CHOICE: &str = "openai-gpt-4o-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    OpenAi,
    Gemini,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::OpenAi => "openai",
            Platform::Gemini => "gemini",
        }
    }

    /// Environment variable that carries this platform's credential.
    pub fn credential_env(self) -> &'static str {
        match self {
            Platform::OpenAi => "OPENAI_API_KEY",
            Platform::Gemini => "GEMINI_API_KEY",
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Platform::OpenAi => "gpt-4o-mini",
            Platform::Gemini => "gemini-2.0-flash-lite",
        }
    }

    /// `(variant, model name)` pairs accepted after the platform prefix.
    fn variants(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Platform::OpenAi => &[("gpt-4o-mini", "gpt-4o-mini")],
            Platform::Gemini => &[("2.0-flash-lite", "gemini-2.0-flash-lite")],
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "openai" => Some(Platform::OpenAi),
            "gemini" => Some(Platform::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved backend choice: which platform, and which model to ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendChoice {
    pub platform: Platform,
    pub model: String,
}

impl BackendChoice {
    pub fn parse(choice: &str) -> Result<Self, ConfigurationError> {
        let choice = choice.trim();
        let (platform_token, variant) = choice.split_once('-').unwrap_or((choice, ""));

        let platform =
            Platform::from_token(platform_token).ok_or_else(|| ConfigurationError::UnsupportedBackend {
                choice: choice.to_string(),
                supported: SUPPORTED_CHOICES.to_vec(),
            })?;

        let model = match platform
            .variants()
            .iter()
            .find(|(v, _)| v.eq_ignore_ascii_case(variant))
        {
            Some((_, model)) => *model,
            None => {
                warn!(
                    choice,
                    platform = %platform,
                    fallback = platform.default_model(),
                    "unknown model variant, using platform default"
                );
                platform.default_model()
            }
        };

        Ok(Self {
            platform,
            model: model.to_string(),
        })
    }
}

/// One identifier returned by a backend, before it is matched to a record.
///
/// Integers may be legacy positional indices or numeric serial numbers; which one
/// is decided during resolution against a concrete chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Integer(i64),
    Text(String),
}

/// Read the matched identifiers out of a backend's JSON object.
///
/// `serial_numbers` wins over the legacy `indices` key when both are present. An
/// object with neither key yields no identifiers.
pub fn parse_classification(value: &Value) -> Result<Vec<Identifier>, BackendError> {
    let Value::Object(obj) = value else {
        return Err(BackendError::MalformedResponse(format!(
            "expected a JSON object, got {value}"
        )));
    };

    // A key explicitly set to null counts as absent.
    let listed = |key: &'static str| obj.get(key).filter(|v| !v.is_null());
    let (key, list) = match (listed("serial_numbers"), listed("indices")) {
        (Some(list), _) => ("serial_numbers", list),
        (None, Some(list)) => ("indices", list),
        (None, None) => {
            warn!(keys = ?obj.keys().collect::<Vec<_>>(), "model response has neither serial_numbers nor indices");
            return Ok(Vec::new());
        }
    };

    let Value::Array(items) = list else {
        return Err(BackendError::MalformedResponse(format!(
            "`{key}` is not a list"
        )));
    };

    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(Identifier::Text(s.clone())),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Identifier::Integer(i)),
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        Some(Identifier::Integer(f as i64))
                    }
                    _ => Some(Identifier::Text(n.to_string())),
                },
            },
            other => {
                warn!(key, item = %other, "ignoring non-scalar identifier");
                None
            }
        })
        .collect())
}

/// Parse the JSON object embedded in free-form model text, ignoring anything
/// before the first `{` and after the last `}`.
pub fn extract_json_object(text: &str) -> Result<Value, BackendError> {
    let start = text.find('{');
    let end = text.rfind('}');
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|e| BackendError::MalformedResponse(format!("invalid JSON object: {e}"))),
        _ => Err(BackendError::MalformedResponse(
            "no JSON object in model text".to_string(),
        )),
    }
}

/// The classification capability: given a prompt, return the matched identifiers.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn platform(&self) -> Platform;

    async fn classify(&self, prompt: &str, model: &str) -> Result<Vec<Identifier>, ClassifyError>;
}

/// Builds a classifier for a platform. Fails when the platform cannot be used at all.
pub trait BackendFactory: Send + Sync {
    fn build(&self, platform: Platform) -> Result<Box<dyn Classifier>, ConfigurationError>;
}

impl BackendFactory for AiConfig {
    fn build(&self, platform: Platform) -> Result<Box<dyn Classifier>, ConfigurationError> {
        let missing = || ConfigurationError::MissingCredential {
            platform: platform.to_string(),
            env_var: platform.credential_env(),
        };
        match platform {
            Platform::OpenAi => {
                let config = self.openai.clone().ok_or_else(missing)?;
                Ok(Box::new(OpenAiAssistant::new(config, self.http.clone())?))
            }
            Platform::Gemini => {
                let config = self.gemini.clone().ok_or_else(missing)?;
                Ok(Box::new(GeminiClassifier::new(config, self.http.clone())?))
            }
        }
    }
}
