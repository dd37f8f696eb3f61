use std::time::Duration;

use tracing::warn;

use crate::error::ConfigurationError;

const DEFAULT_UPSTREAM_URL: &str =
    "https://apis.data.go.kr/B552735/kisedKstartupService01/getAnnouncementInformation01";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub const DEFAULT_PER_PAGE: u32 = 30;
pub const DEFAULT_CHUNK_SIZE: usize = 50;
const DEBUG_PER_PAGE: u32 = 1;
const DEBUG_ITEM_CAP: usize = 5;

/// Process configuration, built once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub ai: AiConfig,
}

/// Upstream announcement API settings.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub service_key: String,
    pub per_page: u32,
    /// Total item limit. Set only in debug mode.
    pub item_cap: Option<usize>,
    pub timeout: Duration,
}

/// Credentials and tuning for the AI backends. A platform whose credential is absent
/// is `None` here and is rejected only when selected.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub openai: Option<OpenAiConfig>,
    pub gemini: Option<GeminiConfig>,
    pub http: HttpPolicy,
    pub chunk_size: usize,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            openai: None,
            gemini: None,
            http: HttpPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    /// Reuse an existing assistant instead of creating one on first use.
    pub assistant_id: Option<String>,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
}

// Keys stay out of logs.
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("per_page", &self.per_page)
            .field("item_cap", &self.item_cap)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("assistant_id", &self.assistant_id)
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_attempts", &self.max_poll_attempts)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Timeout and retry policy for backend HTTP calls.
#[derive(Debug, Clone)]
pub struct HttpPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_body_bytes: usize,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(5_000),
            max_error_body_bytes: 8 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Required:
    /// - `PUBLIC_DATA_API_KEY`: upstream service key
    ///
    /// Optional:
    /// - `DEBUG=true`: page size 1, at most 5 items
    /// - `PER_PAGE_FOR_API`, `PUBLIC_DATA_BASE_URL`, `UPSTREAM_TIMEOUT_SECS`
    /// - `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_ASSISTANT_ID`,
    ///   `OPENAI_POLL_INTERVAL_MS`, `OPENAI_MAX_POLL_ATTEMPTS`
    /// - `GEMINI_API_KEY`, `GEMINI_BASE_URL`
    /// - `AI_TIMEOUT_SECS`, `AI_MAX_RETRIES`, `AI_RETRY_INITIAL_MS`, `AI_RETRY_MAX_MS`
    /// - `FILTER_CHUNK_SIZE`
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigurationError> {
        let env = Env(&lookup);

        let service_key = env
            .string("PUBLIC_DATA_API_KEY")
            .ok_or_else(|| ConfigurationError::MissingCredential {
                platform: "public-data".to_string(),
                env_var: "PUBLIC_DATA_API_KEY",
            })?;

        let debug = env
            .string("DEBUG")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let (per_page, item_cap) = if debug {
            warn!(
                per_page = DEBUG_PER_PAGE,
                item_cap = DEBUG_ITEM_CAP,
                "DEBUG mode: fetching a capped number of announcements"
            );
            (DEBUG_PER_PAGE, Some(DEBUG_ITEM_CAP))
        } else {
            (
                env.parsed("PER_PAGE_FOR_API", DEFAULT_PER_PAGE, |n: &u32| *n > 0),
                None,
            )
        };

        let upstream = UpstreamConfig {
            base_url: env
                .string("PUBLIC_DATA_BASE_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            service_key,
            per_page,
            item_cap,
            timeout: Duration::from_secs(env.parsed("UPSTREAM_TIMEOUT_SECS", 30, |_| true)),
        };

        let openai = env.string("OPENAI_API_KEY").map(|api_key| OpenAiConfig {
            api_key,
            base_url: trimmed_url(env.string("OPENAI_BASE_URL"), DEFAULT_OPENAI_URL),
            assistant_id: env.string("OPENAI_ASSISTANT_ID"),
            poll_interval: Duration::from_millis(env.parsed(
                "OPENAI_POLL_INTERVAL_MS",
                1_000,
                |n: &u64| *n > 0,
            )),
            max_poll_attempts: env.parsed("OPENAI_MAX_POLL_ATTEMPTS", 120, |n: &u32| *n > 0),
        });

        let gemini = env.string("GEMINI_API_KEY").map(|api_key| GeminiConfig {
            api_key,
            base_url: trimmed_url(env.string("GEMINI_BASE_URL"), DEFAULT_GEMINI_URL),
        });

        let defaults = HttpPolicy::default();
        let http = HttpPolicy {
            timeout: Duration::from_secs(env.parsed(
                "AI_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
                |n: &u64| *n > 0,
            )),
            max_retries: env.parsed("AI_MAX_RETRIES", defaults.max_retries, |_| true),
            initial_backoff: Duration::from_millis(env.parsed(
                "AI_RETRY_INITIAL_MS",
                defaults.initial_backoff.as_millis() as u64,
                |_| true,
            )),
            max_backoff: Duration::from_millis(env.parsed(
                "AI_RETRY_MAX_MS",
                defaults.max_backoff.as_millis() as u64,
                |_| true,
            )),
            ..defaults
        };

        Ok(Self {
            upstream,
            ai: AiConfig {
                openai,
                gemini,
                http,
                chunk_size: env.parsed("FILTER_CHUNK_SIZE", DEFAULT_CHUNK_SIZE, |n: &usize| *n > 0),
            },
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-blank value of a variable.
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parsed value of a variable. Unparseable or rejected values fall back to
    /// `default` with a warning.
    fn parsed<T>(&self, name: &str, default: T, valid: impl Fn(&T) -> bool) -> T
    where
        T: std::str::FromStr + std::fmt::Display,
    {
        let Some(raw) = self.string(name) else {
            return default;
        };
        match raw.parse::<T>() {
            Ok(v) if valid(&v) => v,
            _ => {
                warn!(var = name, value = %raw, default = %default, "invalid value, using default");
                default
            }
        }
    }
}

fn trimmed_url(value: Option<String>, default: &str) -> String {
    value
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}
