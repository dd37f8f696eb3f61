/// OpenAI Assistants backend.
///
/// Classification is an asynchronous job: post the prompt as a new thread, start a
/// run against the filtering assistant, poll the run at a fixed interval until it
/// reaches a terminal state, then read the newest assistant message. A run that ends
/// in anything but `completed` matches nothing.
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::backend::{extract_json_object, parse_classification, Classifier, Identifier, Platform};
use crate::config::{HttpPolicy, OpenAiConfig};
use crate::error::{BackendError, ClassifyError, ConfigurationError};
use crate::http::{parse_json_response, request_with_retry};

const ASSISTANTS_BETA: &str = "assistants=v2";
const ASSISTANT_NAME: &str = "announcement-filter";
const ASSISTANT_INSTRUCTIONS: &str = "You screen startup grant announcements against a user's \
conditions. Answer only with a JSON object of the form {\"serial_numbers\": [...]} listing the \
serial numbers of the matching announcements.";
const MESSAGE_PAGE_SIZE: u32 = 20;

pub struct OpenAiAssistant {
    config: OpenAiConfig,
    policy: HttpPolicy,
    http: reqwest::Client,
    assistant_id: OnceCell<String>,
}

impl OpenAiAssistant {
    pub fn new(config: OpenAiConfig, policy: HttpPolicy) -> Result<Self, ConfigurationError> {
        let http = reqwest::Client::builder()
            .user_agent("announce-ingest")
            .build()
            .map_err(ConfigurationError::HttpClient)?;
        let assistant_id = OnceCell::new_with(config.assistant_id.clone());
        Ok(Self {
            config,
            policy,
            http,
            assistant_id,
        })
    }

    /// The configured assistant, or one created on first use and reused afterwards.
    async fn assistant_id(&self, model: &str) -> Result<String, ClassifyError> {
        self.assistant_id
            .get_or_try_init(|| async {
                let created: Created = self
                    .post(
                        "/assistants",
                        &NewAssistant {
                            model,
                            name: ASSISTANT_NAME,
                            instructions: ASSISTANT_INSTRUCTIONS,
                            response_format: ResponseFormat {
                                kind: "json_object",
                            },
                        },
                    )
                    .await?;
                info!(assistant_id = %created.id, model, "created filtering assistant");
                Ok::<_, ClassifyError>(created.id)
            })
            .await
            .cloned()
    }

    async fn wait_for_run(&self, thread_id: &str, mut run: Run) -> Result<Run, ClassifyError> {
        let mut attempts: u32 = 0;
        while !is_terminal(&run.status) {
            if attempts >= self.config.max_poll_attempts {
                return Err(BackendError::PollTimeout {
                    run_id: run.id,
                    status: run.status,
                    attempts,
                }
                .into());
            }
            tokio::time::sleep(self.config.poll_interval).await;
            attempts += 1;
            run = self
                .get(&format!("/threads/{thread_id}/runs/{}", run.id))
                .await?;
            debug!(run_id = %run.id, status = %run.status, attempts, "polled run");
        }
        Ok(run)
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ClassifyError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.config.base_url);
        request_with_retry(&self.policy, Platform::OpenAi, || async {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .header("OpenAI-Beta", ASSISTANTS_BETA)
                .timeout(self.policy.timeout)
                .json(body)
                .send()
                .await?;
            parse_json_response(resp, Platform::OpenAi, self.policy.max_error_body_bytes).await
        })
        .await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClassifyError> {
        let url = format!("{}{path}", self.config.base_url);
        request_with_retry(&self.policy, Platform::OpenAi, || async {
            let resp = self
                .http
                .get(&url)
                .bearer_auth(&self.config.api_key)
                .header("OpenAI-Beta", ASSISTANTS_BETA)
                .timeout(self.policy.timeout)
                .send()
                .await?;
            parse_json_response(resp, Platform::OpenAi, self.policy.max_error_body_bytes).await
        })
        .await
    }
}

#[async_trait]
impl Classifier for OpenAiAssistant {
    fn platform(&self) -> Platform {
        Platform::OpenAi
    }

    async fn classify(&self, prompt: &str, model: &str) -> Result<Vec<Identifier>, ClassifyError> {
        let assistant_id = self.assistant_id(model).await?;

        let thread: Created = self
            .post(
                "/threads",
                &NewThread {
                    messages: vec![NewMessage {
                        role: "user",
                        content: prompt,
                    }],
                },
            )
            .await?;

        let run: Run = self
            .post(
                &format!("/threads/{}/runs", thread.id),
                &NewRun {
                    assistant_id: &assistant_id,
                    model,
                },
            )
            .await?;
        debug!(thread_id = %thread.id, run_id = %run.id, status = %run.status, "run started");

        let run = self.wait_for_run(&thread.id, run).await?;
        if run.status != "completed" {
            warn!(
                run_id = %run.id,
                status = %run.status,
                reason = run.last_error.as_ref().and_then(|e| e.message.as_deref()).unwrap_or(""),
                "run did not complete, treating as no matches"
            );
            return Ok(Vec::new());
        }

        let messages: MessageList = self
            .get(&format!(
                "/threads/{}/messages?order=desc&limit={MESSAGE_PAGE_SIZE}",
                thread.id
            ))
            .await?;
        let text = latest_assistant_text(&messages).ok_or(BackendError::EmptyResponse)?;
        let value = extract_json_object(&text)?;
        Ok(parse_classification(&value)?)
    }
}

fn is_terminal(status: &str) -> bool {
    matches!(
        status,
        "completed" | "failed" | "cancelled" | "expired" | "incomplete" | "requires_action"
    )
}

/// Text of the newest assistant message. `messages` is expected newest-first.
fn latest_assistant_text(messages: &MessageList) -> Option<String> {
    let message = messages.data.iter().find(|m| m.role == "assistant")?;
    let text: String = message
        .content
        .iter()
        .filter(|c| c.kind == "text")
        .filter_map(|c| c.text.as_ref().map(|t| t.value.as_str()))
        .collect::<Vec<_>>()
        .join("\n");
    (!text.trim().is_empty()).then_some(text)
}

#[derive(Debug, Serialize)]
struct NewAssistant<'a> {
    model: &'a str,
    name: &'a str,
    instructions: &'a str,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct NewThread<'a> {
    messages: Vec<NewMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct NewMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct NewRun<'a> {
    assistant_id: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Run {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Clone, Deserialize)]
struct RunError {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}
