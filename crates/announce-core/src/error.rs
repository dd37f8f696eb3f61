/// Error types shared by the filtering pipeline and its AI backends.
///
/// Configuration-class errors abort a whole filtering run. Backend-class errors are
/// scoped to a single chunk: the chunk contributes nothing and the run moves on.
/// Page fetch errors live next to the fetcher in `fetch.rs`.
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{platform} credential is not configured (set {env_var})")]
    MissingCredential {
        platform: String,
        env_var: &'static str,
    },

    #[error("unsupported AI backend '{choice}' (supported: {})", supported.join(", "))]
    UnsupportedBackend {
        choice: String,
        supported: Vec<&'static str>,
    },

    #[error("{platform} rejected the configured credential: status={status}")]
    RejectedCredential { platform: String, status: StatusCode },

    #[error("failed to initialise HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned error: status={status} body={body}")]
    Upstream { status: StatusCode, body: String },

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("model response contained no text")]
    EmptyResponse,

    #[error("run {run_id} still '{status}' after {attempts} polls")]
    PollTimeout {
        run_id: String,
        status: String,
        attempts: u32,
    },
}

/// Failure of one `classify` call, split by how far it propagates.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<reqwest::Error> for ClassifyError {
    fn from(e: reqwest::Error) -> Self {
        ClassifyError::Backend(BackendError::Transport(e))
    }
}

impl From<serde_json::Error> for ClassifyError {
    fn from(e: serde_json::Error) -> Self {
        ClassifyError::Backend(BackendError::MalformedResponse(e.to_string()))
    }
}
