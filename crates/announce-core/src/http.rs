/// HTTP plumbing shared by the AI backends: status mapping, bounded error bodies,
/// and retry with exponential backoff for transient failures.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::backend::Platform;
use crate::config::HttpPolicy;
use crate::error::{BackendError, ClassifyError, ConfigurationError};

/// Decode a successful response, or turn a failed one into the right error class.
///
/// 401/403 mean the credential is wrong, which no later chunk can fix, so they are
/// configuration errors. Everything else is scoped to the current call.
pub(crate) async fn parse_json_response<T: DeserializeOwned>(
    resp: reqwest::Response,
    platform: Platform,
    max_error_body_bytes: usize,
) -> Result<T, ClassifyError> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.bytes().await?;
        return Ok(serde_json::from_slice(&body)?);
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ConfigurationError::RejectedCredential {
            platform: platform.to_string(),
            status,
        }
        .into());
    }

    let body = read_limited_text(resp, max_error_body_bytes).await;
    Err(BackendError::Upstream { status, body }.into())
}

pub(crate) async fn request_with_retry<T, Fut, F>(
    policy: &HttpPolicy,
    platform: Platform,
    mut f: F,
) -> Result<T, ClassifyError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ClassifyError>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt > policy.max_retries || !should_retry(&e) {
                    return Err(e);
                }
                let delay = backoff_delay(policy.initial_backoff, policy.max_backoff, attempt - 1);
                warn!(
                    platform = %platform,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "backend request failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn should_retry(err: &ClassifyError) -> bool {
    match err {
        ClassifyError::Backend(BackendError::Transport(e)) => {
            e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
        }
        ClassifyError::Backend(BackendError::Upstream { status, .. }) => {
            *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
        }
        ClassifyError::Backend(_) | ClassifyError::Configuration(_) => false,
    }
}

fn backoff_delay(initial: Duration, max: Duration, exponent: u32) -> Duration {
    let mult = 1u128.checked_shl(exponent).unwrap_or(u128::MAX);
    let base_ms = initial.as_millis().saturating_mul(mult);
    let capped_ms = std::cmp::min(base_ms, max.as_millis()) as u64;
    let jitter_cap = std::cmp::max(1, capped_ms / 4);
    Duration::from_millis(capped_ms.saturating_add(pseudo_jitter_ms(jitter_cap)))
}

fn pseudo_jitter_ms(max_inclusive: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    u64::from(now.subsec_nanos()) % (max_inclusive + 1)
}

async fn read_limited_text(resp: reqwest::Response, max_bytes: usize) -> String {
    match resp.bytes().await {
        Ok(mut b) => {
            if b.len() > max_bytes {
                b.truncate(max_bytes);
            }
            String::from_utf8_lossy(&b).to_string()
        }
        Err(e) => {
            warn!(error = %e, "failed to read upstream error body");
            "<failed to read error body>".to_string()
        }
    }
}
