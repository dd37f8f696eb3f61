/// Single-page access to the upstream announcement API.
///
/// The endpoint answers in one of three shapes: a bare JSON list, an object with a
/// nested `data.data` list, or an object with a flat `data` list. The shape is decided
/// once, at parse time, into a [`RawEnvelope`]; anything else is rejected.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::UpstreamConfig;
use crate::record::RawRecord;

const BODY_PREVIEW_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    HttpStatus(StatusCode),

    #[error("upstream returned an empty body")]
    EmptyBody,

    #[error("invalid response JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),

    #[error("upstream reported an error: {0}")]
    Upstream(String),
}

/// Comparison operator understood by the upstream `cond[...]` filter syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Eq,
    Like,
}

impl CondOp {
    fn as_str(self) -> &'static str {
        match self {
            CondOp::Eq => "EQ",
            CondOp::Like => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub field: String,
    pub op: CondOp,
    pub value: String,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: CondOp, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Query parameter name, e.g. `cond[supt_regin::LIKE]`.
    pub fn key(&self) -> String {
        format!("cond[{}::{}]", self.field, self.op.as_str())
    }
}

/// Parameters for one page request. The service key is added by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
    pub conditions: Vec<Condition>,
}

impl PageRequest {
    pub fn new(per_page: u32) -> Self {
        Self {
            page: 1,
            per_page,
            conditions: Vec::new(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Same request, pointed at another page.
    pub fn at_page(&self, page: u32) -> Self {
        Self {
            page,
            ..self.clone()
        }
    }

    pub fn query_pairs(&self, service_key: &str) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("serviceKey".to_string(), service_key.to_string()),
            ("page".to_string(), self.page.to_string()),
            ("perPage".to_string(), self.per_page.to_string()),
            ("returnType".to_string(), "json".to_string()),
        ];
        pairs.extend(self.conditions.iter().map(|c| (c.key(), c.value.clone())));
        pairs
    }
}

/// User-facing search filters. Empty values are ignored.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub region: Option<String>,
    pub startup_period: Option<String>,
    pub target_age: Option<String>,
}

impl SearchFilters {
    /// First-page request for these filters. Only announcements that are still
    /// recruiting are requested.
    pub fn to_request(&self, per_page: u32) -> PageRequest {
        let mut request = PageRequest::new(per_page)
            .with_condition(Condition::new("rcrt_prgs_yn", CondOp::Eq, "Y"));

        for (field, value) in [
            ("supt_regin", &self.region),
            ("biz_enyy", &self.startup_period),
            ("biz_trgt_age", &self.target_age),
        ] {
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                request = request.with_condition(Condition::new(field, CondOp::Like, v));
            }
        }
        request
    }
}

/// A decoded page in one of the accepted shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEnvelope {
    /// Bare list: the whole result set in a single page.
    List(Vec<RawRecord>),
    /// `{"data": {"data": [...]}}`
    Nested {
        items: Vec<RawRecord>,
        match_count: Option<u64>,
    },
    /// `{"data": [...]}`
    Flat {
        items: Vec<RawRecord>,
        match_count: Option<u64>,
    },
}

impl RawEnvelope {
    pub fn parse(body: &str) -> Result<Self, FetchError> {
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody);
        }
        let value: Value = serde_json::from_str(body)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, FetchError> {
        match value {
            Value::Array(items) => Ok(RawEnvelope::List(into_records(items)?)),
            Value::Object(mut obj) => {
                if let Some(err) = obj.get("error") {
                    let message = match err {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    return Err(FetchError::Upstream(message));
                }

                let outer_count = obj.get("matchCount").and_then(read_count);
                match obj.remove("data") {
                    Some(Value::Object(mut inner)) => {
                        let inner_count = inner.get("matchCount").and_then(read_count);
                        match inner.remove("data") {
                            Some(Value::Array(items)) => Ok(RawEnvelope::Nested {
                                items: into_records(items)?,
                                match_count: outer_count.or(inner_count),
                            }),
                            _ => Err(FetchError::UnexpectedShape(
                                "`data` object without a `data` list".to_string(),
                            )),
                        }
                    }
                    Some(Value::Array(items)) => Ok(RawEnvelope::Flat {
                        items: into_records(items)?,
                        match_count: outer_count,
                    }),
                    Some(other) => Err(FetchError::UnexpectedShape(format!(
                        "`data` is {}",
                        kind(&other)
                    ))),
                    None => Err(FetchError::UnexpectedShape(
                        "object without a `data` field".to_string(),
                    )),
                }
            }
            other => Err(FetchError::UnexpectedShape(format!(
                "top-level {}",
                kind(&other)
            ))),
        }
    }

    pub fn items(&self) -> &[RawRecord] {
        match self {
            RawEnvelope::List(items)
            | RawEnvelope::Nested { items, .. }
            | RawEnvelope::Flat { items, .. } => items,
        }
    }

    pub fn into_items(self) -> Vec<RawRecord> {
        match self {
            RawEnvelope::List(items)
            | RawEnvelope::Nested { items, .. }
            | RawEnvelope::Flat { items, .. } => items,
        }
    }

    /// Total matches reported for the query. A bare list counts itself; an object
    /// without `matchCount` counts the items on this page.
    pub fn match_count(&self) -> u64 {
        match self {
            RawEnvelope::List(items) => items.len() as u64,
            RawEnvelope::Nested { items, match_count } | RawEnvelope::Flat { items, match_count } => {
                match_count.unwrap_or(items.len() as u64)
            }
        }
    }

    /// A bare list is always a single, complete page.
    pub fn is_single_page(&self) -> bool {
        matches!(self, RawEnvelope::List(_))
    }
}

fn into_records(items: Vec<Value>) -> Result<Vec<RawRecord>, FetchError> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(FetchError::UnexpectedShape(format!(
                "item {i} is {}",
                kind(&other)
            ))),
        })
        .collect()
}

fn read_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Anything that can serve pages of announcements.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> Result<RawEnvelope, FetchError>;
}

/// HTTP client for the upstream endpoint.
#[derive(Clone)]
pub struct PageFetcher {
    http: reqwest::Client,
    base_url: String,
    service_key: String,
    timeout: Duration,
}

impl PageFetcher {
    pub fn new(config: &UpstreamConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .user_agent("announce-ingest")
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            service_key: config.service_key.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch(&self, request: &PageRequest) -> Result<RawEnvelope, FetchError> {
        info!(
            url = %self.base_url,
            page = request.page,
            per_page = request.per_page,
            conditions = request.conditions.len(),
            "requesting announcement page"
        );

        let resp = self
            .http
            .get(&self.base_url)
            .query(&request.query_pairs(&self.service_key))
            .timeout(self.timeout)
            .send()
            .await
            .inspect_err(|e| error!(page = request.page, error = %e, "announcement request failed"))?;

        let status = resp.status();
        info!(page = request.page, status = status.as_u16(), "announcement page response");
        if !status.is_success() {
            match status {
                StatusCode::UNAUTHORIZED => {
                    error!(page = request.page, "upstream rejected the service key")
                }
                s if s.is_server_error() => {
                    error!(page = request.page, status = s.as_u16(), "upstream server error")
                }
                s => error!(page = request.page, status = s.as_u16(), "upstream error status"),
            }
            return Err(FetchError::HttpStatus(status));
        }

        let body = resp.text().await?;
        debug!(
            page = request.page,
            preview = %body.chars().take(BODY_PREVIEW_CHARS).collect::<String>(),
            "announcement page body"
        );

        let envelope = RawEnvelope::parse(&body)
            .inspect_err(|e| error!(page = request.page, error = %e, "failed to decode page"))?;
        info!(
            page = request.page,
            items = envelope.items().len(),
            match_count = envelope.match_count(),
            "decoded announcement page"
        );
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeServer;

    fn fetcher(server: &FakeServer) -> PageFetcher {
        PageFetcher::new(&UpstreamConfig {
            base_url: format!("{}/announcements", server.base_url()),
            service_key: "KEY".to_string(),
            per_page: 30,
            item_cap: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_sends_key_and_conditions() {
        let server = FakeServer::start(|_, _| {
            (200, r#"{"matchCount": 1, "data": [{"pbanc_sn": "175034"}]}"#.to_string())
        })
        .await;
        let request = SearchFilters {
            region: Some("Seoul".to_string()),
            ..SearchFilters::default()
        }
        .to_request(30)
        .at_page(2);

        let envelope = fetcher(&server).fetch(&request).await.unwrap();
        assert_eq!(envelope.items().len(), 1);

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0];
        assert!(sent.starts_with("GET /announcements?"), "{sent}");
        for part in [
            "serviceKey=KEY",
            "page=2",
            "perPage=30",
            "returnType=json",
            "cond%5Brcrt_prgs_yn%3A%3AEQ%5D=Y",
            "cond%5Bsupt_regin%3A%3ALIKE%5D=Seoul",
        ] {
            assert!(sent.contains(part), "{part} missing from {sent}");
        }
    }

    #[tokio::test]
    async fn test_error_status_is_not_retried() {
        let server = FakeServer::start(|_, _| (500, "{}".to_string())).await;
        let err = fetcher(&server).fetch(&PageRequest::new(30)).await.unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus(StatusCode::INTERNAL_SERVER_ERROR)));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_body_is_empty() {
        let server = FakeServer::start(|_, _| (200, "  ".to_string())).await;
        let err = fetcher(&server).fetch(&PageRequest::new(30)).await.unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody));
    }

    #[test]
    fn test_query_pairs_carry_conditions() {
        let filters = SearchFilters {
            region: Some("Seoul".to_string()),
            startup_period: Some("  ".to_string()),
            target_age: Some("20-39".to_string()),
        };
        let pairs = filters.to_request(30).at_page(3).query_pairs("KEY");

        assert_eq!(
            pairs,
            vec![
                ("serviceKey".to_string(), "KEY".to_string()),
                ("page".to_string(), "3".to_string()),
                ("perPage".to_string(), "30".to_string()),
                ("returnType".to_string(), "json".to_string()),
                ("cond[rcrt_prgs_yn::EQ]".to_string(), "Y".to_string()),
                ("cond[supt_regin::LIKE]".to_string(), "Seoul".to_string()),
                ("cond[biz_trgt_age::LIKE]".to_string(), "20-39".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_bare_list() {
        let env = RawEnvelope::parse(r#"[{"pbanc_sn": "1"}, {"pbanc_sn": "2"}]"#).unwrap();
        assert!(env.is_single_page());
        assert_eq!(env.match_count(), 2);
        assert_eq!(env.items().len(), 2);
    }

    #[test]
    fn test_parse_flat_object() {
        let env = RawEnvelope::parse(
            r#"{"currentCount": 1, "matchCount": 120, "page": 1, "data": [{"pbanc_sn": "1"}]}"#,
        )
        .unwrap();
        assert!(matches!(env, RawEnvelope::Flat { .. }));
        assert_eq!(env.match_count(), 120);
    }

    #[test]
    fn test_parse_nested_object_with_string_count() {
        let env = RawEnvelope::parse(
            r#"{"matchCount": "7", "data": {"data": [{"pbanc_sn": "1"}, {"pbanc_sn": "2"}]}}"#,
        )
        .unwrap();
        assert!(matches!(env, RawEnvelope::Nested { .. }));
        assert_eq!(env.match_count(), 7);
    }

    #[test]
    fn test_missing_match_count_counts_page() {
        let env = RawEnvelope::parse(r#"{"data": [{"a": 1}, {"a": 2}, {"a": 3}]}"#).unwrap();
        assert_eq!(env.match_count(), 3);
    }

    #[test]
    fn test_parse_rejections() {
        assert!(matches!(RawEnvelope::parse("  \n"), Err(FetchError::EmptyBody)));
        assert!(matches!(RawEnvelope::parse("{oops"), Err(FetchError::ParseError(_))));
        assert!(matches!(
            RawEnvelope::parse(r#"{"data": "nope"}"#),
            Err(FetchError::UnexpectedShape(_))
        ));
        assert!(matches!(
            RawEnvelope::parse(r#"{"items": []}"#),
            Err(FetchError::UnexpectedShape(_))
        ));
        assert!(matches!(
            RawEnvelope::parse("42"),
            Err(FetchError::UnexpectedShape(_))
        ));
        assert!(matches!(
            RawEnvelope::parse(r#"[1, 2]"#),
            Err(FetchError::UnexpectedShape(_))
        ));
        assert!(matches!(
            RawEnvelope::parse(r#"{"error": "SERVICE_KEY_IS_NOT_REGISTERED_ERROR"}"#),
            Err(FetchError::Upstream(msg)) if msg == "SERVICE_KEY_IS_NOT_REGISTERED_ERROR"
        ));
    }
}
