/// In-memory stand-ins for the upstream API and the AI backends.
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::backend::{parse_classification, BackendFactory, Classifier, Identifier, Platform};
use crate::error::{ClassifyError, ConfigurationError};
use crate::fetch::{FetchError, PageRequest, PageSource, RawEnvelope};
use crate::record::RawRecord;

pub fn record_with_serial(serial: &str) -> RawRecord {
    let mut record = RawRecord::new();
    record.insert("pbanc_sn".into(), json!(serial));
    record.insert("biz_pbanc_nm".into(), json!(format!("Announcement {serial}")));
    record
}

/// `n` records with serials `SN-0`, `SN-1`, ...
pub fn numbered_records(n: usize) -> Vec<RawRecord> {
    (0..n).map(|i| record_with_serial(&format!("SN-{i}"))).collect()
}

/// Serves a fixed record set page by page, in the flat envelope shape.
pub struct ScriptedSource {
    records: Vec<RawRecord>,
    failing: HashSet<u32>,
    requested: Mutex<Vec<u32>>,
}

impl ScriptedSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            failing: HashSet::new(),
            requested: Mutex::new(Vec::new()),
        }
    }

    /// Answer `page` with a 500 instead of data.
    pub fn failing_on(mut self, page: u32) -> Self {
        self.failing.insert(page);
        self
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for ScriptedSource {
    async fn fetch(&self, request: &PageRequest) -> Result<RawEnvelope, FetchError> {
        self.requested.lock().unwrap().push(request.page);
        if self.failing.contains(&request.page) {
            return Err(FetchError::HttpStatus(StatusCode::INTERNAL_SERVER_ERROR));
        }

        let per_page = request.per_page.max(1) as usize;
        let start = (request.page.saturating_sub(1) as usize).saturating_mul(per_page);
        let items = self
            .records
            .iter()
            .skip(start)
            .take(per_page)
            .cloned()
            .collect();
        Ok(RawEnvelope::Flat {
            items,
            match_count: Some(self.records.len() as u64),
        })
    }
}

type Script = dyn Fn(usize, &str) -> Result<Vec<Identifier>, ClassifyError> + Send + Sync;

/// Classifier whose answer for each call is computed by a closure over the call
/// ordinal and the prompt. Calls and prompts are recorded.
pub struct ScriptedClassifier {
    platform: Platform,
    script: Box<Script>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn from_fn<F>(script: F) -> Self
    where
        F: Fn(usize, &str) -> Result<Vec<Identifier>, ClassifyError> + Send + Sync + 'static,
    {
        Self {
            platform: Platform::OpenAi,
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the same backend JSON.
    pub fn answering(response: Value) -> Self {
        Self::from_fn(move |_, _| Ok(parse_classification(&response)?))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn classify(&self, prompt: &str, _model: &str) -> Result<Vec<Identifier>, ClassifyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        (self.script)(call, prompt)
    }
}

#[async_trait]
impl Classifier for Arc<ScriptedClassifier> {
    fn platform(&self) -> Platform {
        self.as_ref().platform()
    }

    async fn classify(&self, prompt: &str, model: &str) -> Result<Vec<Identifier>, ClassifyError> {
        self.as_ref().classify(prompt, model).await
    }
}

/// Hands out one shared scripted classifier for every platform, or refuses all of
/// them when built with [`ScriptedBackends::unavailable`].
pub struct ScriptedBackends {
    classifier: Option<Arc<ScriptedClassifier>>,
}

impl ScriptedBackends {
    pub fn new(classifier: Arc<ScriptedClassifier>) -> Self {
        Self {
            classifier: Some(classifier),
        }
    }

    pub fn unavailable() -> Self {
        Self { classifier: None }
    }
}

impl BackendFactory for ScriptedBackends {
    fn build(&self, platform: Platform) -> Result<Box<dyn Classifier>, ConfigurationError> {
        match &self.classifier {
            Some(c) => Ok(Box::new(Arc::clone(c))),
            None => Err(ConfigurationError::MissingCredential {
                platform: platform.to_string(),
                env_var: platform.credential_env(),
            }),
        }
    }
}

type Route = dyn Fn(&str, &str) -> (u16, String) + Send + Sync;

/// Minimal HTTP/1.1 server on a loopback port. Each request is answered by `route`
/// from its method and request target, then the connection is closed.
pub struct FakeServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let route: Arc<Route> = Arc::new(route);

        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let route = Arc::clone(&route);
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let _ = answer(stream, route.as_ref(), &log).await;
                });
            }
        });

        Self { base_url, requests }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `"<METHOD> <target>"` for every request received, in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn answer(mut stream: TcpStream, route: &Route, log: &Mutex<Vec<String>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_len = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_len]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_len + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    log.lock().unwrap().push(format!("{method} {target}"));

    let (status, body) = route(&method, &target);
    let response = format!(
        "HTTP/1.1 {status} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        if status < 400 { "OK" } else { "Error" },
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
