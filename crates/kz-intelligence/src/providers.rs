//! Remote inference backends and the HTTP seam beneath them.
//!
//! A [`RemoteProvider`] knows how to shape a request for its API and where
//! the generated text sits in the reply. Actually sending bytes is the job of
//! an [`HttpTransport`]: [`ReqwestTransport`] in production, [`MockTransport`]
//! in tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kz_core::{AiConfig, ProviderKind};
use serde_json::{json, Value};
use thiserror::Error;

use crate::prompts::SYSTEM_PROMPT;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Connection failure, DNS, TLS, and the like.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("request timed out")]
    Timeout,

    /// A credential or endpoint the provider needs is missing.
    #[error("not configured: {0}")]
    NotConfigured(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            // The URL can carry a query-string API key (Gemini).
            ProviderError::Http(err.without_url().to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST `request.body` as JSON. Non-2xx statuses are returned, not raised.
    async fn post_json(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, ProviderError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(&self, request: &HttpRequest, timeout: Duration) -> Result<HttpResponse, ProviderError> {
        let mut builder = self.client.post(&request.url).timeout(timeout).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(HttpResponse { status, body })
    }
}

/// Transport returning queued responses and recording every request.
///
/// An empty queue answers with an HTTP error.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, ProviderError>>>,
    captured: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a 200 response with `body`.
    pub fn with_body(self, body: impl Into<String>) -> Self {
        self.with_status(200, body)
    }

    pub fn with_json(self, body: Value) -> Self {
        self.with_status(200, body.to_string())
    }

    pub fn with_status(self, status: u16, body: impl Into<String>) -> Self {
        self.push(Ok(HttpResponse {
            status,
            body: body.into(),
        }));
        self
    }

    pub fn with_error(self, error: ProviderError) -> Self {
        self.push(Err(error));
        self
    }

    pub fn push(&self, response: Result<HttpResponse, ProviderError>) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(response);
    }

    pub fn captured_requests(&self) -> Vec<HttpRequest> {
        self.captured.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn pending(&self) -> usize {
        self.responses.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn post_json(&self, request: &HttpRequest, _timeout: Duration) -> Result<HttpResponse, ProviderError> {
        self.captured
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Http("no mock response queued".into())))
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionTask {
    Duration,
    Category,
}

impl PredictionTask {
    pub fn as_str(self) -> &'static str {
        match self {
            PredictionTask::Duration => "duration",
            PredictionTask::Category => "category",
        }
    }
}

/// Per-call settings resolved from the current configuration.
#[derive(Clone)]
pub struct RemoteSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl std::fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub trait InferenceBackend {
    fn name(&self) -> &'static str;

    fn build_request(
        &self,
        prompt: &str,
        task: PredictionTask,
        settings: &RemoteSettings,
    ) -> Result<HttpRequest, ProviderError>;

    /// Pull the generated text out of a successful response body.
    fn extract_text(&self, body: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteProvider {
    OpenAi,
    Gemini,
    Custom,
}

impl RemoteProvider {
    pub fn from_kind(kind: ProviderKind) -> Option<Self> {
        match kind {
            ProviderKind::Local => None,
            ProviderKind::OpenAi => Some(RemoteProvider::OpenAi),
            ProviderKind::Gemini => Some(RemoteProvider::Gemini),
            ProviderKind::Custom => Some(RemoteProvider::Custom),
        }
    }

    pub fn kind(self) -> ProviderKind {
        match self {
            RemoteProvider::OpenAi => ProviderKind::OpenAi,
            RemoteProvider::Gemini => ProviderKind::Gemini,
            RemoteProvider::Custom => ProviderKind::Custom,
        }
    }

    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            RemoteProvider::OpenAi => Some("https://api.openai.com/v1"),
            RemoteProvider::Gemini => Some("https://generativelanguage.googleapis.com/v1"),
            RemoteProvider::Custom => None,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            RemoteProvider::OpenAi => "gpt-3.5-turbo",
            RemoteProvider::Gemini => "gemini-pro",
            RemoteProvider::Custom => "custom",
        }
    }

    /// Version tag stamped on predictions served by this provider.
    pub fn version_tag(self) -> String {
        format!("{}-api", self.name())
    }

    /// Resolve URL, key, and knobs for one call.
    pub fn settings(self, config: &AiConfig) -> Result<RemoteSettings, ProviderError> {
        let api_key = config.resolve_api_key();
        if self.kind().requires_api_key() && api_key.is_none() {
            return Err(ProviderError::NotConfigured(format!("{} requires an API key", self.name())));
        }
        let base_url = config
            .api_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .or(self.default_base_url())
            .ok_or_else(|| ProviderError::NotConfigured(format!("{} requires api_url", self.name())))?
            .trim_end_matches('/')
            .to_string();
        let model = config
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.default_model().to_string());

        Ok(RemoteSettings {
            base_url,
            api_key,
            model,
            temperature: config.remote.temperature,
            max_tokens: config.remote.max_tokens,
            timeout: Duration::from_millis(config.remote.request_timeout_ms),
        })
    }
}

fn json_body(body: &str) -> Result<Value, ProviderError> {
    serde_json::from_str(body).map_err(|e| ProviderError::Parse(e.to_string()))
}

impl InferenceBackend for RemoteProvider {
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn build_request(
        &self,
        prompt: &str,
        task: PredictionTask,
        settings: &RemoteSettings,
    ) -> Result<HttpRequest, ProviderError> {
        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let request = match self {
            RemoteProvider::OpenAi => {
                let key = settings
                    .api_key
                    .as_deref()
                    .ok_or_else(|| ProviderError::NotConfigured("openai requires an API key".into()))?;
                headers.push(("Authorization".into(), format!("Bearer {key}")));
                HttpRequest {
                    url: format!("{}/chat/completions", settings.base_url),
                    headers,
                    body: json!({
                        "model": settings.model,
                        "messages": [
                            { "role": "system", "content": SYSTEM_PROMPT },
                            { "role": "user", "content": prompt },
                        ],
                        "temperature": settings.temperature,
                        "max_tokens": settings.max_tokens,
                    }),
                }
            }
            RemoteProvider::Gemini => {
                let key = settings
                    .api_key
                    .as_deref()
                    .ok_or_else(|| ProviderError::NotConfigured("gemini requires an API key".into()))?;
                HttpRequest {
                    url: format!(
                        "{}/models/{}:generateContent?key={key}",
                        settings.base_url, settings.model
                    ),
                    headers,
                    body: json!({
                        "contents": [{ "parts": [{ "text": format!("{SYSTEM_PROMPT}\n\n{prompt}") }] }],
                        "generationConfig": {
                            "temperature": settings.temperature,
                            "maxOutputTokens": settings.max_tokens,
                        },
                    }),
                }
            }
            RemoteProvider::Custom => {
                if let Some(key) = settings.api_key.as_deref() {
                    headers.push(("Authorization".into(), format!("Bearer {key}")));
                }
                HttpRequest {
                    url: format!("{}/predict", settings.base_url),
                    headers,
                    body: json!({ "prompt": prompt, "type": task.as_str() }),
                }
            }
        };
        Ok(request)
    }

    fn extract_text(&self, body: &str) -> Result<String, ProviderError> {
        match self {
            RemoteProvider::OpenAi => json_body(body)?
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ProviderError::Parse("no choices[0].message.content in response".into())),
            RemoteProvider::Gemini => json_body(body)?
                .pointer("/candidates/0/content/parts/0/text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ProviderError::Parse("no candidates[0].content.parts[0].text in response".into())),
            // Custom servers answer `{predictions: [..]}`, some other JSON, or
            // plain text; the reply parser copes with all of them.
            RemoteProvider::Custom => match serde_json::from_str::<Value>(body) {
                Ok(value) => match value.pointer("/predictions/0") {
                    Some(Value::String(text)) => Ok(text.clone()),
                    Some(other) => Ok(other.to_string()),
                    None => Ok(value.to_string()),
                },
                Err(_) => Ok(body.to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transport_errors_leave_the_query_key_out() {
        let request = HttpRequest {
            url: "http://127.0.0.1:1/v1/models/gemini-pro:generateContent?key=SUPERSECRET".into(),
            headers: Vec::new(),
            body: json!({}),
        };
        let err = ReqwestTransport::new()
            .post_json(&request, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Http(_) | ProviderError::Timeout));
        assert!(!err.to_string().contains("SUPERSECRET"), "{err}");
    }

    fn settings(provider: RemoteProvider, key: Option<&str>) -> RemoteSettings {
        let mut cfg = AiConfig::local().with_provider(provider.kind());
        if let Some(k) = key {
            cfg = cfg.with_api_key(k);
        }
        if provider == RemoteProvider::Custom {
            cfg = cfg.with_api_url("http://localhost:9000/");
        }
        provider.settings(&cfg).unwrap()
    }

    #[test]
    fn openai_request_shape() {
        let s = settings(RemoteProvider::OpenAi, Some("sk-test"));
        let req = RemoteProvider::OpenAi
            .build_request("hello", PredictionTask::Duration, &s)
            .unwrap();
        assert_eq!(req.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(req.header("authorization"), Some("Bearer sk-test"));
        assert_eq!(req.body["model"], "gpt-3.5-turbo");
        assert_eq!(req.body["messages"][1]["content"], "hello");
        assert_eq!(req.body["max_tokens"], 500);
    }

    #[test]
    fn gemini_puts_key_in_query() {
        let s = settings(RemoteProvider::Gemini, Some("g-key"));
        let req = RemoteProvider::Gemini
            .build_request("hi", PredictionTask::Category, &s)
            .unwrap();
        assert_eq!(
            req.url,
            "https://generativelanguage.googleapis.com/v1/models/gemini-pro:generateContent?key=g-key"
        );
        assert!(req.header("authorization").is_none());
        assert_eq!(req.body["generationConfig"]["maxOutputTokens"], 500);
        assert!(req.body["contents"][0]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .ends_with("hi"));
    }

    #[test]
    fn custom_request_carries_type_and_optional_auth() {
        let s = settings(RemoteProvider::Custom, None);
        let req = RemoteProvider::Custom
            .build_request("p", PredictionTask::Category, &s)
            .unwrap();
        assert_eq!(req.url, "http://localhost:9000/predict");
        assert_eq!(req.body["type"], "category");
        assert!(req.header("authorization").is_none());
    }

    #[test]
    fn missing_credentials_are_not_configured() {
        let cfg = AiConfig::local().with_provider(ProviderKind::OpenAi);
        assert!(matches!(
            RemoteProvider::OpenAi.settings(&cfg),
            Err(ProviderError::NotConfigured(_))
        ));
        let cfg = AiConfig::local().with_provider(ProviderKind::Custom);
        assert!(matches!(
            RemoteProvider::Custom.settings(&cfg),
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn text_extraction_per_provider() {
        let openai = r#"{"choices":[{"message":{"content":"{\"minutes\":20}"}}]}"#;
        assert_eq!(RemoteProvider::OpenAi.extract_text(openai).unwrap(), r#"{"minutes":20}"#);

        let gemini = r#"{"candidates":[{"content":{"parts":[{"text":"30"}]}}]}"#;
        assert_eq!(RemoteProvider::Gemini.extract_text(gemini).unwrap(), "30");
        assert!(RemoteProvider::Gemini.extract_text("{}").is_err());

        let custom = r#"{"predictions":[{"minutes":12}]}"#;
        assert_eq!(RemoteProvider::Custom.extract_text(custom).unwrap(), r#"{"minutes":12}"#);
        assert_eq!(RemoteProvider::Custom.extract_text("about 10").unwrap(), "about 10");
    }

    #[tokio::test]
    async fn mock_transport_replays_queue_and_captures() {
        let mock = MockTransport::new().with_body("first").with_status(503, "busy");
        let req = HttpRequest {
            url: "http://x/predict".into(),
            headers: vec![],
            body: json!({}),
        };
        let a = mock.post_json(&req, Duration::from_secs(1)).await.unwrap();
        let b = mock.post_json(&req, Duration::from_secs(1)).await.unwrap();
        assert_eq!(a.body, "first");
        assert!(!b.is_success());
        assert!(mock.post_json(&req, Duration::from_secs(1)).await.is_err());
        assert_eq!(mock.captured_requests().len(), 3);
        assert_eq!(mock.pending(), 0);
    }
}
