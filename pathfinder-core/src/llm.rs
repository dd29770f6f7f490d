//! Generative-text client for Pathfinder.
//!
//! Provides an `LlmBackend` trait with a Gemini implementation covering:
//! - **generateContent** - one full reply, used by chat, question generation and synthesis
//! - **streamGenerateContent** (`alt=sse`) - incremental reply chunks for the streaming chat endpoint
//!
//! Upstream errors are surfaced as-is unless `[llm] max_retries` opts into
//! exponential backoff. Streams are never retried.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;

use crate::config::LlmConfig;
use crate::models::MessageRole;

/// Stream of reply text chunks in arrival order.
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

// ============================================================================
// LlmBackend trait
// ============================================================================

/// Abstraction over generative-text providers.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Produce the complete reply for `request`.
    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError>;

    /// Produce the reply as a stream of text chunks.
    async fn stream(&self, request: &GenerateRequest) -> Result<TextStream, LlmError>;

    /// Model identifier, for logging and version metadata.
    fn model(&self) -> &str;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: MessageRole,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Model,
            text: text.into(),
        }
    }
}

/// A provider-neutral generation request: optional system instruction plus
/// the conversation so far, ending with the turn to answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateRequest {
    pub system_instruction: Option<String>,
    pub turns: Vec<ChatTurn>,
}

impl GenerateRequest {
    /// Single-turn request carrying one templated prompt.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            system_instruction: None,
            turns: vec![ChatTurn::user(text)],
        }
    }

    pub fn with_system_instruction(mut self, instruction: Option<String>) -> Self {
        self.system_instruction = instruction.filter(|s| !s.trim().is_empty());
        self
    }
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Model returned no text")]
    EmptyResponse,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("Malformed stream: {0}")]
    Stream(String),

    #[error("All {attempts} attempts failed, last error: {message}")]
    RetryExhausted { attempts: usize, message: String },
}

// ============================================================================
// Gemini API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: MessageRole,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiReplyContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiReplyContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: Option<GeminiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    code: u16,
    message: String,
}

impl GeminiResponse {
    /// Concatenated text of the first candidate.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// GeminiClient
// ============================================================================

/// Gemini generative client over `generateContent` and `streamGenerateContent`.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    config: LlmConfig,
    base_url: String,
}

impl GeminiClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let base_url = config.base_url.clone();
        Self::with_base_url(config, base_url)
    }

    /// Create a client with a custom base URL (for testing / proxies)
    pub fn with_base_url(config: LlmConfig, base_url: String) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn build_body(&self, request: &GenerateRequest) -> GeminiRequest {
        GeminiRequest {
            contents: request
                .turns
                .iter()
                .map(|turn| GeminiContent {
                    role: turn.role,
                    parts: vec![GeminiPart {
                        text: turn.text.clone(),
                    }],
                })
                .collect(),
            system_instruction: request.system_instruction.as_ref().map(|s| GeminiInstruction {
                parts: vec![GeminiPart { text: s.clone() }],
            }),
            generation_config: self
                .config
                .temperature
                .map(|temperature| GenerationConfig { temperature }),
        }
    }

    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        if self.config.max_retries == 0 {
            return op().await;
        }

        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        Retry::spawn(retry_strategy, op).await.map_err(|e| {
            let attempts = self.config.max_retries + 1;
            tracing::error!(attempts, error = %e, "All generation attempts failed");
            LlmError::RetryExhausted {
                attempts,
                message: e.to_string(),
            }
        })
    }

    async fn generate_once(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.config.model, self.config.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&self.build_body(request))
            .send()
            .await?;
        let response = check_status(response).await?;

        let gemini_response: GeminiResponse = response.json().await?;
        let text = gemini_response.text();
        if text.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmBackend for GeminiClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<String, LlmError> {
        self.with_retries(|| self.generate_once(request)).await
    }

    async fn stream(&self, request: &GenerateRequest) -> Result<TextStream, LlmError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.config.model, self.config.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&self.build_body(request))
            .send()
            .await?;
        let response = check_status(response).await?;

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        let lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

        let chunks = lines.filter_map(|line| async move {
            match line {
                Ok(line) => decode_sse_line(&line),
                Err(e) => Some(Err(LlmError::Stream(e.to_string()))),
            }
        });

        Ok(chunks.boxed())
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

/// Turn a non-2xx response into `LlmError::Api`, preferring Gemini's error body.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_body = response.text().await.unwrap_or_default();
    let error_detail = serde_json::from_str::<GeminiErrorResponse>(&error_body)
        .ok()
        .and_then(|e| e.error);

    let (code, message) = error_detail
        .map(|e| (e.code, e.message))
        .unwrap_or((status.as_u16(), error_body));

    tracing::error!(code = code, message = %message, "Gemini API error");

    Err(LlmError::Api { code, message })
}

/// Decode one server-sent-events line from `streamGenerateContent`.
///
/// Returns `None` for blank lines, comments, non-data fields and chunks that
/// carry no text (e.g. the final usage-only event).
pub(crate) fn decode_sse_line(line: &str) -> Option<Result<String, LlmError>> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<GeminiResponse>(payload) {
        Ok(chunk) => {
            let text = chunk.text();
            if text.is_empty() {
                None
            } else {
                Some(Ok(text))
            }
        }
        Err(e) => Some(Err(LlmError::Stream(format!("invalid chunk: {}", e)))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(api_key: &str) -> LlmConfig {
        LlmConfig {
            api_key: api_key.to_string(),
            model: "gemini-2.5-flash".to_string(),
            max_retries: 0,
            retry_delay_ms: 10,
            ..LlmConfig::default()
        }
    }

    fn mock_reply(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "finishReason": "STOP"
            }]
        })
    }

    #[tokio::test]
    async fn test_generate_sends_turns_and_system_instruction() {
        let mock_server = MockServer::start().await;
        let client = GeminiClient::with_base_url(test_config("test-api-key"), mock_server.uri())
            .expect("Failed to create client");

        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash:generateContent"))
            .and(query_param("key", "test-api-key"))
            .and(body_json(serde_json::json!({
                "contents": [
                    { "role": "user", "parts": [{ "text": "hi" }] },
                    { "role": "model", "parts": [{ "text": "hello" }] },
                    { "role": "user", "parts": [{ "text": "how are you?" }] }
                ],
                "systemInstruction": { "parts": [{ "text": "Be kind." }] }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_reply("Doing well.")))
            .mount(&mock_server)
            .await;

        let request = GenerateRequest {
            system_instruction: Some("Be kind.".to_string()),
            turns: vec![
                ChatTurn::user("hi"),
                ChatTurn::model("hello"),
                ChatTurn::user("how are you?"),
            ],
        };

        let reply = client.generate(&request).await;
        assert!(reply.is_ok(), "Expected Ok, got Err: {:?}", reply.err());
        assert_eq!(reply.unwrap(), "Doing well.");
    }

    #[tokio::test]
    async fn test_generate_concatenates_parts() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiClient::with_base_url(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "one " }, { "text": "two" }] } }]
            })))
            .mount(&mock_server)
            .await;

        let reply = client.generate(&GenerateRequest::prompt("x")).await.unwrap();
        assert_eq!(reply, "one two");
    }

    #[tokio::test]
    async fn test_generate_surfaces_api_error_without_retry() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiClient::with_base_url(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "code": 500, "message": "Internal server error" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.generate(&GenerateRequest::prompt("x")).await {
            Err(LlmError::Api { code, message }) => {
                assert_eq!(code, 500);
                assert_eq!(message, "Internal server error");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_retries_when_configured() {
        let mock_server = MockServer::start().await;
        let mut config = test_config("k");
        config.max_retries = 2;
        let client = GeminiClient::with_base_url(config, mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "code": 429, "message": "Rate limit exceeded" }
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(mock_reply("ok")))
            .mount(&mock_server)
            .await;

        let reply = client.generate(&GenerateRequest::prompt("x")).await;
        assert!(reply.is_ok(), "Expected success after retry");
        assert_eq!(reply.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_generate_reports_exhausted_retries() {
        let mock_server = MockServer::start().await;
        let mut config = test_config("k");
        config.max_retries = 1;
        let client = GeminiClient::with_base_url(config, mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&mock_server)
            .await;

        match client.generate(&GenerateRequest::prompt("x")).await {
            Err(LlmError::RetryExhausted { attempts, message }) => {
                assert_eq!(attempts, 2);
                assert!(message.contains("unavailable"));
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_reply() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiClient::with_base_url(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "candidates": [] })),
            )
            .mount(&mock_server)
            .await;

        let result = client.generate(&GenerateRequest::prompt("x")).await;
        assert!(matches!(result, Err(LlmError::EmptyResponse)));
    }

    #[test]
    fn test_missing_api_key() {
        let result = GeminiClient::new(test_config(""));
        assert!(matches!(result, Err(LlmError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_stream_yields_text_chunks_in_order() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiClient::with_base_url(test_config("k"), mock_server.uri()).unwrap();

        let sse = format!(
            "data: {}\r\n\r\ndata: {}\r\n\r\ndata: {}\r\n\r\n",
            mock_reply("Hel"),
            mock_reply("lo"),
            serde_json::json!({ "usageMetadata": { "totalTokenCount": 3 } })
        );

        Mock::given(method("POST"))
            .and(path("/models/gemini-2.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse),
            )
            .mount(&mock_server)
            .await;

        let stream = client.stream(&GenerateRequest::prompt("x")).await.unwrap();
        let chunks: Vec<String> = stream.try_collect().await.unwrap();
        assert_eq!(chunks, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_surfaces_api_error_before_first_chunk() {
        let mock_server = MockServer::start().await;
        let client =
            GeminiClient::with_base_url(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": 400, "message": "API key not valid" }
            })))
            .mount(&mock_server)
            .await;

        let result = client.stream(&GenerateRequest::prompt("x")).await;
        assert!(matches!(result, Err(LlmError::Api { code: 400, .. })));
    }

    #[test]
    fn test_decode_sse_line_skips_non_data_lines() {
        assert!(decode_sse_line("").is_none());
        assert!(decode_sse_line(": keep-alive").is_none());
        assert!(decode_sse_line("event: message").is_none());
        assert!(decode_sse_line("data: [DONE]").is_none());
    }

    #[test]
    fn test_decode_sse_line_reports_bad_json() {
        let result = decode_sse_line("data: {not json");
        assert!(matches!(result, Some(Err(LlmError::Stream(_)))));
    }

    #[test]
    fn test_blank_system_instruction_is_dropped() {
        let request = GenerateRequest::prompt("x").with_system_instruction(Some("   ".into()));
        assert!(request.system_instruction.is_none());
    }
}
