//! Model client for OpenAI-compatible chat-completion backends.
//!
//! One client serves every configured model; per-model connection
//! parameters are injected at call time via [`ModelEndpoint`], so no
//! per-provider subclassing exists. Streaming responses arrive as
//! typed [`StreamChunk`]s with thinking separated from content.

pub mod sse;
pub mod think;

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::unfold;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ModelEndpoint;
use crate::error::{CouncilError, CouncilResult};
use self::sse::{SseEvent, SseLineBuffer};
use self::think::{Segment, ThinkSplitter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MODELS_TIMEOUT: Duration = Duration::from_secs(10);

/// A chat message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Whole-call deadline, covering connect through stream end for
    /// non-streaming calls and connect through first byte for
    /// streaming calls.
    pub timeout: Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: None,
            max_tokens: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl ChatOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Final assembled output of one model call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOutput {
    pub content: String,
    pub thinking: Option<String>,
}

/// One streamed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// Reasoning text from a thinking segment.
    Thinking(String),
    /// Final-answer text.
    Content(String),
    /// Terminal chunk carrying the assembled output.
    Done(ModelOutput),
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = CouncilResult<StreamChunk>> + Send>>;

/// Seam between the deliberation engine and the model backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Whole-response completion.
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> CouncilResult<ModelOutput>;

    /// Streaming completion. The stream yields thinking and content
    /// deltas and terminates with [`StreamChunk::Done`].
    async fn complete_stream(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> CouncilResult<ChunkStream>;

    /// Model ids loaded on the backend (`GET {base_url}/models`).
    async fn list_models(&self, base_url: &str) -> CouncilResult<Vec<String>>;
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireMessage,
}

/// HTTP client for any OpenAI-compatible endpoint.
pub struct HttpModelClient {
    http: reqwest::Client,
}

impl HttpModelClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("reqwest client construction is infallible with these options"),
        }
    }

    async fn send_request(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        options: &ChatOptions,
        stream: bool,
    ) -> CouncilResult<reqwest::Response> {
        let url = format!("{}/chat/completions", endpoint.base_url);
        let body = WireRequest {
            model: &endpoint.model,
            messages,
            stream,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_request_error(e, endpoint, options))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CouncilError::ModelNotLoaded(endpoint.model.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CouncilError::ProtocolError {
                model: endpoint.model.clone(),
                reason: format!("HTTP {}: {}", status, truncate(&body, 200)),
            });
        }
        Ok(response)
    }
}

impl Default for HttpModelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatBackend for HttpModelClient {
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> CouncilResult<ModelOutput> {
        let call = async {
            let response = self.send_request(endpoint, messages, options, false).await?;
            let parsed: WireResponse =
                response
                    .json()
                    .await
                    .map_err(|e| CouncilError::ProtocolError {
                        model: endpoint.model.clone(),
                        reason: format!("response body: {}", e),
                    })?;

            let message = parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message)
                .ok_or_else(|| CouncilError::ProtocolError {
                    model: endpoint.model.clone(),
                    reason: "no choices in response".to_string(),
                })?;

            let raw_content = message.content.unwrap_or_default();
            let structured_thinking = first_nonempty(message.reasoning_content, message.reasoning);

            // Providers without a structured field inline thinking in
            // the content between think tags.
            let output = match structured_thinking {
                Some(thinking) => ModelOutput {
                    content: raw_content.trim().to_string(),
                    thinking: Some(thinking),
                },
                None => {
                    let (content, thinking) = think::split_thinking(&raw_content);
                    ModelOutput { content, thinking }
                }
            };
            debug!(model = %endpoint.model, chars = output.content.len(), "completion finished");
            Ok(output)
        };

        tokio::time::timeout(options.timeout, call)
            .await
            .map_err(|_| CouncilError::Timeout {
                model: endpoint.model.clone(),
                seconds: options.timeout.as_secs(),
            })?
    }

    async fn complete_stream(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> CouncilResult<ChunkStream> {
        let response = tokio::time::timeout(
            options.timeout,
            self.send_request(endpoint, messages, options, true),
        )
        .await
        .map_err(|_| CouncilError::Timeout {
            model: endpoint.model.clone(),
            seconds: options.timeout.as_secs(),
        })??;

        Ok(chunk_stream(
            response.bytes_stream().boxed(),
            endpoint.model.clone(),
        ))
    }

    async fn list_models(&self, base_url: &str) -> CouncilResult<Vec<String>> {
        let url = format!("{}/models", base_url.trim_end_matches('/'));
        let response = tokio::time::timeout(MODELS_TIMEOUT, self.http.get(&url).send())
            .await
            .map_err(|_| CouncilError::BackendUnreachable {
                url: url.clone(),
                reason: "request timed out".to_string(),
            })?
            .map_err(|e| CouncilError::BackendUnreachable {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(CouncilError::BackendUnreachable {
                url,
                reason: format!("HTTP {}", response.status()),
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| CouncilError::BackendUnreachable {
                url,
                reason: format!("model list body: {}", e),
            })?;
        Ok(parse_model_list(&value))
    }
}

/// Extract model ids from the `/v1/models` payload. Accepts the
/// canonical `{"data":[{"id":..}]}` form plus the `{"models":[..]}`
/// and bare-list variants some local servers return.
pub fn parse_model_list(value: &Value) -> Vec<String> {
    let entries = value
        .get("data")
        .and_then(Value::as_array)
        .or_else(|| value.get("models").and_then(Value::as_array))
        .or_else(|| value.as_array());

    let Some(entries) = entries else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            if let Some(s) = entry.as_str() {
                return Some(s.to_string());
            }
            entry
                .get("id")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .filter(|id| !id.is_empty())
        .collect()
}

struct StreamState<S> {
    bytes: S,
    model: String,
    sse: SseLineBuffer,
    splitter: ThinkSplitter,
    content: String,
    thinking: String,
    pending: VecDeque<CouncilResult<StreamChunk>>,
    finished: bool,
}

impl<S> StreamState<S> {
    fn push_segment(&mut self, segment: Segment) {
        match segment {
            Segment::Thinking(text) => {
                self.thinking.push_str(&text);
                self.pending.push_back(Ok(StreamChunk::Thinking(text)));
            }
            Segment::Content(text) => {
                self.content.push_str(&text);
                self.pending.push_back(Ok(StreamChunk::Content(text)));
            }
        }
    }

    fn handle_data(&mut self, json: &str) {
        let chunk: WireStreamChunk = match serde_json::from_str(json) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.pending.push_back(Err(CouncilError::ProtocolError {
                    model: self.model.clone(),
                    reason: format!("stream event: {}", e),
                }));
                self.finished = true;
                return;
            }
        };

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(thinking) = first_nonempty(choice.delta.reasoning_content, choice.delta.reasoning)
        {
            self.push_segment(Segment::Thinking(thinking));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            for segment in self.splitter.feed(&content) {
                self.push_segment(segment);
            }
        }
    }

    fn finalize(&mut self, saw_done: bool) {
        for segment in self.splitter.flush() {
            self.push_segment(segment);
        }
        if !saw_done && self.content.is_empty() {
            self.pending.push_back(Err(CouncilError::ProtocolError {
                model: self.model.clone(),
                reason: "stream closed before any content".to_string(),
            }));
        } else {
            if !saw_done {
                warn!(model = %self.model, "stream truncated without [DONE], keeping received content");
            }
            let thinking = self.thinking.trim().to_string();
            self.pending.push_back(Ok(StreamChunk::Done(ModelOutput {
                content: self.content.trim().to_string(),
                thinking: (!thinking.is_empty()).then_some(thinking),
            })));
        }
        self.finished = true;
    }
}

/// Wrap a raw byte stream in SSE framing, think-tag routing, and
/// truncation handling.
fn chunk_stream<S>(bytes: S, model: String) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    let state = StreamState {
        bytes,
        model,
        sse: SseLineBuffer::new(),
        splitter: ThinkSplitter::new(),
        content: String::new(),
        thinking: String::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    for event in state.sse.feed(&bytes) {
                        if state.finished {
                            break;
                        }
                        match event {
                            SseEvent::Data(json) => state.handle_data(&json),
                            SseEvent::Done => state.finalize(true),
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(model = %state.model, "stream read error: {}", e);
                    state.finalize(false);
                }
                None => {
                    if let Some(event) = state.sse.flush() {
                        match event {
                            SseEvent::Data(json) => state.handle_data(&json),
                            SseEvent::Done => state.finalize(true),
                        }
                    }
                    if !state.finished {
                        state.finalize(false);
                    }
                }
            }
        }
    }))
}

fn map_request_error(
    error: reqwest::Error,
    endpoint: &ModelEndpoint,
    options: &ChatOptions,
) -> CouncilError {
    if error.is_timeout() {
        CouncilError::Timeout {
            model: endpoint.model.clone(),
            seconds: options.timeout.as_secs(),
        }
    } else if error.is_connect() {
        CouncilError::BackendUnreachable {
            url: endpoint.base_url.clone(),
            reason: error.to_string(),
        }
    } else {
        CouncilError::ProtocolError {
            model: endpoint.model.clone(),
            reason: error.to_string(),
        }
    }
}

fn first_nonempty(a: Option<String>, b: Option<String>) -> Option<String> {
    a.filter(|s| !s.is_empty()).or(b).filter(|s| !s.is_empty())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
