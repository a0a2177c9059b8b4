//! Shared test doubles for deliberation and title tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use council::client::think::split_thinking;
use council::client::{ChatBackend, ChatMessage, ChatOptions, ChunkStream, ModelOutput, StreamChunk};
use council::config::ModelEndpoint;
use council::error::{CouncilError, CouncilResult};

/// One scripted reply for one call to a model.
#[derive(Debug, Clone)]
pub enum ModelReply {
    /// Succeed with this text (think tags are split like the real client).
    Text(String),
    /// Succeed after a delay (tokio time, so paused clocks auto-advance).
    Delayed(String, Duration),
    /// Fail the call with a timeout.
    FailTimeout,
    /// Never produce anything (for cancellation tests).
    Hang,
    /// Rank every `Response X:` label found in the prompt, best first,
    /// with the given scores applied positionally after sorting
    /// descending. Missing scores default to 3.0.
    RankSeen(Vec<f32>),
}

/// A recorded model call.
#[derive(Debug, Clone)]
pub struct CallLog {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub streaming: bool,
}

/// Backend whose per-model replies are scripted in call order.
pub struct ScriptedBackend {
    replies: Mutex<HashMap<String, VecDeque<ModelReply>>>,
    pub calls: Mutex<Vec<CallLog>>,
    pub loaded_models: Vec<String>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            loaded_models: Vec::new(),
        }
    }

    /// Queue the next reply for `model`.
    pub fn script(&self, model: &str, reply: ModelReply) {
        self.replies
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn ranking_calls(&self) -> Vec<CallLog> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.messages.iter().any(|m| m.content.contains("FINAL RANKING")))
            .cloned()
            .collect()
    }

    fn next_reply(&self, model: &str) -> ModelReply {
        self.replies
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| ModelReply::Text(format!("default reply from {}", model)))
    }

    fn log(&self, model: &str, messages: &[ChatMessage], streaming: bool) {
        self.calls.lock().unwrap().push(CallLog {
            model: model.to_string(),
            messages: messages.to_vec(),
            streaming,
        });
    }

    async fn resolve_text(&self, model: &str, messages: &[ChatMessage]) -> CouncilResult<String> {
        match self.next_reply(model) {
            ModelReply::Text(text) => Ok(text),
            ModelReply::Delayed(text, delay) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
            ModelReply::FailTimeout => Err(CouncilError::Timeout {
                model: model.to_string(),
                seconds: 120,
            }),
            ModelReply::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            ModelReply::RankSeen(scores) => Ok(rank_seen(messages, &scores)),
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a ranking over the labels visible in the prompt.
fn rank_seen(messages: &[ChatMessage], scores: &[f32]) -> String {
    let mut labels: Vec<char> = Vec::new();
    for message in messages {
        for line in message.content.lines() {
            if let Some(rest) = line.strip_prefix("Response ") {
                if let Some(label) = rest.strip_suffix(':').and_then(|s| s.chars().next()) {
                    if label.is_ascii_uppercase() && !labels.contains(&label) {
                        labels.push(label);
                    }
                }
            }
        }
    }

    let mut scored: Vec<(char, f32)> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| (*label, scores.get(i).copied().unwrap_or(3.0)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut out = String::new();
    for (label, score) in &scored {
        out.push_str(&format!("Response {} feedback line. ({}/5)\n", label, score));
    }
    out.push_str("FINAL RANKING:\n");
    for (i, (label, score)) in scored.iter().enumerate() {
        out.push_str(&format!("{}. Response {} ({}/5)\n", i + 1, label, score));
    }
    out
}

/// Turn final text into the chunk sequence a real stream would yield.
fn chunks_for(text: &str) -> Vec<CouncilResult<StreamChunk>> {
    let (content, thinking) = split_thinking(text);
    let mut chunks: Vec<CouncilResult<StreamChunk>> = Vec::new();
    if let Some(t) = &thinking {
        chunks.push(Ok(StreamChunk::Thinking(t.clone())));
    }
    let words: Vec<&str> = content.split_inclusive(' ').collect();
    for word in words {
        chunks.push(Ok(StreamChunk::Content(word.to_string())));
    }
    chunks.push(Ok(StreamChunk::Done(ModelOutput { content, thinking })));
    chunks
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> CouncilResult<ModelOutput> {
        self.log(&endpoint.model, messages, false);
        let text = self.resolve_text(&endpoint.model, messages).await?;
        let (content, thinking) = split_thinking(&text);
        Ok(ModelOutput { content, thinking })
    }

    async fn complete_stream(
        &self,
        endpoint: &ModelEndpoint,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> CouncilResult<ChunkStream> {
        self.log(&endpoint.model, messages, true);
        let text = self.resolve_text(&endpoint.model, messages).await?;
        Ok(Box::pin(stream::iter(chunks_for(&text))))
    }

    async fn list_models(&self, _base_url: &str) -> CouncilResult<Vec<String>> {
        Ok(self.loaded_models.clone())
    }
}

/// Config fixture: three council members and a chairman.
pub fn test_config(rounds: u32, enable_cross_review: bool) -> council::CouncilConfig {
    council::CouncilConfig::from_json(
        &serde_json::json!({
            "server": {"api_base_url": "http://test:1/v1"},
            "models": {
                "chairman": {"id": "chairman"},
                "council_members": [
                    {"id": "alpha"},
                    {"id": "beta"},
                    {"id": "gamma"}
                ]
            },
            "deliberation": {
                "rounds": rounds,
                "max_rounds": 5,
                "enable_cross_review": enable_cross_review,
                "quality_threshold": 1.5
            },
            "title_generation": {"enabled": true, "max_concurrent": 2}
        })
        .to_string(),
    )
    .unwrap()
}
