//! Per-model timing and throughput tracking.
//!
//! Token counts use whitespace-separated word count as a proxy for
//! real tokenizer output. The same proxy feeds both the live
//! tokens-per-second badge and the persisted trace, so the two never
//! disagree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

const MIN_GENERATION_SECS: f64 = 1e-6;

/// Derived timing for one completed model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTiming {
    /// Seconds from request start to the first content token
    /// (covers network latency plus any thinking segment).
    pub thinking_seconds: f64,
    /// Seconds from request start to stream end.
    pub elapsed_seconds: f64,
    /// Content tokens per second of generation time.
    pub tokens_per_second: f64,
    /// Whitespace-word count of the content.
    pub content_tokens: usize,
    /// Seconds from request start to the first token of any kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_token_seconds: Option<f64>,
}

/// Live timer owned by a single model task. Single-writer: only the
/// task driving the model call touches it.
#[derive(Debug)]
pub struct ModelTimer {
    start: Instant,
    first_token: Option<Instant>,
    first_content: Option<Instant>,
    content_tokens: usize,
    prev_ends_mid_word: bool,
}

impl ModelTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            first_token: None,
            first_content: None,
            content_tokens: 0,
            prev_ends_mid_word: false,
        }
    }

    /// Record a thinking delta (counts toward first-token latency only).
    pub fn on_thinking(&mut self) {
        if self.first_token.is_none() {
            self.first_token = Some(Instant::now());
        }
    }

    /// Record a content delta, updating the word-proxy token count.
    ///
    /// A word split across two deltas must not count twice, so the
    /// timer remembers whether the previous delta ended mid-word.
    pub fn on_content(&mut self, delta: &str) {
        let now = Instant::now();
        if self.first_token.is_none() {
            self.first_token = Some(now);
        }
        if self.first_content.is_none() {
            self.first_content = Some(now);
        }

        let words = delta.split_whitespace().count();
        let continues_previous = self.prev_ends_mid_word
            && delta
                .chars()
                .next()
                .is_some_and(|c| !c.is_whitespace());

        self.content_tokens += words;
        if continues_previous && words > 0 {
            self.content_tokens -= 1;
        }

        if let Some(last) = delta.chars().last() {
            self.prev_ends_mid_word = !last.is_whitespace();
        }
    }

    /// Tokens per second so far, for live badges while streaming.
    pub fn current_tps(&self) -> f64 {
        match self.first_content {
            Some(first) => {
                let secs = first.elapsed().as_secs_f64().max(MIN_GENERATION_SECS);
                self.content_tokens as f64 / secs
            }
            None => 0.0,
        }
    }

    pub fn content_tokens(&self) -> usize {
        self.content_tokens
    }

    /// Close the timer and produce the final report.
    pub fn finish(self) -> ModelTiming {
        let end = Instant::now();
        let elapsed_seconds = (end - self.start).as_secs_f64();
        let thinking_seconds = self
            .first_content
            .map(|t| (t - self.start).as_secs_f64())
            .unwrap_or(elapsed_seconds);
        let generation = self
            .first_content
            .map(|t| (end - t).as_secs_f64())
            .unwrap_or(0.0)
            .max(MIN_GENERATION_SECS);

        ModelTiming {
            thinking_seconds,
            elapsed_seconds,
            tokens_per_second: self.content_tokens as f64 / generation,
            content_tokens: self.content_tokens,
            first_token_seconds: self.first_token.map(|t| (t - self.start).as_secs_f64()),
        }
    }
}

/// Aggregates completed timings keyed by `(request_id, model)`.
#[derive(Debug, Default)]
pub struct TokenTracker {
    reports: Mutex<HashMap<(String, String), ModelTiming>>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, request_id: &str, model: &str, timing: ModelTiming) {
        self.reports
            .lock()
            .expect("tracker mutex poisoned")
            .insert((request_id.to_string(), model.to_string()), timing);
    }

    pub fn get(&self, request_id: &str, model: &str) -> Option<ModelTiming> {
        self.reports
            .lock()
            .expect("tracker mutex poisoned")
            .get(&(request_id.to_string(), model.to_string()))
            .cloned()
    }

    /// All reports for one request, for end-of-request summaries.
    pub fn for_request(&self, request_id: &str) -> Vec<(String, ModelTiming)> {
        self.reports
            .lock()
            .expect("tracker mutex poisoned")
            .iter()
            .filter(|((req, _), _)| req == request_id)
            .map(|((_, model), timing)| (model.clone(), timing.clone()))
            .collect()
    }
}
