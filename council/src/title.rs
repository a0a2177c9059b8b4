//! Background title generation with a two-class priority queue.
//!
//! A worker pool of `max_concurrent` tasks drains immediate jobs
//! before background jobs; an immediate enqueue preempts the queue
//! head but never an in-progress job. Jobs are deduplicated per
//! conversation id and are not persisted: a startup rescan re-enqueues
//! conversations whose title still matches the placeholder form.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ChatBackend, ChatOptions, ModelOutput, StreamChunk};
use crate::config::{EndpointResolver, TitleConfig};
use crate::error::{CouncilError, CouncilResult};
use crate::push::{PushBroker, TitlePush};
use crate::stages::prompts;
use crate::store::ConversationStore;
use crate::types::{is_generic_title, Role};

const RETRY_BASE_DELAY_MS: u64 = 500;
const RETRY_MAX_DELAY_MS: u64 = 10_000;
const FALLBACK_TITLE_CHARS: usize = 40;

/// Lifecycle of one title job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleStatus {
    Queued,
    Generating,
    Thinking,
    Complete,
    Error,
}

impl TitleStatus {
    /// Whether a job in this status blocks a duplicate enqueue.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Generating | Self::Thinking)
    }
}

impl std::fmt::Display for TitleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Generating => write!(f, "generating"),
            Self::Thinking => write!(f, "thinking"),
            Self::Complete => write!(f, "complete"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Queue priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitlePriority {
    Immediate,
    Background,
}

#[derive(Debug, Clone)]
struct TitleJob {
    conversation_id: Uuid,
    first_message: String,
    priority: TitlePriority,
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    immediate: VecDeque<TitleJob>,
    background: VecDeque<TitleJob>,
    statuses: HashMap<Uuid, TitleStatus>,
    shutdown: bool,
}

/// The background title service.
pub struct TitleService {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn ConversationStore>,
    resolver: EndpointResolver,
    chairman: String,
    config: TitleConfig,
    broker: Arc<PushBroker>,
    queue: Mutex<QueueState>,
    notify: Notify,
}

impl TitleService {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn ConversationStore>,
        resolver: EndpointResolver,
        chairman: String,
        config: TitleConfig,
        broker: Arc<PushBroker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            store,
            resolver,
            chairman,
            config,
            broker,
            queue: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    /// Spawn the worker pool. One worker per concurrency slot keeps
    /// the generating-jobs cap equal to `max_concurrent`.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("title generation disabled");
            return;
        }
        for worker in 0..self.config.max_concurrent {
            let service = Arc::clone(self);
            tokio::spawn(service.worker_loop(worker));
        }
    }

    pub async fn shutdown(&self) {
        self.queue.lock().await.shutdown = true;
        self.notify.notify_waiters();
    }

    /// Enqueue with immediate priority. Returns false when the job was
    /// deduplicated or the service is disabled.
    pub async fn enqueue_immediate(&self, conversation_id: Uuid, first_message: &str) -> bool {
        self.enqueue(conversation_id, first_message, TitlePriority::Immediate)
            .await
    }

    pub async fn enqueue_background(&self, conversation_id: Uuid, first_message: &str) -> bool {
        self.enqueue(conversation_id, first_message, TitlePriority::Background)
            .await
    }

    async fn enqueue(
        &self,
        conversation_id: Uuid,
        first_message: &str,
        priority: TitlePriority,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        let mut queue = self.queue.lock().await;
        if queue
            .statuses
            .get(&conversation_id)
            .is_some_and(|s| s.is_active())
        {
            debug!(conversation = %conversation_id, "title job already active, enqueue is a no-op");
            return false;
        }

        queue.statuses.insert(conversation_id, TitleStatus::Queued);
        let job = TitleJob {
            conversation_id,
            first_message: first_message.to_string(),
            priority,
            attempts: 0,
        };
        match priority {
            TitlePriority::Immediate => queue.immediate.push_back(job),
            TitlePriority::Background => queue.background.push_back(job),
        }
        drop(queue);

        self.publish(conversation_id, TitleStatus::Queued, None);
        self.notify.notify_one();
        true
    }

    /// Re-enqueue a retry without the dedupe check (the job is still
    /// marked active in the status map).
    async fn requeue(&self, job: TitleJob) {
        let mut queue = self.queue.lock().await;
        queue
            .statuses
            .insert(job.conversation_id, TitleStatus::Queued);
        match job.priority {
            TitlePriority::Immediate => queue.immediate.push_back(job),
            TitlePriority::Background => queue.background.push_back(job),
        }
        drop(queue);
        self.notify.notify_one();
    }

    /// Startup rescan: background-enqueue every conversation whose
    /// title still matches the placeholder form and which has at least
    /// one message.
    pub async fn rescan(&self) -> CouncilResult<usize> {
        let conversations = self.store.list_active().await?;
        let mut enqueued = 0;
        for conversation in conversations {
            if !is_generic_title(&conversation.title) || conversation.messages.is_empty() {
                continue;
            }
            let Some(first) = conversation
                .messages
                .iter()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
            else {
                continue;
            };
            if self
                .enqueue_background(conversation.id, &first)
                .await
            {
                enqueued += 1;
            }
        }
        info!(enqueued, "title rescan complete");
        Ok(enqueued)
    }

    /// Current status of a conversation's job, if the service has seen
    /// one.
    pub async fn status(&self, conversation_id: &Uuid) -> Option<TitleStatus> {
        self.queue
            .lock()
            .await
            .statuses
            .get(conversation_id)
            .copied()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "title worker started");
        loop {
            let job = {
                let mut queue = self.queue.lock().await;
                if queue.shutdown {
                    return;
                }
                queue
                    .immediate
                    .pop_front()
                    .or_else(|| queue.background.pop_front())
            };
            match job {
                Some(job) => self.process(job).await,
                None => self.notify.notified().await,
            }
        }
    }

    async fn process(self: &Arc<Self>, mut job: TitleJob) {
        let conversation_id = job.conversation_id;
        self.set_status(conversation_id, TitleStatus::Generating).await;
        self.publish(conversation_id, TitleStatus::Generating, None);

        match self.generate(&job).await {
            Ok(raw) => {
                let title = self
                    .extract_title(&raw)
                    .unwrap_or_else(|| fallback_title(&job.first_message));
                match self.store.update_title(&conversation_id, &title).await {
                    Ok(()) => {
                        self.set_status(conversation_id, TitleStatus::Complete).await;
                        self.publish(conversation_id, TitleStatus::Complete, Some(title));
                    }
                    Err(e) => {
                        warn!(conversation = %conversation_id, "title persist failed: {}", e);
                        self.fail(conversation_id, &e).await;
                    }
                }
            }
            Err(e) if e.is_transient() && job.attempts < self.config.retry_attempts => {
                job.attempts += 1;
                let delay = retry_delay(job.attempts);
                warn!(
                    conversation = %conversation_id,
                    attempt = job.attempts,
                    "title generation failed ({}), retrying in {:?}",
                    e,
                    delay
                );
                self.set_status(conversation_id, TitleStatus::Queued).await;
                let service = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    service.requeue(job).await;
                });
            }
            Err(e) => {
                warn!(conversation = %conversation_id, "title generation failed terminally: {}", e);
                self.fail(conversation_id, &e).await;
            }
        }
    }

    async fn fail(&self, conversation_id: Uuid, error: &CouncilError) {
        // Placeholder title stays in place; no further attempts.
        self.set_status(conversation_id, TitleStatus::Error).await;
        self.publish(
            conversation_id,
            TitleStatus::Error,
            Some(error.to_string()),
        );
    }

    async fn generate(&self, job: &TitleJob) -> CouncilResult<String> {
        let endpoint = self.resolver.resolve(&self.chairman);
        let messages = prompts::title_messages(&job.first_message);
        let budget = Duration::from_secs(self.config.timeout_seconds);
        let options = ChatOptions::with_timeout(budget);

        if !self.is_thinking_chairman() {
            let output = self.backend.complete(&endpoint, &messages, &options).await?;
            return Ok(output.content);
        }

        // Reasoning chairmen stream so subscribers see thinking progress.
        let mut stream = self
            .backend
            .complete_stream(&endpoint, &messages, &options)
            .await?;
        let deadline = Instant::now() + budget;
        let mut announced_thinking = false;

        loop {
            let item = timeout_at(deadline, stream.next())
                .await
                .map_err(|_| CouncilError::Timeout {
                    model: self.chairman.clone(),
                    seconds: budget.as_secs(),
                })?;
            match item {
                Some(Ok(StreamChunk::Thinking(delta))) => {
                    if !announced_thinking {
                        announced_thinking = true;
                        self.set_status(job.conversation_id, TitleStatus::Thinking).await;
                    }
                    self.publish(job.conversation_id, TitleStatus::Thinking, Some(delta));
                }
                Some(Ok(StreamChunk::Content(_))) => {}
                Some(Ok(StreamChunk::Done(ModelOutput { content, .. }))) => return Ok(content),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(CouncilError::ProtocolError {
                        model: self.chairman.clone(),
                        reason: "title stream ended without a terminal chunk".to_string(),
                    })
                }
            }
        }
    }

    fn is_thinking_chairman(&self) -> bool {
        let name = self.chairman.to_lowercase();
        self.config
            .thinking_model_hints
            .iter()
            .any(|hint| name.contains(&hint.to_lowercase()))
    }

    /// Clean the model's raw output into a usable title, or `None`
    /// when the result must fall back to the user message.
    fn extract_title(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim().trim_matches(['"', '\'', '\u{201c}', '\u{201d}']);
        let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
        let cleaned = collapsed
            .trim_end_matches(['.', '!', '?', ',', ';', ':'])
            .trim()
            .to_string();

        if cleaned.is_empty() || is_generic_title(&cleaned) {
            return None;
        }
        Some(cleaned)
    }

    async fn set_status(&self, conversation_id: Uuid, status: TitleStatus) {
        self.queue
            .lock()
            .await
            .statuses
            .insert(conversation_id, status);
    }

    fn publish(&self, conversation_id: Uuid, status: TitleStatus, data: Option<String>) {
        self.broker.publish(TitlePush {
            conversation_id,
            status,
            data,
        });
    }
}

/// Exponential backoff for retry attempt `n` (1-indexed).
fn retry_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY_MS.saturating_mul(1_u64 << attempt.min(16));
    Duration::from_millis(exp.min(RETRY_MAX_DELAY_MS))
}

/// First `FALLBACK_TITLE_CHARS` characters of the user message, with
/// an ellipsis when truncated.
pub fn fallback_title(first_message: &str) -> String {
    let trimmed = first_message.trim();
    let truncated: String = trimmed.chars().take(FALLBACK_TITLE_CHARS).collect();
    if truncated.chars().count() < trimmed.chars().count() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
