//! Deliberation controller: top-level state machine for one request.
//!
//! Drives the three stages, assembles the trace, persists the
//! assistant message, and kicks off title generation for first
//! messages. Cancellation propagates to every in-flight model call
//! through a shared token; tokens already emitted are kept.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{ChatBackend, ChatMessage};
use crate::config::CouncilConfig;
use crate::error::{CouncilError, CouncilResult};
use crate::events::{channel, EventKind, EventReceiver, EventSender};
use crate::metrics::TokenTracker;
use crate::stages::StageRunner;
use crate::store::ConversationStore;
use crate::title::TitleService;
use crate::types::{DeliberationRecord, Message, Role};

/// Phase of one deliberation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliberationPhase {
    Idle,
    Stage1,
    Stage2Round { round: u32 },
    Refine { round: u32 },
    Stage3,
    Done,
    Failed,
}

impl DeliberationPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `to` is a legal successor of this phase.
    pub fn allows(self, to: DeliberationPhase) -> bool {
        if to == Self::Failed {
            return !self.is_terminal();
        }
        match (self, to) {
            (Self::Idle, Self::Stage1) => true,
            (Self::Stage1, Self::Stage2Round { round: 1 }) => true,
            (Self::Stage2Round { round: r }, Self::Refine { round: s }) => r == s,
            (Self::Refine { round: r }, Self::Stage2Round { round: s }) => s == r + 1,
            (Self::Stage2Round { .. }, Self::Stage3) => true,
            (Self::Stage3, Self::Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for DeliberationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Stage1 => write!(f, "stage1"),
            Self::Stage2Round { round } => write!(f, "stage2_round({})", round),
            Self::Refine { round } => write!(f, "refine({})", round),
            Self::Stage3 => write!(f, "stage3"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: DeliberationPhase,
    pub to: DeliberationPhase,
    pub timestamp: DateTime<Utc>,
}

/// Validated phase tracking for one request.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: DeliberationPhase,
    history: Vec<PhaseTransition>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: DeliberationPhase::Idle,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> DeliberationPhase {
        self.phase
    }

    pub fn history(&self) -> &[PhaseTransition] {
        &self.history
    }

    /// Transition, rejecting paths the machine does not allow.
    pub fn advance(&mut self, to: DeliberationPhase) -> CouncilResult<()> {
        if !self.phase.allows(to) {
            return Err(CouncilError::ProtocolError {
                model: String::new(),
                reason: format!("invalid phase transition {} -> {}", self.phase, to),
            });
        }
        debug!(from = %self.phase, to = %to, "phase transition");
        self.history.push(PhaseTransition {
            from: self.phase,
            to,
            timestamp: Utc::now(),
        });
        self.phase = to;
        Ok(())
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A submitted deliberation request.
#[derive(Debug, Clone)]
pub struct DeliberationRequest {
    pub conversation_id: Uuid,
    pub content: String,
}

/// Handle returned to streaming callers.
pub struct DeliberationHandle {
    pub request_id: Uuid,
    /// Single-consumer event stream for this request.
    pub events: EventReceiver,
    /// Cancelling aborts every in-flight model call.
    pub cancel: CancellationToken,
    /// Resolves to the final record (or the failure) once the stream ends.
    pub result: JoinHandle<CouncilResult<DeliberationRecord>>,
}

/// Top-level orchestrator shared across requests.
pub struct DeliberationController {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn ConversationStore>,
    config: CouncilConfig,
    titles: Option<Arc<TitleService>>,
    tracker: Arc<TokenTracker>,
}

impl DeliberationController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn ConversationStore>,
        config: CouncilConfig,
        titles: Option<Arc<TitleService>>,
    ) -> Self {
        Self {
            backend,
            store,
            config,
            titles,
            tracker: Arc::new(TokenTracker::new()),
        }
    }

    /// Per-model timing reports keyed by `(request_id, model)`.
    pub fn tracker(&self) -> &Arc<TokenTracker> {
        &self.tracker
    }

    /// Blocking mode: run the full deliberation and return the record.
    pub async fn run_blocking(
        &self,
        request: DeliberationRequest,
    ) -> CouncilResult<DeliberationRecord> {
        self.run_internal(
            request,
            EventSender::disabled(),
            CancellationToken::new(),
        )
        .await
    }

    /// Streaming mode: spawn the request and hand back the event
    /// channel. A fatal failure emits one terminating `error` event.
    pub fn submit(self: &Arc<Self>, request: DeliberationRequest) -> DeliberationHandle {
        let request_id = Uuid::new_v4();
        let (sender, receiver) = channel();
        let cancel = CancellationToken::new();

        let controller = Arc::clone(self);
        let task_cancel = cancel.clone();
        let result = tokio::spawn(async move {
            let outcome = controller
                .run_with_id(request, request_id, sender.clone(), task_cancel)
                .await;
            if let Err(e) = &outcome {
                sender
                    .emit(EventKind::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    })
                    .await;
            }
            outcome
        });

        DeliberationHandle {
            request_id,
            events: receiver,
            cancel,
            result,
        }
    }

    async fn run_internal(
        &self,
        request: DeliberationRequest,
        events: EventSender,
        cancel: CancellationToken,
    ) -> CouncilResult<DeliberationRecord> {
        self.run_with_id(request, Uuid::new_v4(), events, cancel)
            .await
    }

    async fn run_with_id(
        &self,
        request: DeliberationRequest,
        request_id: Uuid,
        events: EventSender,
        cancel: CancellationToken,
    ) -> CouncilResult<DeliberationRecord> {
        let mut tracker = PhaseTracker::new();
        let mut record = DeliberationRecord::new(request_id);

        // Request accepted: persist the user message, then start.
        let conversation = self.store.get(&request.conversation_id).await?;
        self.store
            .append_message(&request.conversation_id, Message::user(&request.content))
            .await?;
        let is_first_user_message = conversation
            .messages
            .iter()
            .all(|m| m.role != Role::User);

        let mut history: Vec<ChatMessage> = conversation
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.to_string(),
                content: m.content.clone(),
            })
            .collect();
        history.push(ChatMessage::user(&request.content));

        let runner = StageRunner::new(
            Arc::clone(&self.backend),
            self.config.endpoint_resolver(),
            self.config.council_ids(),
            self.config.models.chairman.id.clone(),
            self.config.deliberation.clone(),
            events,
            cancel.clone(),
            request_id,
            Arc::clone(&self.tracker),
        );

        tracker.advance(DeliberationPhase::Stage1)?;
        let outcome = self
            .run_stages(&runner, &mut tracker, &mut record, &history, &request.content)
            .await;

        match outcome {
            Ok(answer) => {
                tracker.advance(DeliberationPhase::Done)?;
                self.store
                    .append_message(
                        &request.conversation_id,
                        Message::assistant(&answer, record.clone()),
                    )
                    .await?;
                info!(request = %request_id, phases = tracker.history().len(), "deliberation complete");

                if is_first_user_message {
                    self.maybe_enqueue_title(&request.conversation_id, &request.content)
                        .await;
                }
                Ok(record)
            }
            Err(CouncilError::Cancelled) => {
                // Keep what was produced; tag the trace; no title job.
                record.cancelled = true;
                let _ = tracker.advance(DeliberationPhase::Failed);
                let answer = record
                    .synthesis
                    .as_ref()
                    .map(|s| s.content.clone())
                    .unwrap_or_default();
                self.store
                    .append_message(
                        &request.conversation_id,
                        Message::assistant(&answer, record),
                    )
                    .await?;
                warn!(request = %request_id, "deliberation cancelled");
                Err(CouncilError::Cancelled)
            }
            Err(e) => {
                let _ = tracker.advance(DeliberationPhase::Failed);
                warn!(request = %request_id, "deliberation failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stage sequence; fills `record` incrementally so a cancellation
    /// or failure still leaves the completed stages in the trace.
    async fn run_stages(
        &self,
        runner: &StageRunner,
        tracker: &mut PhaseTracker,
        record: &mut DeliberationRecord,
        history: &[ChatMessage],
        query: &str,
    ) -> CouncilResult<String> {
        let drafts = runner.run_stage1(history).await?;
        record.drafts = drafts;

        tracker.advance(DeliberationPhase::Stage2Round { round: 1 })?;
        let stage2 = runner.run_stage2(query, &record.drafts).await?;

        // Replay the round path into the phase history.
        for round in &stage2.rounds {
            if round.refinement_triggered {
                tracker.advance(DeliberationPhase::Refine { round: round.round })?;
                tracker.advance(DeliberationPhase::Stage2Round {
                    round: round.round + 1,
                })?;
            }
        }
        record.rounds = stage2.rounds.clone();

        tracker.advance(DeliberationPhase::Stage3)?;
        let aggregate = stage2.final_aggregate().to_vec();
        let synthesis = runner
            .run_stage3(query, &stage2.final_contents, &aggregate)
            .await?;
        let answer = synthesis.content.clone();
        record.synthesis = Some(synthesis);
        Ok(answer)
    }

    async fn maybe_enqueue_title(&self, conversation_id: &Uuid, first_message: &str) {
        let Some(titles) = &self.titles else {
            return;
        };
        match self.store.get(conversation_id).await {
            Ok(conversation) if conversation.needs_title() => {
                titles
                    .enqueue_immediate(*conversation_id, first_message)
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!(conversation = %conversation_id, "title check failed: {}", e),
        }
    }
}
