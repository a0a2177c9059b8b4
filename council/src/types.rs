//! Conversation data model and deliberation trace records.
//!
//! Conversations are owned by the persistence store; a
//! `DeliberationRecord` is built in memory during a request and
//! attached to the assistant message when the request completes.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::metrics::ModelTiming;
use crate::ranking::aggregate::AggregateScore;
use crate::ranking::parser::ParseWarning;

/// Legacy placeholder some stored conversations still carry.
pub const LEGACY_PLACEHOLDER: &str = "New Conversation";

fn placeholder_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Conversation [0-9a-f]{8}$").expect("static regex"))
}

/// Build the placeholder title for a freshly created conversation.
pub fn placeholder_title(id: &Uuid) -> String {
    let hex = id.as_simple().to_string();
    format!("Conversation {}", &hex[..8])
}

/// Whether a title still needs generation.
///
/// True exactly for `Conversation <8 lowercase hex chars>` and the
/// legacy literal `New Conversation`.
pub fn is_generic_title(title: &str) -> bool {
    title == LEGACY_PLACEHOLDER || placeholder_pattern().is_match(title)
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Full deliberation trace, present on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliberation: Option<DeliberationRecord>,
}

impl Message {
    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
            created_at: Utc::now(),
            deliberation: None,
        }
    }

    pub fn assistant(content: &str, deliberation: DeliberationRecord) -> Self {
        Self {
            role: Role::Assistant,
            content: content.to_string(),
            created_at: Utc::now(),
            deliberation: Some(deliberation),
        }
    }
}

/// A conversation record as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Create a conversation with a fresh id and placeholder title.
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            title: placeholder_title(&id),
            id,
            created_at: Utc::now(),
            deleted: false,
            deleted_at: None,
            messages: Vec::new(),
        }
    }

    /// Soft-delete. Idempotent: a second delete keeps the original
    /// `deleted_at`.
    pub fn soft_delete(&mut self) {
        if !self.deleted {
            self.deleted = true;
            self.deleted_at = Some(Utc::now());
        }
    }

    /// Restore from soft-delete, clearing both flag and timestamp.
    pub fn restore(&mut self) {
        self.deleted = false;
        self.deleted_at = None;
    }

    /// Whether the title still matches the placeholder form.
    pub fn needs_title(&self) -> bool {
        is_generic_title(&self.title)
    }

    /// Number of user messages (title generation requires at least one).
    pub fn user_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal error info for a single model within a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// One council model's Stage-1 draft (or its failure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRecord {
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<ModelTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ModelFailure>,
}

impl DraftRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A peer as ranked by one ranker, de-anonymized to its model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedPeer {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// One ranker's output in one Stage-2 round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRecord {
    pub ranker: String,
    pub raw_text: String,
    /// Ordered best-first; empty when the ranking was unparseable.
    pub parsed: Vec<RankedPeer>,
    #[serde(default)]
    pub warnings: Vec<ParseWarning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<ModelTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ModelFailure>,
}

/// One council model's refined draft after peer feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementRecord {
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<ModelTiming>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ModelFailure>,
}

/// One Stage-2 round: all rankings, the aggregate, and any refinements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRound {
    /// 1-indexed round number.
    pub round: u32,
    pub rankings: Vec<RankingRecord>,
    /// Merged order across rankers, best first.
    pub aggregate: Vec<AggregateScore>,
    pub refinement_triggered: bool,
    #[serde(default)]
    pub refinements: Vec<RefinementRecord>,
}

/// The chairman's Stage-3 synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisRecord {
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<ModelTiming>,
}

/// Full trace of one deliberation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationRecord {
    pub request_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub drafts: Vec<DraftRecord>,
    pub rounds: Vec<RankingRound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<SynthesisRecord>,
    /// Set when the caller cancelled mid-request.
    #[serde(default)]
    pub cancelled: bool,
}

impl DeliberationRecord {
    pub fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            created_at: Utc::now(),
            drafts: Vec::new(),
            rounds: Vec::new(),
            synthesis: None,
            cancelled: false,
        }
    }

    /// Models that produced a usable Stage-1 draft.
    pub fn surviving_models(&self) -> Vec<&str> {
        self.drafts
            .iter()
            .filter(|d| d.succeeded())
            .map(|d| d.model.as_str())
            .collect()
    }
}
