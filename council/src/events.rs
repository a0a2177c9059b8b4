//! Typed deliberation events and the per-request event channel.
//!
//! One bounded channel per request: model tasks clone the sender and
//! the caller owns the single receiver. A full channel blocks emitters,
//! which throttles token production end to end. Within one model the
//! emission order is preserved; across models no order is guaranteed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ErrorKind;

/// Bounded channel capacity per request.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event payloads, tagged for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Stage1Start {
        models: Vec<String>,
    },
    Stage1Token {
        model: String,
        delta: String,
        /// Live tokens-per-second badge for this model.
        tps: f64,
    },
    Stage1ModelComplete {
        model: String,
        ok: bool,
    },
    Stage1Complete {
        succeeded: usize,
        failed: usize,
    },
    Stage2RoundStart {
        round: u32,
        max_rounds: u32,
    },
    Stage2Token {
        model: String,
        round: u32,
        delta: String,
    },
    Stage2ModelComplete {
        model: String,
        round: u32,
    },
    Stage2RefinementStart {
        round: u32,
        models: Vec<String>,
    },
    Stage2RefinementToken {
        model: String,
        round: u32,
        delta: String,
    },
    Stage2RoundComplete {
        round: u32,
        next_round_triggered: bool,
    },
    Stage2Complete {
        rounds_run: u32,
    },
    Stage3Start {
        model: String,
    },
    Stage3Token {
        delta: String,
    },
    Stage3Complete,
    /// Fatal; always the last event on the stream.
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Stage1Start { .. } => "stage1_start",
            Self::Stage1Token { .. } => "stage1_token",
            Self::Stage1ModelComplete { .. } => "stage1_model_complete",
            Self::Stage1Complete { .. } => "stage1_complete",
            Self::Stage2RoundStart { .. } => "stage2_round_start",
            Self::Stage2Token { .. } => "stage2_token",
            Self::Stage2ModelComplete { .. } => "stage2_model_complete",
            Self::Stage2RefinementStart { .. } => "stage2_refinement_start",
            Self::Stage2RefinementToken { .. } => "stage2_refinement_token",
            Self::Stage2RoundComplete { .. } => "stage2_round_complete",
            Self::Stage2Complete { .. } => "stage2_complete",
            Self::Stage3Start { .. } => "stage3_start",
            Self::Stage3Token { .. } => "stage3_token",
            Self::Stage3Complete => "stage3_complete",
            Self::Error { .. } => "error",
        }
    }

    /// Stage number for the envelope (0 for terminal errors).
    pub fn stage(&self) -> u8 {
        match self {
            Self::Stage1Start { .. }
            | Self::Stage1Token { .. }
            | Self::Stage1ModelComplete { .. }
            | Self::Stage1Complete { .. } => 1,
            Self::Stage2RoundStart { .. }
            | Self::Stage2Token { .. }
            | Self::Stage2ModelComplete { .. }
            | Self::Stage2RefinementStart { .. }
            | Self::Stage2RefinementToken { .. }
            | Self::Stage2RoundComplete { .. }
            | Self::Stage2Complete { .. } => 2,
            Self::Stage3Start { .. } | Self::Stage3Token { .. } | Self::Stage3Complete => 3,
            Self::Error { .. } => 0,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Stage1Token { model, .. }
            | Self::Stage1ModelComplete { model, .. }
            | Self::Stage2Token { model, .. }
            | Self::Stage2ModelComplete { model, .. }
            | Self::Stage2RefinementToken { model, .. }
            | Self::Stage3Start { model } => Some(model),
            _ => None,
        }
    }

    pub fn round(&self) -> Option<u32> {
        match self {
            Self::Stage2RoundStart { round, .. }
            | Self::Stage2Token { round, .. }
            | Self::Stage2ModelComplete { round, .. }
            | Self::Stage2RefinementStart { round, .. }
            | Self::Stage2RefinementToken { round, .. }
            | Self::Stage2RoundComplete { round, .. } => Some(*round),
            _ => None,
        }
    }
}

/// Envelope delivered to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliberationEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub stage: u8,
    pub timestamp: DateTime<Utc>,
}

impl DeliberationEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            stage: kind.stage(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Create a bounded per-request channel.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSender { tx }, rx)
}

pub type EventReceiver = mpsc::Receiver<DeliberationEvent>;

/// Cloneable emitter handed to every model task.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<DeliberationEvent>,
}

impl EventSender {
    /// Emit one event, waiting for channel capacity. A closed channel
    /// (caller gone) is not an error for the emitter.
    pub async fn emit(&self, kind: EventKind) {
        let _ = self.tx.send(DeliberationEvent::new(kind)).await;
    }

    /// Sender for blocking-mode requests where nobody consumes events.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}
