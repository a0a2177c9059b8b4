//! Deliberation orchestrator for local LLM councils.
//!
//! Answers a user query by coordinating several locally hosted models
//! through a fixed three-stage protocol:
//!
//! 1. **Parallel draft**: the query fans out to every council model.
//! 2. **Peer ranking**: drafts are anonymized and cross-ranked for one
//!    or more rounds, with optional refinement sub-rounds while
//!    quality stays under a threshold.
//! 3. **Synthesis**: a chairman model writes the final answer from the
//!    full deliberation trace.
//!
//! A background title service names new conversations from their first
//! user message and pushes progress to subscribers.

pub mod anonymize;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod metrics;
pub mod push;
pub mod ranking;
pub mod stages;
pub mod store;
pub mod title;
pub mod types;
pub mod validate;

// Re-export the request-facing surface.
pub use client::{ChatBackend, ChatMessage, ChatOptions, HttpModelClient, ModelOutput, StreamChunk};
pub use config::{CouncilConfig, EndpointResolver, ModelEndpoint};
pub use controller::{
    DeliberationController, DeliberationHandle, DeliberationPhase, DeliberationRequest,
};
pub use error::{CouncilError, CouncilResult, ErrorKind};
pub use events::{DeliberationEvent, EventKind, EventReceiver};
pub use push::{PushBroker, PushSubscriber, TitlePush};
pub use store::{ConversationStore, FileStore};
pub use title::{TitleService, TitleStatus};
pub use types::{Conversation, DeliberationRecord, Message, Role};
pub use validate::{validate_startup, ValidationReport};
