//! Push broker for title-generation progress.
//!
//! Fire-and-forget delivery over a broadcast channel: publishers never
//! block on subscribers, and a subscriber that falls too far behind is
//! closed with a lag error instead of back-pressuring the title
//! workers. No replay: events published before a subscriber attaches
//! are gone.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CouncilError, CouncilResult};
use crate::title::TitleStatus;

/// Per-subscriber buffer before lag kicks in.
const BROKER_CAPACITY: usize = 256;

/// One progress envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitlePush {
    pub conversation_id: Uuid,
    pub status: TitleStatus,
    /// Title text on completion, thinking delta while reasoning,
    /// message on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Process-wide broker; initialized at startup, torn down at shutdown.
pub struct PushBroker {
    sender: broadcast::Sender<TitlePush>,
}

impl PushBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROKER_CAPACITY);
        Self { sender }
    }

    /// Deliver to all current subscribers. Zero subscribers is fine.
    pub fn publish(&self, event: TitlePush) {
        match self.sender.send(event) {
            Ok(count) => debug!(receivers = count, "title push delivered"),
            Err(_) => debug!("title push dropped (no subscribers)"),
        }
    }

    pub fn subscribe(&self) -> PushSubscriber {
        PushSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for PushBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscription. `recv` returns `Ok(None)` when the broker
/// shuts down and `SubscriberLagged` when this subscriber fell behind;
/// lagged subscribers must resubscribe rather than resume.
pub struct PushSubscriber {
    receiver: broadcast::Receiver<TitlePush>,
}

impl PushSubscriber {
    pub async fn recv(&mut self) -> CouncilResult<Option<TitlePush>> {
        match self.receiver.recv().await {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "push subscriber lagged, closing");
                Err(CouncilError::SubscriberLagged)
            }
        }
    }
}
