//! Broadcast of session lifecycle events.

use courier_core::Identity;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Buffered events per subscriber before old ones are dropped.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle change for one identity's session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A new session record was created.
    Created {
        identity: Identity,
        /// The persisted credential was still fresh and was reused.
        reused_stored: bool,
    },
    /// The cached credential was replaced in place.
    Refreshed { identity: Identity },
    /// An in-place refresh failed; the session is being recreated.
    RefreshFailed { identity: Identity, reason: String },
    /// The session record was torn down.
    Deleted { identity: Identity, destroyed: bool },
}

/// Fan-out of `SessionEvent`s to any number of subscribers.
///
/// Emitting never blocks; subscribers that fall behind lose the oldest events.
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an event bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event to current subscribers.
    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Stream of live events, skipping over any a slow consumer missed.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move {
                if let Err(e) = &res {
                    tracing::debug!("Session event subscriber lagged: {e}");
                }
                res.ok()
            })
            .boxed()
    }
}
