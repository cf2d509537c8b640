//! A broadcast-channel reference implementation of [`EventPublisher`].
//!
//! Fire-and-forget: if there are no receivers, `publish` simply drops the
//! event. Slow or absent consumers never block the originating operation.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

use agentkit_types::{EventPublisher, ObserverEvent};

/// Publishes [`ObserverEvent`]s onto a `tokio::sync::broadcast` channel.
pub struct BroadcastEventPublisher {
    sender: broadcast::Sender<ObserverEvent>,
}

impl BroadcastEventPublisher {
    /// Construct a publisher with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream. Lagging subscribers miss events rather
    /// than block the publisher; see [`broadcast::Receiver`] semantics.
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastEventPublisher {
    async fn publish(&self, event: ObserverEvent) {
        trace!(?event, "publishing observer event");
        let _ = self.sender.send(event);
    }
}
