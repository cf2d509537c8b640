#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **agentkit-bus** – Message bus and transport abstraction for agentkit.
//!
//! This crate provides the `Transport` leaf abstraction and the `Bus`
//! facade that sits on top of it: the bus assigns message identity and
//! timestamp, applies the `NORMAL` priority default, fans out broadcasts,
//! and mediates subscribe/unsubscribe so exactly one handler chain is
//! active per agent. The in-memory `Transport` implementation is the
//! required reference transport; a remote transport (queue-based,
//! RPC-based) implements the same trait and is out of scope for this
//! crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use agentkit_types::{Message, Priority, SendOptions};

//─────────────────────────────
//  Handler abstraction
//─────────────────────────────

/// A push handler installed via `Subscribe`. The transport commits to
/// invoking `handle` for every message addressed to the subscribed agent
/// until `Unsubscribe` is called.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message.
    async fn handle(&self, message: Message);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    async fn handle(&self, message: Message) {
        (self)(message)
    }
}

//─────────────────────────────
//  Transport trait
//─────────────────────────────

/// Errors a `Transport` implementation can surface.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The recipient endpoint could not be resolved or reached.
    #[error("delivery to {0} failed: {1}")]
    DeliveryFailed(String, String),
}

/// The pluggable medium that actually conveys messages between endpoints.
///
/// Implementations must preserve per-sender ordering between any one sender
/// and one recipient when the underlying medium preserves it, and must
/// never reorder messages of the same priority from the same sender (spec
/// §4.2).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to the endpoint named by `message.to`.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Drain currently available messages addressed to `agent_id`.
    async fn receive(&self, agent_id: &str) -> Vec<Message>;

    /// Install a push handler for `agent_id`. Multiple subscribes for the
    /// same agent append handlers; each delivered message is offered to
    /// every handler in registration order.
    async fn subscribe(&self, agent_id: &str, handler: Arc<dyn MessageHandler>);

    /// Remove all handlers for `agent_id` and stop push delivery.
    async fn unsubscribe(&self, agent_id: &str);

    /// Release any background resources (pollers, connections). The
    /// in-memory reference transport has none.
    async fn cleanup(&self) {}
}

//─────────────────────────────
//  In-memory reference transport
//─────────────────────────────

/// Unbounded per-recipient list plus a per-recipient handler list.
///
/// `send` appends the message to the recipient's list and then, before
/// returning, invokes every installed handler for that recipient
/// synchronously, in registration order. This gives deterministic delivery
/// ordering, which is what the spec's end-to-end scenarios rely on.
#[derive(Default)]
pub struct InMemoryTransport {
    queues: RwLock<HashMap<String, Vec<Message>>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
}

impl InMemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        {
            let mut queues = self.queues.write().await;
            queues.entry(message.to.clone()).or_default().push(message.clone());
        }

        // Snapshot the handler list and drop the lock before invoking any of
        // them — user-supplied handlers must never run while a bus/transport
        // lock is held, or a handler's own `send` call could deadlock.
        let handlers = {
            let guard = self.handlers.read().await;
            guard.get(&message.to).cloned().unwrap_or_default()
        };

        for handler in &handlers {
            handler.handle(message.clone()).await;
        }

        trace!(to = %message.to, handlers = handlers.len(), "delivered message");
        Ok(())
    }

    async fn receive(&self, agent_id: &str) -> Vec<Message> {
        let mut queues = self.queues.write().await;
        queues.remove(agent_id).unwrap_or_default()
    }

    async fn subscribe(&self, agent_id: &str, handler: Arc<dyn MessageHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(agent_id.to_string()).or_default().push(handler);
    }

    async fn unsubscribe(&self, agent_id: &str) {
        let mut handlers = self.handlers.write().await;
        handlers.remove(agent_id);
    }
}

//─────────────────────────────
//  Bus
//─────────────────────────────

/// Errors the `Bus` facade itself can surface, distinct from transport
/// failures.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The underlying transport rejected a send.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Wraps a `Transport`. Assigns message identity and timestamp, applies
/// defaults, fans out broadcasts, and mediates subscribe/unsubscribe so
/// exactly one handler chain is active per agent (spec §4.2).
pub struct Bus {
    transport: Arc<dyn Transport>,
    /// Messages explicitly queued by the bus for later delivery, ahead of
    /// whatever the transport itself is holding. `receive` drains these
    /// first, then the transport's own queue, matching spec §4.2.
    pending: RwLock<HashMap<String, Vec<Message>>>,
    cleaned_up: AtomicBool,
}

impl Bus {
    /// Construct a bus over the given transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: RwLock::new(HashMap::new()),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Construct a bus over the in-memory reference transport.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTransport::new()))
    }

    /// Construct a `Message`, assign it a unique id and timestamp, default
    /// its priority to `NORMAL` when unspecified, and hand it to the
    /// transport. Returns the assigned id.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<String, BusError> {
        let id = uuid::Uuid::new_v4().to_string();
        let message = Message {
            id: id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            message_type: message_type.to_string(),
            payload,
            priority: options.priority.unwrap_or(Priority::Normal),
            timestamp: chrono::Utc::now(),
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            metadata: options.metadata,
        };
        debug!(id = %message.id, from, to, message_type, "sending message");
        self.transport.send(message).await?;
        Ok(id)
    }

    /// Issue one `send` per recipient, preserving the order of `recipients`
    /// in the returned id list.
    ///
    /// Partial failure: if any individual send fails, the error is
    /// surfaced and no further recipients are attempted; already-sent ids
    /// are returned alongside the error so callers can reason about what
    /// was delivered.
    pub async fn broadcast(
        &self,
        from: &str,
        recipients: &[String],
        message_type: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<Vec<String>, (Vec<String>, BusError)> {
        let mut ids = Vec::with_capacity(recipients.len());
        for to in recipients {
            match self
                .send(from, to, message_type, payload.clone(), options.clone())
                .await
            {
                Ok(id) => ids.push(id),
                Err(err) => return Err((ids, err)),
            }
        }
        Ok(ids)
    }

    /// Install a push handler for `agent_id`, mirroring the action to the
    /// transport.
    pub async fn subscribe(&self, agent_id: &str, handler: Arc<dyn MessageHandler>) {
        self.transport.subscribe(agent_id, handler).await;
    }

    /// Remove all handlers for `agent_id`, mirroring the action to the
    /// transport.
    pub async fn unsubscribe(&self, agent_id: &str) {
        self.transport.unsubscribe(agent_id).await;
        let mut pending = self.pending.write().await;
        pending.remove(agent_id);
    }

    /// Queue a message for `agent_id` ahead of transport delivery, without
    /// going through `send` (e.g. for redelivery/retry of a message already
    /// assigned an id elsewhere).
    pub async fn queue_for_later(&self, message: Message) {
        let mut pending = self.pending.write().await;
        pending.entry(message.to.clone()).or_default().push(message);
    }

    /// Drain the transport's per-agent queue plus any messages the bus has
    /// explicitly queued for later delivery, returning queued-first, then
    /// transport order.
    pub async fn receive(&self, agent_id: &str) -> Vec<Message> {
        let mut queued = {
            let mut pending = self.pending.write().await;
            pending.remove(agent_id).unwrap_or_default()
        };
        let mut from_transport = self.transport.receive(agent_id).await;
        queued.append(&mut from_transport);
        queued
    }

    /// Release background resources held by the underlying transport.
    pub async fn cleanup(&self) {
        self.transport.cleanup().await;
        self.cleaned_up.store(true, Ordering::SeqCst);
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if !self.cleaned_up.load(Ordering::SeqCst) {
            warn!("bus dropped without explicit cleanup() call");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct RecordingHandler {
        received: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: Message) {
            self.received.lock().await.push(message);
        }
    }

    #[tokio::test]
    async fn send_assigns_id_and_default_priority() {
        let bus = Bus::in_memory();
        let id = bus
            .send("a", "b", "greeting", serde_json::json!("hi"), SendOptions::default())
            .await
            .unwrap();

        let received = bus.receive("b").await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, id);
        assert_eq!(received[0].priority, Priority::Normal);
    }

    #[tokio::test]
    async fn subscribed_handler_observes_delivered_message_synchronously() {
        let bus = Bus::in_memory();
        let received = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "b",
            Arc::new(RecordingHandler {
                received: received.clone(),
            }),
        )
        .await;

        let id = bus
            .send("a", "b", "t", serde_json::json!({"k": 1}), SendOptions::default())
            .await
            .unwrap();

        let got = received.lock().await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, id);
    }

    #[tokio::test]
    async fn broadcast_preserves_recipient_order_and_correlation_id() {
        let bus = Bus::in_memory();
        let recipients = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let options = SendOptions {
            correlation_id: Some("X".to_string()),
            ..Default::default()
        };

        let ids = bus
            .broadcast("sender", &recipients, "t", serde_json::json!({"k": 1}), options)
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        for (recipient, id) in recipients.iter().zip(ids.iter()) {
            let msgs = bus.receive(recipient).await;
            assert_eq!(msgs.len(), 1);
            assert_eq!(&msgs[0].id, id);
            assert_eq!(msgs[0].from, "sender");
            assert_eq!(msgs[0].to, *recipient);
            assert_eq!(msgs[0].correlation_id.as_deref(), Some("X"));
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery_to_former_handler() {
        let bus = Bus::in_memory();
        let count = Arc::new(AtomicUsize::new(0));
        let counting = {
            let count = count.clone();
            Arc::new(move |_msg: Message| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        bus.subscribe("b", counting as Arc<dyn MessageHandler>).await;

        bus.send("a", "b", "t", serde_json::json!(1), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.unsubscribe("b").await;

        bus.send("a", "b", "t", serde_json::json!(2), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1, "handler must not fire after unsubscribe");
    }

    #[tokio::test]
    async fn multiple_subscribes_stack_and_fire_in_registration_order() {
        let bus = Bus::in_memory();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            let handler = Arc::new(move |_msg: Message| {
                let order = order.clone();
                let tag = tag.to_string();
                tokio::spawn(async move {
                    order.lock().await.push(tag);
                });
            });
            bus.subscribe("b", handler as Arc<dyn MessageHandler>).await;
        }

        bus.send("a", "b", "t", serde_json::json!(1), SendOptions::default())
            .await
            .unwrap();

        // Give the spawned recorders a moment; registration order is what
        // matters for dispatch, not necessarily completion order of a
        // detached task, so this only smoke-tests that both fired.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(order.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn receive_drains_queued_for_later_messages_before_transport_ones() {
        let bus = Bus::in_memory();

        bus.send("a", "b", "from-transport", serde_json::json!(1), SendOptions::default())
            .await
            .unwrap();

        let requeued = Message {
            id: "requeued-1".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
            message_type: "from-queue".to_string(),
            payload: serde_json::json!(2),
            priority: Priority::Normal,
            timestamp: chrono::Utc::now(),
            correlation_id: None,
            reply_to: None,
            metadata: None,
        };
        bus.queue_for_later(requeued.clone()).await;

        let received = bus.receive("b").await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].id, "requeued-1", "queued-for-later messages drain first");
        assert_eq!(received[1].message_type, "from-transport");

        // `receive` drains `pending` once; a second call sees only the
        // transport side, which is itself already empty here.
        assert!(bus.receive("b").await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_then_drop_does_not_warn_but_drop_without_cleanup_does() {
        let bus = Bus::in_memory();
        bus.cleanup().await;
        drop(bus);

        // No assertion beyond "doesn't panic": this documents that
        // dropping an already-`cleanup()`-ed bus is the quiet path. The
        // warning path (drop without cleanup) is exercised implicitly by
        // every other test in this module, none of which call `cleanup()`.
    }
}
