use async_trait::async_trait;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::Message;

/// Minimal capability set every agent implements.
///
/// This is deliberately a trait, not a base class to inherit from: lifecycle
/// framing (status tracking, metrics, error mapping) is a kernel helper in
/// `agentkit-agent` that wraps any `Arc<dyn Agent>`, not a superclass the
/// agent must extend. See spec §9, "Polymorphism over inheritance".
#[async_trait]
pub trait Agent: Send + Sync {
    /// The user-supplied body. May fail; the kernel never panics on a
    /// propagated error, it maps it to a structured [`crate::ErrorInfo`].
    async fn run(&self, input: serde_json::Value) -> Result<serde_json::Value>;

    /// React to an inbound message. The default implementation ignores the
    /// message; agents that participate in message routing override it,
    /// typically by synthesizing a `Context` from the message and calling
    /// back into their own `run`.
    async fn handle_message(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    /// Release any resources held by this agent body. Invoked by the
    /// lifecycle wrapper on every exit path of `execute` — success, failure,
    /// or cancellation. Default is a no-op.
    async fn cleanup(&self) {}
}

/// Event kinds emitted through the optional [`EventPublisher`] observer
/// interface. Exactly the taxonomy in spec §6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ObserverEvent {
    /// An agent's `execute` call began.
    AgentStarted {
        /// Id of the agent that started.
        agent_id: String,
        /// Request id of the execution.
        request_id: String,
    },
    /// An agent's `execute` call completed successfully.
    AgentCompleted {
        /// Id of the agent that completed.
        agent_id: String,
        /// Request id of the execution.
        request_id: String,
    },
    /// An agent's `execute` call failed.
    AgentFailed {
        /// Id of the agent that failed.
        agent_id: String,
        /// Request id of the execution.
        request_id: String,
        /// Stable error code, see [`crate::error_code`].
        code: String,
    },
    /// A message was accepted by the bus.
    MessageSent {
        /// Bus-assigned message id.
        message_id: String,
        /// Sending endpoint.
        from: String,
        /// Receiving endpoint.
        to: String,
    },
    /// A message was delivered to a subscribed handler.
    MessageReceived {
        /// Bus-assigned message id.
        message_id: String,
        /// Receiving endpoint.
        to: String,
    },
    /// A fallback agent was invoked after primary retry exhaustion.
    FallbackTriggered {
        /// Id of the primary agent.
        primary_agent_id: String,
        /// Id of the fallback agent invoked.
        fallback_agent_id: String,
    },
    /// A circuit breaker transitioned into the `OPEN` state.
    CircuitBreakerOpened {
        /// Id of the agent whose breaker opened.
        agent_id: String,
    },
    /// A circuit breaker transitioned back into the `CLOSED` state.
    CircuitBreakerClosed {
        /// Id of the agent whose breaker closed.
        agent_id: String,
    },
}

/// Optional observer interface surrounding the kernel (spec §6).
///
/// Implementations must never let a publish failure propagate back into the
/// originating operation — the kernel calls `publish` and ignores its
/// result beyond logging.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event. Implementations should complete quickly and avoid
    /// blocking the caller; slow sinks should buffer internally.
    async fn publish(&self, event: ObserverEvent);
}
