#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # `agentkit` – Meta Crate
//!
//! Batteries-included entry point that re-exports the most common types
//! from across the `agentkit` workspace: data model, agent lifecycle, bus,
//! fallback/circuit-breaker composition, and the orchestrator facade.
//!
//! If you want fine-grained control over dependencies, depend on the
//! individual crates directly (`agentkit-types`, `agentkit-agent`,
//! `agentkit-bus`, `agentkit-fallback`, `agentkit-orchestrator`).
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentkit::prelude::*;
//!
//! # struct EchoAgent;
//! # #[async_trait::async_trait]
//! # impl Agent for EchoAgent {
//! #     async fn run(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
//! #         Ok(input)
//! #     }
//! # }
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let orchestrator = Orchestrator::new(Arc::new(Bus::in_memory()), OrchestratorConfig::default());
//! let config = AgentConfig::new("echo", "Echo", "worker").map_err(|e| anyhow::anyhow!(e))?;
//! orchestrator.register_agent(config, Arc::new(EchoAgent)).await.ok();
//! let result = orchestrator.execute_agent("echo", serde_json::json!({"v": 1}), None).await;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

/// Re-exports of the most commonly used types, for glob-importing.
pub mod prelude {
    pub use agentkit_agent::{AgentHandle, AgentLifecycleError, CancellationHandle};
    pub use agentkit_bus::{Bus, BusError, InMemoryTransport, MessageHandler, Transport, TransportError};
    pub use agentkit_fallback::{CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackManager, GateError};
    pub use agentkit_orchestrator::{
        test_config, BroadcastEventPublisher, Orchestrator, OrchestratorConfig, OrchestratorError,
        PartialContext,
    };
    pub use agentkit_types::{
        error_code, Agent, AgentConfig, AgentStatus, Context, ErrorInfo, EventPublisher,
        ExecutionResult, FallbackConfig, Message, Metrics, ObserverEvent, Priority, RetryPolicy,
        SendOptions,
    };
}

pub use prelude::*;
