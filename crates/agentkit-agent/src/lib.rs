#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **agentkit-agent** – Agent lifecycle framing for agentkit.
//!
//! Wraps any `Arc<dyn Agent>` with status tracking, timing, and error mapping,
//! without requiring the agent body to extend a base class. This is the
//! "polymorphism over inheritance" piece: an `AgentHandle` holds a capability
//! value, it is not a superclass the agent must derive from.
//!
//! `AgentHandle::execute` does not itself retry, time out, or consult a
//! circuit breaker — that composition lives in `agentkit-fallback`, which
//! wraps `AgentHandle::execute` as its innermost call.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use agentkit_types::{
    error_code, Agent, AgentConfig, AgentStatus, Context, ErrorInfo, ExecutionResult, Metrics,
};

mod cancellation;
pub use cancellation::CancellationHandle;

/// Errors surfaced by lifecycle operations that are not expressed as a
/// failed [`ExecutionResult`] (i.e. programming/usage errors rather than
/// agent-body failures).
#[derive(Debug, thiserror::Error)]
pub enum AgentLifecycleError {
    /// `resume()` was called while the agent was not `SUSPENDED`.
    #[error("agent {0} is not suspended")]
    NotSuspended(String),
}

/// Wraps a user-supplied [`Agent`] with the lifecycle framing described in
/// spec §4.1: status tracking, start-time metrics, and mapping of a raised
/// failure to a structured [`ErrorInfo`].
///
/// The kernel guarantees at most one in-flight `execute` per `AgentHandle`
/// instance (spec §5); this handle does not itself enforce that — the
/// orchestrator's admission control and per-instance call discipline do.
pub struct AgentHandle {
    config: AgentConfig,
    agent: Arc<dyn Agent>,
    status: Arc<RwLock<AgentStatus>>,
}

impl AgentHandle {
    /// Wrap `agent` under `config`. Initial status is `IDLE`.
    pub fn new(config: AgentConfig, agent: Arc<dyn Agent>) -> Self {
        Self {
            config,
            agent,
            status: Arc::new(RwLock::new(AgentStatus::Idle)),
        }
    }

    /// The agent's identity key.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// A copy of the agent's configuration; callers cannot mutate the
    /// handle's own copy through the return value.
    pub fn config(&self) -> AgentConfig {
        self.config.clone()
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> AgentStatus {
        *self.status.read().await
    }

    /// The wrapped agent body, for callers that need to deliver an inbound
    /// message directly (the orchestrator's Bus subscription handler).
    pub fn agent(&self) -> Arc<dyn Agent> {
        self.agent.clone()
    }

    /// Force `SUSPENDED` from any state.
    pub async fn suspend(&self) {
        let mut status = self.status.write().await;
        debug!(agent_id = %self.config.id, from = ?*status, "suspending agent");
        *status = AgentStatus::Suspended;
    }

    /// Return to `IDLE`, but only if currently `SUSPENDED`.
    pub async fn resume(&self) -> Result<(), AgentLifecycleError> {
        let mut status = self.status.write().await;
        if *status != AgentStatus::Suspended {
            return Err(AgentLifecycleError::NotSuspended(self.config.id.clone()));
        }
        *status = AgentStatus::Idle;
        Ok(())
    }

    /// Run the wrapped body once: `IDLE/COMPLETED/FAILED → RUNNING`, invoke
    /// `run`, map the outcome, transition to `COMPLETED` or `FAILED`, then
    /// call `cleanup` on every exit path — including cancellation, i.e. this
    /// future being dropped while still suspended inside `run()`. A
    /// `CleanupGuard` armed before the `run()` await covers that case; the
    /// normal success/failure paths disarm it after calling `cleanup`
    /// themselves.
    ///
    /// Never raises: a panic-free agent body always yields an
    /// [`ExecutionResult`], success or failure.
    #[instrument(skip(self, input), fields(agent_id = %self.config.id, request_id = %context.request_id))]
    pub async fn execute(
        &self,
        context: Context,
        input: serde_json::Value,
    ) -> ExecutionResult<serde_json::Value> {
        *self.status.write().await = AgentStatus::Running;
        info!(agent_id = %self.config.id, request_id = %context.request_id, "agent execution started");

        let start = Instant::now();
        let mut cleanup_guard = CleanupGuard::new(self.agent.clone(), self.status.clone());
        let outcome = self.agent.run(input).await;
        self.agent.cleanup().await;
        cleanup_guard.disarm();

        let metrics = Metrics {
            execution_time_ms: start.elapsed().as_millis() as u64,
            ..Default::default()
        };

        let result = match outcome {
            Ok(data) => {
                *self.status.write().await = AgentStatus::Completed;
                info!(agent_id = %self.config.id, request_id = %context.request_id, "agent execution completed");
                ExecutionResult::success(data, metrics)
            }
            Err(err) => {
                *self.status.write().await = AgentStatus::Failed;
                error!(agent_id = %self.config.id, request_id = %context.request_id, error = %err, "agent execution failed");
                ExecutionResult::failure(ErrorInfo::new(error_code::AGENT_ERROR, err.to_string()), metrics)
            }
        };

        result
    }
}

/// Ensures `agent.cleanup()` still runs if `execute()`'s future is dropped
/// while suspended inside `run()` — the cancellation case, where the normal
/// linear `cleanup().await` call after `run()` never has a chance to execute.
///
/// `Drop` cannot `.await`, so the cancellation path spawns `cleanup()` as a
/// detached task rather than running it inline; this requires an active
/// Tokio runtime, which the kernel always has one of underneath it.
struct CleanupGuard {
    agent: Arc<dyn Agent>,
    status: Arc<RwLock<AgentStatus>>,
    done: bool,
}

impl CleanupGuard {
    fn new(agent: Arc<dyn Agent>, status: Arc<RwLock<AgentStatus>>) -> Self {
        Self {
            agent,
            status,
            done: false,
        }
    }

    /// Call once the normal exit path has already invoked `cleanup()`, so
    /// `Drop` does not run it a second time.
    fn disarm(&mut self) {
        self.done = true;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("agent execution cancelled mid-run; scheduling detached cleanup");
        let agent = self.agent.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            *status.write().await = AgentStatus::Failed;
            agent.cleanup().await;
        });
    }
}
