#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **agentkit-orchestrator** – Top-level facade for agentkit.
//!
//! Owns the set of registered agents and the [`FallbackManager`], enforces a
//! global concurrency cap, builds per-invocation [`Context`]s, delegates
//! execution to the fallback/retry/circuit-breaker pipeline, subscribes each
//! agent to its inbound messages on the [`Bus`], and shuts the system down
//! cleanly. See spec §4.5.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub use agentkit_agent::CancellationHandle;
use agentkit_agent::AgentHandle;
use agentkit_bus::{Bus, MessageHandler};
pub use agentkit_fallback::CircuitState;
use agentkit_fallback::FallbackManager;
use agentkit_types::{
    error_code, Agent, AgentConfig, AgentStatus, Context, ErrorInfo, EventPublisher,
    ExecutionResult, FallbackConfig, Message, Metrics, ObserverEvent, SendOptions,
};

pub mod events;
pub use events::BroadcastEventPublisher;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Configuration for an [`Orchestrator`] instance (spec §4.5).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Whether a primary's retry exhaustion may fall through to its
    /// configured fallback agent.
    pub fallback_enabled: bool,
    /// Global cap on simultaneously `RUNNING` executions.
    pub max_concurrent_agents: usize,
    /// Default per-agent timeout, in milliseconds, applied when an agent's
    /// own config carries none. Advisory at this layer: enforcement is the
    /// retry/circuit layer and transport's responsibility (spec §5).
    pub default_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            max_concurrent_agents: 100,
            default_timeout_ms: 30_000,
        }
    }
}

/// An `OrchestratorConfig` suited to unit/integration tests: a small
/// concurrency cap and a short default timeout, mirroring the teacher's
/// `test_config()` convention.
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        fallback_enabled: true,
        max_concurrent_agents: 8,
        default_timeout_ms: 1_000,
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced directly by orchestrator operations that never reach an
/// agent body (registration failures) — distinct from an
/// [`ExecutionResult::Failure`], which covers everything admitted into the
/// execution pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// `register_agent` was called twice for the same agent id.
    #[error("agent {0} is already registered")]
    AlreadyRegistered(String),
}

impl OrchestratorError {
    /// The stable error code for this failure, see [`agentkit_types::error_code`].
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::AlreadyRegistered(_) => error_code::ALREADY_REGISTERED,
        }
    }
}

//─────────────────────────────
//  Context override
//─────────────────────────────

/// Caller-supplied partial [`Context`] fields for `execute_agent`.
///
/// `correlation_id` and `metadata` are taken from the caller; `agent_id` is
/// always authoritative. `request_id` is generated by the orchestrator
/// unless the caller supplies one — needed to call [`Orchestrator::cancel`]
/// on a call that is still in flight, since there is otherwise no way to
/// learn the generated id before `execute_agent`'s future resolves
/// (spec §4.5 step 3).
#[derive(Debug, Clone, Default)]
pub struct PartialContext {
    /// Correlation id to stamp on the generated `Context`.
    pub correlation_id: Option<String>,
    /// Metadata to stamp on the generated `Context`.
    pub metadata: Option<HashMap<String, String>>,
    /// Caller-chosen request id, so the call can be cancelled by id before
    /// it completes. A random id is generated when absent.
    pub request_id: Option<String>,
}

//─────────────────────────────
//  Bus handler adapter
//─────────────────────────────

/// Forwards a delivered [`Message`] to an agent's `handle_message`, catching
/// any failure and reporting it without propagating it back into the bus
/// delivery path — a failing handler must not break delivery for siblings
/// (spec §4.5).
struct AgentMessageHandler {
    agent_id: String,
    agent: Arc<dyn Agent>,
    events: Option<Arc<dyn EventPublisher>>,
}

#[async_trait]
impl MessageHandler for AgentMessageHandler {
    async fn handle(&self, message: Message) {
        let message_id = message.id.clone();
        if let Some(events) = &self.events {
            events
                .publish(ObserverEvent::MessageReceived {
                    message_id: message_id.clone(),
                    to: self.agent_id.clone(),
                })
                .await;
        }
        if let Err(err) = self.agent.handle_message(&message).await {
            warn!(
                agent_id = %self.agent_id,
                message_id = %message_id,
                error = %err,
                "handle_message failed; error reported, not propagated to bus"
            );
        }
    }
}

//─────────────────────────────
//  Running-set admission guard
//─────────────────────────────

/// Removes `id` from the running set on drop, including on cancellation —
/// the guaranteed post-step of spec §4.5 step 5 ("remove agentId from
/// runningAgents regardless of outcome").
struct RunningGuard {
    running: Arc<DashSet<String>>,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

//─────────────────────────────
//  Cancellation registry
//─────────────────────────────

/// Removes a request's `CancellationHandle` from the registry on drop, so a
/// stale entry can never outlive the call it was created for.
struct CancellationGuard {
    cancellations: Arc<DashMap<String, CancellationHandle>>,
    request_id: String,
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        self.cancellations.remove(&self.request_id);
    }
}

//─────────────────────────────
//  Orchestrator
//─────────────────────────────

/// Top-level facade: registration, admission control, execution delegation,
/// message routing (spec §4.5).
pub struct Orchestrator {
    agents: DashMap<String, Arc<AgentHandle>>,
    fallback: Arc<FallbackManager>,
    bus: Arc<Bus>,
    config: OrchestratorConfig,
    running: Arc<DashSet<String>>,
    /// Guards the compound "count check + insert" admission step; a bare
    /// `DashSet` cannot make that atomic on its own (spec §5).
    admission_lock: Mutex<()>,
    /// One [`CancellationHandle`] per in-flight `execute_agent` call, keyed
    /// by request id, so [`Orchestrator::cancel`] can reach it.
    cancellations: Arc<DashMap<String, CancellationHandle>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl Orchestrator {
    /// Construct an orchestrator over `bus` with no event publisher.
    pub fn new(bus: Arc<Bus>, config: OrchestratorConfig) -> Self {
        Self {
            agents: DashMap::new(),
            fallback: Arc::new(FallbackManager::new()),
            bus,
            config,
            running: Arc::new(DashSet::new()),
            admission_lock: Mutex::new(()),
            cancellations: Arc::new(DashMap::new()),
            events: None,
        }
    }

    /// Construct an orchestrator over `bus` that publishes lifecycle,
    /// circuit-breaker, fallback and message events to `events`.
    pub fn with_event_publisher(
        bus: Arc<Bus>,
        config: OrchestratorConfig,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            agents: DashMap::new(),
            fallback: Arc::new(FallbackManager::with_event_publisher(events.clone())),
            bus,
            config,
            running: Arc::new(DashSet::new()),
            admission_lock: Mutex::new(()),
            cancellations: Arc::new(DashMap::new()),
            events: Some(events),
        }
    }

    /// Register `agent` under `config.id`. Fails with
    /// [`OrchestratorError::AlreadyRegistered`] if the id is already known;
    /// otherwise stores the agent, creates its circuit breaker via the
    /// `FallbackManager`, and subscribes a handler on the `Bus` that
    /// forwards each delivered message to `agent.handle_message`.
    #[instrument(skip(self, config, agent), fields(agent_id = %config.id))]
    pub async fn register_agent(
        &self,
        config: AgentConfig,
        agent: Arc<dyn Agent>,
    ) -> Result<(), OrchestratorError> {
        let id = config.id.clone();
        let handle = Arc::new(AgentHandle::new(config, agent.clone()));

        match self.agents.entry(id.clone()) {
            Entry::Occupied(_) => return Err(OrchestratorError::AlreadyRegistered(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
            }
        }

        self.fallback.register(handle);

        let handler: Arc<dyn MessageHandler> = Arc::new(AgentMessageHandler {
            agent_id: id.clone(),
            agent,
            events: self.events.clone(),
        });
        self.bus.subscribe(&id, handler).await;

        info!(agent_id = %id, "agent registered");
        Ok(())
    }

    /// Remove `id` from the registry, unsubscribe it from the `Bus`, and
    /// drop it from the running set if present. Idempotent.
    pub async fn unregister_agent(&self, id: &str) {
        self.agents.remove(id);
        self.fallback.unregister(id);
        self.bus.unsubscribe(id).await;
        self.running.remove(id);
        debug!(agent_id = %id, "agent unregistered");
    }

    /// Execute `agent_id` with `input`, subject to admission control and the
    /// fallback/retry/circuit pipeline (spec §4.5 `ExecuteAgent`).
    #[instrument(skip(self, input, partial_context), fields(agent_id = %agent_id))]
    pub async fn execute_agent(
        &self,
        agent_id: &str,
        input: serde_json::Value,
        partial_context: Option<PartialContext>,
    ) -> ExecutionResult<serde_json::Value> {
        let Some(handle) = self.agents.get(agent_id).map(|entry| entry.clone()) else {
            return ExecutionResult::failure(
                ErrorInfo::new(error_code::AGENT_NOT_FOUND, format!("agent {agent_id} not registered")),
                Metrics::default(),
            );
        };

        {
            let _admission = self.admission_lock.lock().await;
            if self.running.len() >= self.config.max_concurrent_agents {
                warn!(agent_id, "rejected: global concurrency cap reached");
                return ExecutionResult::failure(
                    ErrorInfo::new(error_code::MAX_CONCURRENT_LIMIT, "global concurrency cap reached"),
                    Metrics::default(),
                );
            }
            self.running.insert(agent_id.to_string());
        }
        let _running_guard = RunningGuard {
            running: self.running.clone(),
            id: agent_id.to_string(),
        };

        let request_id = partial_context
            .as_ref()
            .and_then(|partial| partial.request_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut context = Context {
            agent_id: agent_id.to_string(),
            request_id: request_id.clone(),
            timestamp: chrono::Utc::now(),
            correlation_id: None,
            metadata: None,
        };
        if let Some(partial) = partial_context {
            context.correlation_id = partial.correlation_id;
            context.metadata = partial.metadata;
        }

        if let Some(events) = &self.events {
            events
                .publish(ObserverEvent::AgentStarted {
                    agent_id: agent_id.to_string(),
                    request_id: request_id.clone(),
                })
                .await;
        }

        let fallback_config = FallbackConfig {
            enabled: self.config.fallback_enabled,
            fallback_agent_id: handle.config().fallback_agent_id.clone(),
            max_fallback_attempts: 2,
            strategy: "circuit-breaker".to_string(),
        };

        let cancellation = CancellationHandle::new();
        self.cancellations.insert(request_id.clone(), cancellation.clone());
        let _cancellation_guard = CancellationGuard {
            cancellations: self.cancellations.clone(),
            request_id: request_id.clone(),
        };

        let timeout_ms = handle.config().timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let timeout_cancellation = cancellation.clone();
        let timeout_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            timeout_cancellation.cancel();
        });

        let result = self
            .fallback
            .execute_with_fallback(agent_id, context, input, fallback_config, cancellation)
            .await;
        timeout_task.abort();

        if let Some(events) = &self.events {
            match &result {
                ExecutionResult::Success { .. } => {
                    events
                        .publish(ObserverEvent::AgentCompleted {
                            agent_id: agent_id.to_string(),
                            request_id: request_id.clone(),
                        })
                        .await;
                }
                ExecutionResult::Failure { error, .. } => {
                    events
                        .publish(ObserverEvent::AgentFailed {
                            agent_id: agent_id.to_string(),
                            request_id: request_id.clone(),
                            code: error.code.clone(),
                        })
                        .await;
                }
            }
        }

        result
    }

    /// Thin passthrough to `Bus::send`.
    pub async fn send_message(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<String, agentkit_bus::BusError> {
        let id = self.bus.send(from, to, message_type, payload, options).await?;
        if let Some(events) = &self.events {
            events
                .publish(ObserverEvent::MessageSent {
                    message_id: id.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                })
                .await;
        }
        Ok(id)
    }

    /// Thin passthrough to `Bus::broadcast`.
    pub async fn broadcast_message(
        &self,
        from: &str,
        recipients: &[String],
        message_type: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<Vec<String>, (Vec<String>, agentkit_bus::BusError)> {
        self.bus.broadcast(from, recipients, message_type, payload, options).await
    }

    /// Current lifecycle status of `id`, if registered.
    pub async fn get_agent_status(&self, id: &str) -> Option<AgentStatus> {
        match self.agents.get(id).map(|entry| entry.clone()) {
            Some(handle) => Some(handle.status().await),
            None => None,
        }
    }

    /// Current circuit-breaker state for `id`, if registered.
    pub async fn get_circuit_state(&self, id: &str) -> Option<CircuitState> {
        self.fallback.circuit_state(id).await
    }

    /// Request cancellation of the in-flight `execute_agent` call identified
    /// by `request_id`. Cooperative (spec §5): the execution stops at its
    /// next suspension point — the retry-wait in `agentkit-fallback` — not
    /// immediately, unless the overall per-agent timeout races it to the
    /// same outcome first. Returns `false` if no such call is in flight.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.cancellations.get(request_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of executions currently in the `RUNNING` region.
    pub fn get_running_agent_count(&self) -> usize {
        self.running.len()
    }

    /// All currently registered agent ids.
    pub fn get_registered_agents(&self) -> Vec<String> {
        self.agents.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Unsubscribe every registered agent from the `Bus`, clear the
    /// registration map, and clear the running set. Safe to call multiple
    /// times.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        let ids: Vec<String> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.bus.unsubscribe(&id).await;
        }
        self.agents.clear();
        self.running.clear();
        debug!("orchestrator shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentkit_bus::Bus;
    use async_trait::async_trait;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn run(&self, input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::json!({ "processed": input }))
        }
    }

    struct AlwaysFailsAgent;

    #[async_trait]
    impl Agent for AlwaysFailsAgent {
        async fn run(&self, _input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(Arc::new(Bus::in_memory()), test_config())
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected_and_first_stays_executable() {
        let orch = orchestrator();
        let config = AgentConfig::new("a", "Agent A", "worker").unwrap();
        orch.register_agent(config.clone(), Arc::new(EchoAgent)).await.unwrap();

        let err = orch
            .register_agent(config, Arc::new(EchoAgent))
            .await
            .unwrap_err();
        assert_eq!(err.code(), error_code::ALREADY_REGISTERED);

        let result = orch.execute_agent("a", serde_json::json!({"v": 1}), None).await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn unknown_agent_yields_agent_not_found() {
        let orch = orchestrator();
        let result = orch.execute_agent("missing", serde_json::json!(null), None).await;
        match result {
            ExecutionResult::Failure { error, .. } => assert_eq!(error.code, error_code::AGENT_NOT_FOUND),
            ExecutionResult::Success { .. } => panic!("expected not-found failure"),
        }
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_burst_beyond_limit() {
        let bus = Arc::new(Bus::in_memory());
        let config = OrchestratorConfig {
            fallback_enabled: false,
            max_concurrent_agents: 0,
            default_timeout_ms: 1_000,
        };
        let orch = Orchestrator::new(bus, config);
        orch.register_agent(AgentConfig::new("a", "A", "worker").unwrap(), Arc::new(EchoAgent))
            .await
            .unwrap();

        let result = orch.execute_agent("a", serde_json::json!(null), None).await;
        match result {
            ExecutionResult::Failure { error, .. } => assert_eq!(error.code, error_code::MAX_CONCURRENT_LIMIT),
            ExecutionResult::Success { .. } => panic!("expected admission failure"),
        }
    }

    #[tokio::test]
    async fn running_count_returns_to_zero_after_execution() {
        let orch = orchestrator();
        orch.register_agent(AgentConfig::new("a", "A", "worker").unwrap(), Arc::new(EchoAgent))
            .await
            .unwrap();

        assert_eq!(orch.get_running_agent_count(), 0);
        orch.execute_agent("a", serde_json::json!(null), None).await;
        assert_eq!(orch.get_running_agent_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_clears_registry() {
        let orch = orchestrator();
        orch.register_agent(AgentConfig::new("a", "A", "worker").unwrap(), Arc::new(AlwaysFailsAgent))
            .await
            .unwrap();

        orch.shutdown().await;
        assert!(orch.get_registered_agents().is_empty());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn message_to_registered_agent_invokes_handle_message() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingAgent {
            count: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Agent for CountingAgent {
            async fn run(&self, _input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
                Ok(serde_json::json!(null))
            }

            async fn handle_message(&self, _message: &Message) -> anyhow::Result<()> {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let orch = orchestrator();
        let count = Arc::new(AtomicUsize::new(0));
        orch.register_agent(
            AgentConfig::new("a", "A", "worker").unwrap(),
            Arc::new(CountingAgent { count: count.clone() }),
        )
        .await
        .unwrap();

        orch.send_message("sender", "a", "t", serde_json::json!(1), SendOptions::default())
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_agent_timeout_cancels_retry_wait_and_returns_underlying_failure() {
        use agentkit_types::RetryPolicy;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingFailsAgent {
            calls: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Agent for CountingFailsAgent {
            async fn run(&self, _input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("permanent failure"))
            }
        }

        let orch = orchestrator();
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = AgentConfig::new("a", "A", "worker").unwrap();
        config.timeout_ms = Some(30);
        config.retry_policy = Some(RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 10_000,
            backoff_multiplier: 1.0,
            max_delay_ms: 10_000,
        });
        orch.register_agent(config, Arc::new(CountingFailsAgent { calls: calls.clone() }))
            .await
            .unwrap();

        let result = orch.execute_agent("a", serde_json::json!(null), None).await;

        assert!(!result.is_success());
        // Only the first attempt ran; the timeout cancelled the second
        // attempt's ten-second backoff wait long before it would elapse.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_stops_an_in_flight_execution_identified_by_request_id() {
        use agentkit_types::RetryPolicy;
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::time::Duration;

        struct CountingFailsAgent {
            calls: Arc<AtomicU32>,
        }

        #[async_trait]
        impl Agent for CountingFailsAgent {
            async fn run(&self, _input: serde_json::Value) -> anyhow::Result<serde_json::Value> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("permanent failure"))
            }
        }

        let orch = Arc::new(orchestrator());
        let calls = Arc::new(AtomicU32::new(0));
        let mut config = AgentConfig::new("a", "A", "worker").unwrap();
        config.retry_policy = Some(RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 10_000,
            backoff_multiplier: 1.0,
            max_delay_ms: 10_000,
        });
        orch.register_agent(config, Arc::new(CountingFailsAgent { calls: calls.clone() }))
            .await
            .unwrap();

        let caller_orch = orch.clone();
        let task = tokio::spawn(async move {
            caller_orch
                .execute_agent(
                    "a",
                    serde_json::json!(null),
                    Some(PartialContext {
                        request_id: Some("known-request".to_string()),
                        ..Default::default()
                    }),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(orch.cancel("known-request"));

        let result = task.await.unwrap();
        assert!(!result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!orch.cancel("known-request"), "guard must have cleared the entry on exit");
    }
}
