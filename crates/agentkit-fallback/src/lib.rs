#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **agentkit-fallback** – Circuit breaker and retry/fallback composition.
//!
//! Owns one [`CircuitBreaker`] per registered agent and composes, for each
//! invocation: circuit gate → bounded retry with exponential backoff →
//! agent execution → optional fallback agent on exhaustion. This crate never
//! observes or mutates an agent's status directly; it interacts only through
//! [`agentkit_agent::AgentHandle::execute`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use agentkit_agent::CancellationHandle;
use agentkit_agent::AgentHandle;
use agentkit_types::{
    error_code, Context, ErrorInfo, EventPublisher, ExecutionResult, FallbackConfig, Metrics,
    ObserverEvent, RetryPolicy,
};
pub use agentkit_types::CircuitState;

//─────────────────────────────
//  CircuitBreaker
//─────────────────────────────

/// Tunable parameters of a [`CircuitBreaker`]. Defaults match spec §3.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `CLOSED` before tripping to `OPEN`.
    pub threshold: u32,
    /// Time an `OPEN` breaker fails fast before probing again.
    pub open_timeout: Duration,
    /// Consecutive successes in `HALF_OPEN` required to close.
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_timeout: Duration::from_millis(60_000),
            half_open_successes: 3,
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

/// Error surfaced by [`CircuitBreaker::gate`] when the wrapped call is
/// refused outright (breaker `OPEN`) versus when it ran and raised.
#[derive(Debug)]
pub enum GateError<E> {
    /// The breaker is `OPEN` and still within `open_timeout`.
    Open,
    /// The wrapped call ran and raised `E`.
    Inner(E),
}

/// A three-state gate that fails fast after a threshold of consecutive
/// failures and periodically probes for recovery. See spec §4.3.
pub struct CircuitBreaker {
    agent_id: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl CircuitBreaker {
    /// Construct a breaker in the initial `CLOSED` state.
    pub fn new(
        agent_id: impl Into<String>,
        config: CircuitBreakerConfig,
        events: Option<Arc<dyn EventPublisher>>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            state: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
            events,
        }
    }

    /// Current state.
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Evaluate `call`. A raised failure (`Err`) counts as a failure; a
    /// returned `Ok` counts as a success regardless of what it carries —
    /// mapping a logical failure to a raised one, if desired, is the
    /// caller's job (spec §4.3, §9 open question: only raised failures are
    /// counted here).
    pub async fn gate<F, Fut, T, E>(&self, call: F) -> Result<T, GateError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut st = self.state.lock().await;
            match st.state {
                CircuitState::Open => {
                    let elapsed = st
                        .last_failure_at
                        .map(|t| t.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed < self.config.open_timeout {
                        debug!(agent_id = %self.agent_id, "circuit open, failing fast");
                        return Err(GateError::Open);
                    }
                    info!(agent_id = %self.agent_id, "circuit entering half-open probe");
                    st.state = CircuitState::HalfOpen;
                    st.success_count = 0;
                }
                CircuitState::Closed | CircuitState::HalfOpen => {}
            }
        }

        let result = call().await;

        let mut transitioned_closed = false;
        let mut transitioned_open = false;
        {
            let mut st = self.state.lock().await;
            match (&result, st.state) {
                (Ok(_), CircuitState::Closed) => {
                    st.failure_count = 0;
                }
                (Ok(_), CircuitState::HalfOpen) => {
                    st.success_count += 1;
                    if st.success_count >= self.config.half_open_successes {
                        st.state = CircuitState::Closed;
                        st.failure_count = 0;
                        transitioned_closed = true;
                    }
                }
                (Err(_), CircuitState::Closed) => {
                    st.failure_count += 1;
                    if st.failure_count >= self.config.threshold {
                        st.state = CircuitState::Open;
                        st.last_failure_at = Some(Instant::now());
                        transitioned_open = true;
                    }
                }
                (Err(_), CircuitState::HalfOpen) => {
                    st.state = CircuitState::Open;
                    st.last_failure_at = Some(Instant::now());
                    transitioned_open = true;
                }
                _ => {}
            }
        }

        if let Some(events) = &self.events {
            if transitioned_open {
                events
                    .publish(ObserverEvent::CircuitBreakerOpened {
                        agent_id: self.agent_id.clone(),
                    })
                    .await;
            } else if transitioned_closed {
                events
                    .publish(ObserverEvent::CircuitBreakerClosed {
                        agent_id: self.agent_id.clone(),
                    })
                    .await;
            }
        }

        result.map_err(GateError::Inner)
    }
}

//─────────────────────────────
//  FallbackManager
//─────────────────────────────

type ExecutionOutcome = ExecutionResult<serde_json::Value>;

/// Owns `{agentId → AgentHandle}` and `{agentId → CircuitBreaker}`, and
/// composes the circuit/retry/fallback pipeline around each execution
/// (spec §4.4).
pub struct FallbackManager {
    agents: DashMap<String, Arc<AgentHandle>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl FallbackManager {
    /// Construct an empty manager with no event publisher.
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            breakers: DashMap::new(),
            events: None,
        }
    }

    /// Construct an empty manager that publishes circuit/fallback events.
    pub fn with_event_publisher(events: Arc<dyn EventPublisher>) -> Self {
        Self {
            agents: DashMap::new(),
            breakers: DashMap::new(),
            events: Some(events),
        }
    }

    /// Register `handle`, creating its circuit breaker with the default
    /// parameters. Overwrites any prior registration under the same id —
    /// the orchestrator is responsible for rejecting duplicates before
    /// calling this (spec §4.5, `ALREADY_REGISTERED`).
    pub fn register(&self, handle: Arc<AgentHandle>) {
        self.register_with_circuit_config(handle, CircuitBreakerConfig::default());
    }

    /// Register `handle` with an explicit circuit breaker configuration,
    /// for agents that need a different threshold/timeout than the default.
    pub fn register_with_circuit_config(&self, handle: Arc<AgentHandle>, circuit_config: CircuitBreakerConfig) {
        let id = handle.id().to_string();
        self.breakers.insert(
            id.clone(),
            Arc::new(CircuitBreaker::new(id.clone(), circuit_config, self.events.clone())),
        );
        self.agents.insert(id, handle);
    }

    /// Remove an agent and its circuit breaker. Idempotent.
    pub fn unregister(&self, id: &str) {
        self.agents.remove(id);
        self.breakers.remove(id);
    }

    /// Current circuit state for `id`, if registered.
    pub async fn circuit_state(&self, id: &str) -> Option<CircuitState> {
        match self.breakers.get(id) {
            Some(breaker) => Some(breaker.state().await),
            None => None,
        }
    }

    /// `ExecuteWithFallback` (spec §4.4). `cancellation` is checked at the
    /// retry-wait suspension point (spec §5); pass
    /// `CancellationHandle::new()` when the caller has no cancellation
    /// signal of its own to propagate.
    pub async fn execute_with_fallback(
        &self,
        agent_id: &str,
        context: Context,
        input: serde_json::Value,
        fallback_config: FallbackConfig,
        cancellation: CancellationHandle,
    ) -> ExecutionOutcome {
        let Some(handle) = self.agents.get(agent_id).map(|e| e.clone()) else {
            return ExecutionResult::failure(
                ErrorInfo::new(error_code::AGENT_NOT_FOUND, format!("agent {agent_id} not registered")),
                Metrics::default(),
            );
        };
        let breaker = self
            .breakers
            .get(agent_id)
            .map(|e| e.clone())
            .expect("breaker created alongside agent in register()");

        let policy = handle.config().retry_policy.clone().unwrap_or_default();

        let gated = breaker
            .gate(|| Self::retry(handle.clone(), context.clone(), input.clone(), policy, cancellation.clone()))
            .await;

        match gated {
            Ok(success) => success,
            Err(GateError::Open) => {
                let underlying = ExecutionResult::failure(
                    ErrorInfo::new(error_code::CIRCUIT_OPEN, "circuit breaker is open"),
                    Metrics::default(),
                );
                self.resolve_failure(agent_id, &context, &input, &fallback_config, underlying)
                    .await
            }
            Err(GateError::Inner(underlying)) => {
                self.resolve_failure(agent_id, &context, &input, &fallback_config, underlying)
                    .await
            }
        }
    }

    /// `Retry(call, policy)` (spec §4.4). `Ok` carries a success result with
    /// `metrics.retryCount` set to the attempt index that succeeded; `Err`
    /// carries the last failure, raised so the circuit breaker observes it.
    ///
    /// `cancellation` is checked before every attempt and raced against the
    /// backoff wait between attempts — the dominant suspension point this
    /// kernel instruments, since the attempt itself (`AgentHandle::execute`)
    /// runs opaque user code it does not preempt (spec §5).
    async fn retry(
        handle: Arc<AgentHandle>,
        context: Context,
        input: serde_json::Value,
        policy: RetryPolicy,
        cancellation: CancellationHandle,
    ) -> Result<ExecutionOutcome, ExecutionOutcome> {
        let attempts = policy.max_attempts.max(1);
        let mut delay_ms = policy.initial_delay_ms;
        let mut last = None;

        for attempt in 0..attempts {
            if cancellation.is_cancelled() {
                return Err(last.unwrap_or_else(|| {
                    ExecutionResult::failure(
                        ErrorInfo::new(error_code::CANCELLED, "execution cancelled before it attempted to run"),
                        Metrics::default(),
                    )
                }));
            }

            let result = handle.execute(context.clone(), input.clone()).await;
            if result.is_success() {
                return Ok(result.with_retry_count(attempt));
            }
            last = Some(result);

            if attempt + 1 < attempts {
                let wait = delay_ms.min(policy.max_delay_ms);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                    _ = cancellation.cancelled() => {
                        return Err(last
                            .expect("at least one attempt ran before this wait")
                            .with_retry_count(attempt));
                    }
                }
                delay_ms = (delay_ms as f64 * policy.backoff_multiplier) as u64;
            }
        }

        Err(last
            .expect("attempts >= 1 guarantees at least one iteration")
            .with_retry_count(attempts - 1))
    }

    async fn resolve_failure(
        &self,
        agent_id: &str,
        context: &Context,
        input: &serde_json::Value,
        fallback_config: &FallbackConfig,
        underlying: ExecutionOutcome,
    ) -> ExecutionOutcome {
        let (underlying_error, metrics) = match underlying {
            ExecutionResult::Failure { error, metrics } => (error, metrics),
            ExecutionResult::Success { .. } => {
                unreachable!("resolve_failure is only called with a failed outcome")
            }
        };

        if fallback_config.enabled {
            if let Some(fallback_id) = fallback_config.fallback_agent_id.clone() {
                if let Some(events) = &self.events {
                    events
                        .publish(ObserverEvent::FallbackTriggered {
                            primary_agent_id: agent_id.to_string(),
                            fallback_agent_id: fallback_id.clone(),
                        })
                        .await;
                }
                warn!(agent_id, %fallback_id, "primary exhausted, invoking fallback");
                return self
                    .execute_fallback(
                        &fallback_id,
                        context.clone(),
                        input.clone(),
                        fallback_config.max_fallback_attempts,
                    )
                    .await;
            }
        }

        ExecutionResult::failure(
            ErrorInfo {
                code: error_code::EXECUTION_FAILED.to_string(),
                message: format!("agent {agent_id} exhausted: {}", underlying_error.message),
                details: Some(serde_json::json!({ "underlyingCode": underlying_error.code })),
                stack: None,
            },
            metrics,
        )
    }

    /// `ExecuteFallback(fallbackAgentId, context, input, maxAttempts)` (spec §4.4).
    async fn execute_fallback(
        &self,
        fallback_agent_id: &str,
        context: Context,
        input: serde_json::Value,
        max_attempts: u32,
    ) -> ExecutionOutcome {
        let Some(handle) = self.agents.get(fallback_agent_id).map(|e| e.clone()) else {
            return ExecutionResult::failure(
                ErrorInfo::new(
                    error_code::FALLBACK_AGENT_NOT_FOUND,
                    format!("fallback agent {fallback_agent_id} not registered"),
                ),
                Metrics::default(),
            );
        };

        let mut last = None;
        for _ in 0..max_attempts.max(1) {
            let result = handle.execute(context.clone(), input.clone()).await;
            if result.is_success() {
                return result;
            }
            last = Some(result);
        }

        let metrics = last.as_ref().map(|r| r.metrics().clone()).unwrap_or_default();
        ExecutionResult::failure(
            ErrorInfo::new(error_code::FALLBACK_FAILED, "fallback agent exhausted its attempts"),
            metrics,
        )
    }
}

impl Default for FallbackManager {
    fn default() -> Self {
        Self::new()
    }
}
