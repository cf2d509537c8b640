#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **agentkit-types** – Shared primitive data structures for agentkit.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing
//! cycles. It intentionally makes no assumptions about I/O, scheduling, or
//! transport mechanics — those live in `agentkit-bus`, `agentkit-fallback`,
//! `agentkit-agent` and `agentkit-orchestrator`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Behaviour traits (`Agent`) and observer interfaces shared across crates.
pub mod traits;
pub use traits::{Agent, EventPublisher, ObserverEvent};

//─────────────────────────────
//  Error taxonomy
//─────────────────────────────

/// Stable error codes produced verbatim by the kernel. See spec §7.
pub mod error_code {
    /// Target agent id unknown.
    pub const AGENT_NOT_FOUND: &str = "AGENT_NOT_FOUND";
    /// Duplicate registration attempt.
    pub const ALREADY_REGISTERED: &str = "ALREADY_REGISTERED";
    /// Global admission cap reached.
    pub const MAX_CONCURRENT_LIMIT: &str = "MAX_CONCURRENT_LIMIT";
    /// Gate refused call while OPEN.
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    /// Primary exhausted, no viable fallback.
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    /// Named fallback agent not registered.
    pub const FALLBACK_AGENT_NOT_FOUND: &str = "FALLBACK_AGENT_NOT_FOUND";
    /// Fallback exhausted its attempts.
    pub const FALLBACK_FAILED: &str = "FALLBACK_FAILED";
    /// Generic failure from `run`.
    pub const AGENT_ERROR: &str = "AGENT_ERROR";
    /// Non-standard failure value caught.
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
    /// Execution observed a cancellation signal before or during a retry wait.
    pub const CANCELLED: &str = "CANCELLED";
}

/// Structured error carried by a failed [`ExecutionResult`].
///
/// `code` is one of the constants in [`error_code`] and is the only field
/// callers should branch on; `message` is diagnostic text only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code, see [`error_code`].
    pub code: String,
    /// Human-readable diagnostic message.
    pub message: String,
    /// Optional structured detail payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Optional captured stack/context, diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    /// Construct an [`ErrorInfo`] with just a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            stack: None,
        }
    }
}

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Bounded-retry configuration attached to an [`AgentConfig`].
///
/// Absent policy means `max_attempts = 1` (no retries), per spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of attempts, including the first. Must be `>= 1`.
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds. Must be `>= 0`.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt. Must be `>= 1.0`.
    pub backoff_multiplier: f64,
    /// Upper bound on the backoff delay in milliseconds. Must be `>= initial_delay_ms`.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Validate the policy against the invariants in spec §3.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts < 1 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("max_delay_ms must be >= initial_delay_ms".to_string());
        }
        Ok(())
    }
}

//─────────────────────────────
//  Agent configuration
//─────────────────────────────

/// Immutable-after-registration agent configuration.
///
/// `id` is the sole identity key: two configs with the same `id` cannot
/// coexist inside one orchestrator (enforced at registration, not here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique, non-empty identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form agent type/category tag.
    pub agent_type: String,
    /// Optional per-agent timeout, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional retry policy; absent means no retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    /// Optional fallback agent id, invoked on retry exhaustion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent_id: Option<String>,
    /// Advisory memory hint (not enforced by the kernel).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_hint: Option<String>,
    /// Arbitrary metadata, opaque to the kernel.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentConfig {
    /// Construct a config with validation of `id` and any embedded retry policy.
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err("agent id cannot be empty".to_string());
        }
        Ok(Self {
            id,
            name: name.into(),
            agent_type: agent_type.into(),
            timeout_ms: None,
            retry_policy: None,
            fallback_agent_id: None,
            memory_hint: None,
            metadata: HashMap::new(),
        })
    }

    /// Validate the config's invariants (non-empty id, well-formed retry policy).
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("agent id cannot be empty".to_string());
        }
        if let Some(policy) = &self.retry_policy {
            policy.validate()?;
        }
        Ok(())
    }
}

//─────────────────────────────
//  Agent status / lifecycle
//─────────────────────────────

/// Lifecycle state of a single agent instance. See spec §3 for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Created, not currently executing.
    Idle,
    /// An `execute` call is in flight.
    Running,
    /// The most recent execution completed successfully.
    Completed,
    /// The most recent execution raised a failure.
    Failed,
    /// Forced out of the normal lifecycle by `suspend()`.
    Suspended,
}

//─────────────────────────────
//  Context
//─────────────────────────────

/// Per-invocation value passed through to user code. Opaque to the kernel
/// beyond the fields it fills in itself (`agent_id`, `request_id`,
/// `timestamp`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// Target agent id.
    pub agent_id: String,
    /// Unique id for this execution, generated by the orchestrator.
    pub request_id: String,
    /// Time the context was constructed.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Optional caller-supplied correlation id linking related work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Optional caller-supplied metadata, opaque to the kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

//─────────────────────────────
//  Metrics
//─────────────────────────────

/// Execution metrics attached to every [`ExecutionResult`], success or failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// Wall-clock execution time, in milliseconds.
    pub execution_time_ms: u64,
    /// Optional observed memory usage, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<u64>,
    /// Number of retries performed before this result, if retried at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Number of inbound messages processed, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages_processed: Option<u64>,
}

//─────────────────────────────
//  Execution result
//─────────────────────────────

/// Tagged execution outcome. Renamed from spec's `Result<T>` to avoid
/// shadowing `std::result::Result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionResult<T> {
    /// The execution completed successfully.
    Success {
        /// The output value.
        data: T,
        /// Execution metrics.
        metrics: Metrics,
    },
    /// The execution failed.
    Failure {
        /// Structured error.
        error: ErrorInfo,
        /// Execution metrics, populated when available.
        metrics: Metrics,
    },
}

impl<T> ExecutionResult<T> {
    /// Build a successful result.
    pub fn success(data: T, metrics: Metrics) -> Self {
        ExecutionResult::Success { data, metrics }
    }

    /// Build a failed result.
    pub fn failure(error: ErrorInfo, metrics: Metrics) -> Self {
        ExecutionResult::Failure { error, metrics }
    }

    /// `true` if this is a [`ExecutionResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    /// Borrow the metrics regardless of outcome.
    pub fn metrics(&self) -> &Metrics {
        match self {
            ExecutionResult::Success { metrics, .. } => metrics,
            ExecutionResult::Failure { metrics, .. } => metrics,
        }
    }

    /// Set the retry count on the metrics, in place.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        match &mut self {
            ExecutionResult::Success { metrics, .. } => metrics.retry_count = Some(count),
            ExecutionResult::Failure { metrics, .. } => metrics.retry_count = Some(count),
        }
        self
    }
}

//─────────────────────────────
//  Messages
//─────────────────────────────

/// Message priority. Purely a transport hint — the kernel makes no ordering
/// guarantee based on it (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Lowest priority.
    Low,
    /// Default priority, used when unspecified.
    Normal,
    /// Elevated priority.
    High,
    /// Highest priority.
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The unit transferred over the bus. See spec §3 for field invariants:
/// `id`, `from`, `to`, `message_type`, `priority`, `timestamp` are always
/// present once the bus has accepted the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Bus-assigned unique id.
    pub id: String,
    /// Sending endpoint.
    pub from: String,
    /// Receiving endpoint.
    pub to: String,
    /// Free-form message type tag.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Delivery priority.
    pub priority: Priority,
    /// Bus-assigned send timestamp.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Optional correlation id linking related messages/executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Optional reply-to endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Optional metadata, opaque to the kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// Caller-supplied options for [`Message`] construction (`Bus::send`/`broadcast`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendOptions {
    /// Priority override; defaults to [`Priority::Normal`] when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Correlation id to stamp on the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Reply-to endpoint to stamp on the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Metadata to stamp on the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

//─────────────────────────────
//  Circuit breaker state
//─────────────────────────────

/// The three states a circuit breaker (owned by `agentkit-fallback`) can be
/// in. Defined here, alongside the rest of the data model, so that
/// introspection callers (`Orchestrator::get_circuit_state`) don't need to
/// depend on `agentkit-fallback` just to read an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast with `CIRCUIT_OPEN`.
    Open,
    /// A single probe attempt is allowed through.
    HalfOpen,
}

//─────────────────────────────
//  Fallback configuration
//─────────────────────────────

/// Configuration built by the orchestrator for each `execute_agent` call and
/// handed to `FallbackManager::execute_with_fallback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Whether fallback is enabled at all for this orchestrator.
    pub enabled: bool,
    /// The agent to fall back to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_agent_id: Option<String>,
    /// Maximum attempts against the fallback agent.
    pub max_fallback_attempts: u32,
    /// Strategy label, carried through for observability/diagnostics.
    pub strategy: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_default_means_no_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn retry_policy_rejects_bad_bounds() {
        let mut policy = RetryPolicy::default();
        policy.max_delay_ms = 0;
        policy.initial_delay_ms = 100;
        assert!(policy.validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.backoff_multiplier = 0.5;
        assert!(policy.validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.max_attempts = 0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn agent_config_requires_non_empty_id() {
        assert!(AgentConfig::new("", "n", "t").is_err());
        assert!(AgentConfig::new("a", "n", "t").is_ok());
    }

    #[test]
    fn execution_result_carries_metrics_on_both_paths() {
        let ok: ExecutionResult<i32> = ExecutionResult::success(1, Metrics::default());
        assert!(ok.is_success());
        let err: ExecutionResult<i32> = ExecutionResult::failure(
            ErrorInfo::new(error_code::AGENT_ERROR, "boom"),
            Metrics::default(),
        );
        assert!(!err.is_success());
    }

    #[test]
    fn default_priority_is_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn message_roundtrips_through_json() {
        let msg = Message {
            id: "m1".into(),
            from: "a".into(),
            to: "b".into(),
            message_type: "t".into(),
            payload: serde_json::json!({"k": 1}),
            priority: Priority::Normal,
            timestamp: chrono::Utc::now(),
            correlation_id: Some("c1".into()),
            reply_to: None,
            metadata: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "m1");
        assert_eq!(back.correlation_id.as_deref(), Some("c1"));
    }
}
