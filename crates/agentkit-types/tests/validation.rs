use agentkit_types::{AgentConfig, RetryPolicy};

#[test]
fn retry_policy_accepts_the_spec_example_from_s3() {
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        backoff_multiplier: 2.0,
        max_delay_ms: 1000,
    };
    assert!(policy.validate().is_ok());
}

#[test]
fn agent_config_validate_rejects_embedded_bad_retry_policy() {
    let mut config = AgentConfig::new("a", "Agent A", "worker").unwrap();
    config.retry_policy = Some(RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 500,
        backoff_multiplier: 2.0,
        max_delay_ms: 100, // below initial_delay_ms
    });
    assert!(config.validate().is_err());
}

#[test]
fn agent_config_metadata_defaults_empty() {
    let config = AgentConfig::new("a", "Agent A", "worker").unwrap();
    assert!(config.metadata.is_empty());
    assert!(config.fallback_agent_id.is_none());
}
