use agentkit_types::{Context, ErrorInfo, ExecutionResult, Metrics, Priority};

#[test]
fn context_roundtrips_with_optional_fields_absent() {
    let ctx = Context {
        agent_id: "a".into(),
        request_id: "r1".into(),
        timestamp: chrono::Utc::now(),
        correlation_id: None,
        metadata: None,
    };
    let json = serde_json::to_string(&ctx).unwrap();
    assert!(!json.contains("correlation_id") || json.contains("null") == false);
    let back: Context = serde_json::from_str(&json).unwrap();
    assert_eq!(back.agent_id, "a");
}

#[test]
fn failure_result_carries_error_code_verbatim() {
    let result: ExecutionResult<()> = ExecutionResult::failure(
        ErrorInfo::new(agentkit_types::error_code::CIRCUIT_OPEN, "breaker is open"),
        Metrics {
            execution_time_ms: 5,
            ..Default::default()
        },
    );
    let json = serde_json::to_value(&result).unwrap();
    let code = json["Failure"]["error"]["code"].as_str().unwrap();
    assert_eq!(code, "CIRCUIT_OPEN");
}

#[test]
fn priority_serializes_uppercase() {
    let json = serde_json::to_string(&Priority::High).unwrap();
    assert_eq!(json, "\"HIGH\"");
}
