use super::*;

#[test]
fn test_registry_builtins() {
    let registry = BlockRegistry::with_builtins();
    for block_type in ["starter", "agent", "api", "loop", "parallel", "mcp"] {
        assert!(
            registry.get(block_type).is_some(),
            "builtin block '{}' should be registered",
            block_type
        );
    }
    assert!(registry.get("nonexistent").is_none());
}

#[test]
fn test_container_detection() {
    let registry = BlockRegistry::with_builtins();
    assert!(registry.get("loop").unwrap().is_container());
    assert!(registry.get("parallel").unwrap().is_container());
    assert!(!registry.get("agent").unwrap().is_container());
}

#[test]
fn test_field_condition_scalar() {
    let cond = FieldCondition::eq("model", json!("azure-openai"));

    let mut params = HashMap::new();
    assert!(!cond.holds(&params), "missing field never matches");

    params.insert("model".to_string(), json!("azure-openai"));
    assert!(cond.holds(&params));

    params.insert("model".to_string(), json!("gpt-4o"));
    assert!(!cond.holds(&params));
}

#[test]
fn test_field_condition_array_match_any() {
    let cond = FieldCondition::eq("method", json!(["POST", "PUT"]));

    let mut params = HashMap::new();
    params.insert("method".to_string(), json!("PUT"));
    assert!(cond.holds(&params));

    params.insert("method".to_string(), json!("GET"));
    assert!(!cond.holds(&params));
}

#[test]
fn test_field_condition_not() {
    let cond = FieldCondition {
        field: "method".to_string(),
        value: json!("GET"),
        not: true,
        and: None,
    };

    let mut params = HashMap::new();
    params.insert("method".to_string(), json!("POST"));
    assert!(cond.holds(&params));

    params.insert("method".to_string(), json!("GET"));
    assert!(!cond.holds(&params));
}

#[test]
fn test_field_condition_and() {
    let cond = FieldCondition {
        field: "method".to_string(),
        value: json!("POST"),
        not: false,
        and: Some(Box::new(FieldCondition::eq("hasBody", json!(true)))),
    };

    let mut params = HashMap::new();
    params.insert("method".to_string(), json!("POST"));
    assert!(!cond.holds(&params), "second condition must also hold");

    params.insert("hasBody".to_string(), json!(true));
    assert!(cond.holds(&params));
}

#[test]
fn test_agent_tool_selector() {
    let mut params = HashMap::new();
    params.insert("model".to_string(), json!("claude-sonnet-4"));
    assert_eq!(select_agent_tool(&params).unwrap(), "anthropic_chat");

    params.insert("model".to_string(), json!("gpt-4o"));
    assert_eq!(select_agent_tool(&params).unwrap(), "openai_chat");

    params.insert("model".to_string(), json!("mystery-model"));
    assert!(select_agent_tool(&params).is_err());

    params.remove("model");
    assert!(select_agent_tool(&params).is_err());
}
