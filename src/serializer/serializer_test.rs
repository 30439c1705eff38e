use super::*;
use crate::blocks::BlockRegistry;
use serde_json::json;

fn serializer() -> Serializer {
    Serializer::new(Arc::new(BlockRegistry::with_builtins()))
}

fn sub(value: Value) -> SubBlockState {
    SubBlockState {
        value: Some(value),
        kind: None,
    }
}

fn api_block_state(id: &str) -> BlockState {
    BlockState {
        id: id.to_string(),
        block_type: "api".to_string(),
        name: "Fetch".to_string(),
        sub_blocks: HashMap::from([
            ("url".to_string(), sub(json!("https://api.example.com/items"))),
            ("method".to_string(), sub(json!("post"))),
        ]),
        enabled: true,
        ..Default::default()
    }
}

fn agent_block_state(id: &str, advanced: bool) -> BlockState {
    BlockState {
        id: id.to_string(),
        block_type: "agent".to_string(),
        name: "Agent".to_string(),
        advanced_mode: advanced,
        sub_blocks: HashMap::from([
            ("model".to_string(), sub(json!("gpt-4o"))),
            ("apiKey".to_string(), sub(json!("sk-test"))),
            ("systemPrompt".to_string(), sub(json!("B"))),
            ("messages".to_string(), sub(json!("A"))),
        ]),
        enabled: true,
        ..Default::default()
    }
}

#[test]
fn test_serialize_basic_block() {
    let workflow = serializer()
        .serialize(&[api_block_state("b1")], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();

    assert_eq!(workflow.version, crate::constants::WORKFLOW_VERSION);
    let block = workflow.block("b1").unwrap();
    assert_eq!(block.config.tool, "http_request");
    assert_eq!(block.config.params["url"], json!("https://api.example.com/items"));
    assert_eq!(block.metadata.id, "api");
}

#[test]
fn test_default_value_applied_for_empty_field() {
    let mut state = api_block_state("b1");
    state.sub_blocks.remove("method");

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();

    // default method is GET
    assert_eq!(workflow.block("b1").unwrap().config.params["method"], json!("GET"));
}

#[test]
fn test_canonical_group_advanced_mode_prefers_advanced() {
    let workflow = serializer()
        .serialize(
            &[agent_block_state("a1", true)],
            &[],
            &HashMap::new(),
            &HashMap::new(),
            false,
        )
        .unwrap();

    let params = &workflow.block("a1").unwrap().config.params;
    assert_eq!(params["systemPrompt"], json!("A"));
    // shadow keys must not survive canonicalization
    assert!(!params.contains_key("messages"));
}

#[test]
fn test_canonical_group_basic_mode_prefers_basic() {
    let workflow = serializer()
        .serialize(
            &[agent_block_state("a1", false)],
            &[],
            &HashMap::new(),
            &HashMap::new(),
            false,
        )
        .unwrap();

    assert_eq!(
        workflow.block("a1").unwrap().config.params["systemPrompt"],
        json!("B")
    );
}

#[test]
fn test_canonical_group_single_value_used_in_both_modes() {
    for advanced in [false, true] {
        let mut state = agent_block_state("a1", advanced);
        state.sub_blocks.remove("messages");

        let workflow = serializer()
            .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
            .unwrap();

        assert_eq!(
            workflow.block("a1").unwrap().config.params["systemPrompt"],
            json!("B"),
            "advanced_mode={}",
            advanced
        );
    }
}

#[test]
fn test_canonical_group_both_empty_resolves_absent() {
    let mut state = agent_block_state("a1", true);
    state.sub_blocks.remove("systemPrompt");
    state.sub_blocks.remove("messages");

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();

    assert!(
        !workflow
            .block("a1")
            .unwrap()
            .config
            .params
            .contains_key("systemPrompt")
    );
}

#[test]
fn test_conditional_field_excluded_when_condition_fails() {
    let mut state = agent_block_state("a1", false);
    state
        .sub_blocks
        .insert("azureEndpoint".to_string(), sub(json!("https://azure.example.com")));

    // model is gpt-4o, so the azure-only field must not appear
    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    assert!(
        !workflow
            .block("a1")
            .unwrap()
            .config
            .params
            .contains_key("azureEndpoint")
    );
}

#[test]
fn test_conditional_field_included_when_condition_holds() {
    let mut state = agent_block_state("a1", false);
    state.sub_blocks.insert("model".to_string(), sub(json!("azure-openai")));
    state
        .sub_blocks
        .insert("azureEndpoint".to_string(), sub(json!("https://azure.example.com")));

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    assert_eq!(
        workflow.block("a1").unwrap().config.params["azureEndpoint"],
        json!("https://azure.example.com")
    );
}

#[test]
fn test_tool_selector_resolves_provider() {
    let mut state = agent_block_state("a1", false);
    state.sub_blocks.insert("model".to_string(), sub(json!("claude-sonnet-4")));

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    assert_eq!(workflow.block("a1").unwrap().config.tool, "anthropic_chat");
}

#[test]
fn test_tool_selector_failure_falls_back_to_first_static_tool() {
    let mut state = agent_block_state("a1", false);
    state.sub_blocks.insert("model".to_string(), sub(json!("mystery-model")));

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    // fallback is logged, not fatal
    assert_eq!(workflow.block("a1").unwrap().config.tool, "openai_chat");
}

#[test]
fn test_validation_reports_missing_required_fields() {
    let mut state = api_block_state("b1");
    state.sub_blocks.remove("url");

    let err = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), true)
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("missing required fields"), "got: {}", msg);
    assert!(msg.contains("url"), "got: {}", msg);
}

#[test]
fn test_validation_skipped_when_not_requested() {
    let mut state = api_block_state("b1");
    state.sub_blocks.remove("url");

    assert!(
        serializer()
            .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
            .is_ok()
    );
}

#[test]
fn test_trigger_block_exempt_from_validation_and_mapping() {
    let starter = BlockState {
        id: "start".to_string(),
        block_type: "starter".to_string(),
        name: "Start".to_string(),
        sub_blocks: HashMap::from([("input".to_string(), sub(json!({"x": 1})))]),
        enabled: true,
        ..Default::default()
    };

    let workflow = serializer()
        .serialize(&[starter], &[], &HashMap::new(), &HashMap::new(), true)
        .unwrap();
    let block = workflow.block("start").unwrap();
    assert!(block.config.tool.is_empty());
    assert_eq!(block.config.params["input"], json!({"x": 1}));
}

#[test]
fn test_loop_container_passes_raw_config_through() {
    let loop_state = BlockState {
        id: "loop1".to_string(),
        block_type: "loop".to_string(),
        sub_blocks: HashMap::from([("iterations".to_string(), sub(json!(5)))]),
        enabled: true,
        ..Default::default()
    };
    let mut loops = HashMap::new();
    loops.insert(
        "loop1".to_string(),
        LoopDescriptor {
            id: "loop1".to_string(),
            nodes: vec![],
            iterations: 5,
            ..Default::default()
        },
    );

    let workflow = serializer()
        .serialize(&[loop_state], &[], &loops, &HashMap::new(), true)
        .unwrap();
    let block = workflow.block("loop1").unwrap();
    assert!(block.config.tool.is_empty());
    assert_eq!(block.config.params["iterations"], json!(5));
    assert_eq!(workflow.loops["loop1"].iterations, 5);
}

#[test]
fn test_connection_endpoint_invariant() {
    let edge = Edge {
        id: "e1".to_string(),
        source: "b1".to_string(),
        target: "ghost".to_string(),
        source_handle: None,
        target_handle: None,
    };

    let err = serializer()
        .serialize(&[api_block_state("b1")], &[edge], &HashMap::new(), &HashMap::new(), false)
        .unwrap_err();
    assert!(err.to_string().contains("unknown target block"));
}

#[test]
fn test_block_in_two_containers_rejected() {
    let mut loops = HashMap::new();
    loops.insert(
        "loop1".to_string(),
        LoopDescriptor {
            id: "loop1".to_string(),
            nodes: vec!["b1".to_string()],
            ..Default::default()
        },
    );
    let mut parallels = HashMap::new();
    parallels.insert(
        "par1".to_string(),
        ParallelDescriptor {
            id: "par1".to_string(),
            nodes: vec!["b1".to_string()],
            ..Default::default()
        },
    );

    let err = serializer()
        .serialize(&[api_block_state("b1")], &[], &loops, &parallels, false)
        .unwrap_err();
    assert!(err.to_string().contains("multiple subflow containers"));
}

#[test]
fn test_response_format_json_parsed() {
    let mut state = agent_block_state("a1", false);
    state
        .sub_blocks
        .insert("responseFormat".to_string(), sub(json!("{\"type\": \"object\"}")));

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    assert_eq!(
        workflow.block("a1").unwrap().outputs["responseFormat"],
        json!({"type": "object"})
    );
}

#[test]
fn test_response_format_variable_reference_kept() {
    let mut state = agent_block_state("a1", false);
    state
        .sub_blocks
        .insert("responseFormat".to_string(), sub(json!("<start.input>")));

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    assert_eq!(
        workflow.block("a1").unwrap().outputs["responseFormat"],
        json!("<start.input>")
    );
}

#[test]
fn test_response_format_unparseable_dropped() {
    let mut state = agent_block_state("a1", false);
    state
        .sub_blocks
        .insert("responseFormat".to_string(), sub(json!("not {valid json")));

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    assert!(
        !workflow
            .block("a1")
            .unwrap()
            .outputs
            .contains_key("responseFormat")
    );
}

#[test]
fn test_mcp_block_gets_composite_tool_id() {
    let state = BlockState {
        id: "m1".to_string(),
        block_type: "mcp".to_string(),
        sub_blocks: HashMap::from([
            ("serverId".to_string(), sub(json!("srv-1"))),
            ("toolName".to_string(), sub(json!("search"))),
        ]),
        enabled: true,
        ..Default::default()
    };

    let workflow = serializer()
        .serialize(&[state], &[], &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    assert_eq!(workflow.block("m1").unwrap().config.tool, "mcp-srv-1-search");
}

#[test]
fn test_round_trip_preserves_canonical_values() {
    let blocks = vec![api_block_state("b1"), agent_block_state("a1", false)];
    let edges = vec![Edge {
        id: "e1".to_string(),
        source: "b1".to_string(),
        target: "a1".to_string(),
        source_handle: None,
        target_handle: None,
    }];

    let s = serializer();
    let workflow = s
        .serialize(&blocks, &edges, &HashMap::new(), &HashMap::new(), false)
        .unwrap();
    let (restored_blocks, restored_edges) = s.deserialize(&workflow).unwrap();

    let api = restored_blocks.iter().find(|b| b.id == "b1").unwrap();
    assert_eq!(api.block_type, "api");
    assert_eq!(
        api.sub_blocks["url"].value,
        Some(json!("https://api.example.com/items"))
    );

    let agent = restored_blocks.iter().find(|b| b.id == "a1").unwrap();
    assert_eq!(agent.sub_blocks["systemPrompt"].value, Some(json!("B")));

    assert_eq!(restored_edges.len(), 1);
    assert_eq!(restored_edges[0].source, "b1");
    // connections regain generated identifiers
    assert_ne!(restored_edges[0].id, "e1");
    assert!(!restored_edges[0].id.is_empty());
}
