use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::blocks::BlockRegistry;
use crate::error::{BlockflowError, McpError};
use crate::mcp::McpService;
use crate::model::{SerializedBlock, SerializedBlockConfig, SerializedBlockMetadata};
use crate::tools::{Tool, ToolRegistry, ToolResponse};

use super::mcp::split_composite_id;
use super::*;

fn block(id: &str, type_id: &str, tool: &str, params: &[(&str, Value)]) -> SerializedBlock {
    SerializedBlock {
        id: id.to_string(),
        config: SerializedBlockConfig {
            tool: tool.to_string(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        },
        metadata: SerializedBlockMetadata {
            id: type_id.to_string(),
            name: Some(format!("{id} block")),
            category: None,
        },
        enabled: true,
        ..Default::default()
    }
}

fn ctx() -> ExecutionContext {
    ExecutionContext::new("wf-1", "user-1")
}

fn generic() -> Arc<GenericBlockHandler> {
    Arc::new(GenericBlockHandler::new(
        Arc::new(ToolRegistry::with_builtins()),
        Arc::new(BlockRegistry::with_builtins()),
    ))
}

/// Echoes its parameters back, optionally attaching a cost or failing
struct EchoTool {
    id: &'static str,
    cost: Option<crate::model::BlockCost>,
    fail_with: Option<&'static str>,
}

#[async_trait]
impl Tool for EchoTool {
    fn id(&self) -> &str {
        self.id
    }
    fn name(&self) -> &str {
        "Echo"
    }
    async fn execute(
        &self,
        params: HashMap<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<ToolResponse> {
        if let Some(message) = self.fail_with {
            return Err(BlockflowError::transport(message));
        }
        Ok(ToolResponse {
            output: params,
            cost: self.cost.clone(),
        })
    }
}

fn registry_with_echo(tool: EchoTool) -> Arc<GenericBlockHandler> {
    let tools = ToolRegistry::new();
    tools.register(Arc::new(tool));
    Arc::new(GenericBlockHandler::new(
        Arc::new(tools),
        Arc::new(BlockRegistry::with_builtins()),
    ))
}

// ---------------------------------------------------------------------------
// Registry dispatch
// ---------------------------------------------------------------------------

struct PickyHandler;

#[async_trait]
impl BlockHandler for PickyHandler {
    fn name(&self) -> &str {
        "picky"
    }
    fn can_handle(&self, block: &SerializedBlock) -> bool {
        block.metadata.id == "special"
    }
    async fn execute(
        &self,
        _block: &SerializedBlock,
        _inputs: &HashMap<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<Value> {
        Ok(json!({"handled_by": "picky"}))
    }
}

#[tokio::test]
async fn first_matching_handler_wins() {
    let mut registry = HandlerRegistry::new(generic());
    registry.register(Arc::new(PickyHandler));

    let output = registry
        .dispatch(&block("b1", "special", "anything", &[]), &HashMap::new(), &ctx())
        .await
        .unwrap();
    assert_eq!(output["handled_by"], "picky");
}

#[tokio::test]
async fn unmatched_blocks_fall_through_to_the_generic_handler() {
    let mut registry = HandlerRegistry::new(registry_with_echo(EchoTool {
        id: "echo",
        cost: None,
        fail_with: None,
    }));
    registry.register(Arc::new(PickyHandler));

    let inputs: HashMap<String, Value> = [("k".to_string(), json!("v"))].into();
    let output = registry
        .dispatch(&block("b1", "function", "echo", &[]), &inputs, &ctx())
        .await
        .unwrap();
    assert_eq!(output["k"], "v");
}

// ---------------------------------------------------------------------------
// Generic handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_tool_is_a_not_found_error() {
    let handler = generic();
    let err = handler
        .execute(&block("b1", "function", "no_such_tool", &[]), &HashMap::new(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, BlockflowError::ToolNotFound(_)));
}

#[tokio::test]
async fn protocol_tools_never_resolve_in_the_static_registry() {
    let handler = generic();
    let err = handler
        .execute(
            &block("b1", "mcp", "mcp-srv-1-search", &[]),
            &HashMap::new(),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BlockflowError::Mcp(McpError::Transport(_))));
}

#[tokio::test]
async fn cost_is_hoisted_onto_the_block_output() {
    let handler = registry_with_echo(EchoTool {
        id: "echo",
        cost: Some(crate::model::BlockCost {
            input: 0.1,
            output: 0.2,
            total: 0.3,
            tokens: Default::default(),
            model: Some("gpt-4o".to_string()),
        }),
        fail_with: None,
    });

    let output = handler
        .execute(&block("b1", "knowledge", "echo", &[]), &HashMap::new(), &ctx())
        .await
        .unwrap();
    assert_eq!(output["cost"]["total"], json!(0.3));
    assert_eq!(output["cost"]["model"], json!("gpt-4o"));
}

#[tokio::test]
async fn failures_are_labeled_with_tool_and_block_identity() {
    let handler = registry_with_echo(EchoTool {
        id: "echo",
        cost: None,
        fail_with: Some("connection reset"),
    });

    let err = handler
        .execute(&block("b1", "function", "echo", &[]), &HashMap::new(), &ctx())
        .await
        .unwrap_err();
    match err {
        BlockflowError::BlockExecution { block_id, message } => {
            assert_eq!(block_id, "b1");
            assert!(message.contains("echo (Echo)"));
            assert!(message.contains("block b1"));
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected block execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn declared_param_transforms_apply_before_execution() {
    // The api block type declares a method-uppercasing transform.
    let tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool {
        id: "http_request",
        cost: None,
        fail_with: None,
    }));
    let handler = GenericBlockHandler::new(
        Arc::new(tools),
        Arc::new(BlockRegistry::with_builtins()),
    );

    let inputs: HashMap<String, Value> = [
        ("url".to_string(), json!("https://example.com")),
        ("method".to_string(), json!("post")),
    ]
    .into();
    let output = handler
        .execute(&block("b1", "api", "http_request", &[]), &inputs, &ctx())
        .await
        .unwrap();
    assert_eq!(output["method"], "POST");
}

// ---------------------------------------------------------------------------
// Composite id splitting
// ---------------------------------------------------------------------------

#[test]
fn uuid_server_ids_split_at_fixed_width() {
    let id = "mcp-a1b2c3d4-e5f6-4a7b-8c9d-0e1f2a3b4c5d-web-search";
    let (server, tool) = split_composite_id(id).unwrap();
    assert_eq!(server, "a1b2c3d4-e5f6-4a7b-8c9d-0e1f2a3b4c5d");
    assert_eq!(tool, "web-search");
}

#[test]
fn non_uuid_ids_split_at_the_last_hyphen() {
    let (server, tool) = split_composite_id("mcp-my-server-search").unwrap();
    assert_eq!(server, "my-server");
    assert_eq!(tool, "search");
}

#[test]
fn malformed_composites_are_rejected() {
    assert!(split_composite_id("not-mcp-prefixed").is_none());
    assert!(split_composite_id("mcp-nohyphen").is_none());
    assert!(split_composite_id("mcp--tool").is_none());
    assert!(split_composite_id("mcp-server-").is_none());
}

// ---------------------------------------------------------------------------
// MCP handler
// ---------------------------------------------------------------------------

#[test]
fn mcp_handler_claims_by_type_or_tool_prefix() {
    let handler = McpBlockHandler::new(McpDispatch::Service(Arc::new(McpService::new())));
    assert!(handler.can_handle(&block("b1", "mcp", "", &[])));
    assert!(handler.can_handle(&block("b1", "function", "mcp-srv-1-search", &[])));
    assert!(!handler.can_handle(&block("b1", "function", "http_request", &[])));
}

#[tokio::test]
async fn service_dispatch_requires_an_authenticated_context() {
    let handler = McpBlockHandler::new(McpDispatch::Service(Arc::new(McpService::new())));
    let anonymous = ExecutionContext::new("wf-1", "");

    let inputs: HashMap<String, Value> = [
        ("serverId".to_string(), json!("srv-1")),
        ("toolName".to_string(), json!("search")),
    ]
    .into();
    let err = handler
        .execute(&block("b1", "mcp", "", &[]), &inputs, &anonymous)
        .await
        .unwrap_err();
    assert!(matches!(err, BlockflowError::Unauthorized(_)));
}

#[tokio::test]
async fn endpoint_dispatch_posts_the_tagged_call() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/mcp/execute"))
        .and(body_partial_json(json!({
            "serverId": "srv-1",
            "toolName": "search",
            "arguments": {"q": "rust"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "output": "ok",
        })))
        .expect(1)
        .mount(&endpoint)
        .await;

    let handler = McpBlockHandler::new(McpDispatch::Endpoint {
        client: reqwest::Client::new(),
        base_url: endpoint.uri(),
    });

    // String-encoded arguments parse into structured JSON before sending.
    let inputs: HashMap<String, Value> = [
        ("serverId".to_string(), json!("srv-1")),
        ("toolName".to_string(), json!("search")),
        ("arguments".to_string(), json!("{\"q\": \"rust\"}")),
    ]
    .into();
    let envelope = handler
        .execute(&block("b1", "mcp", "", &[]), &inputs, &ctx())
        .await
        .unwrap();
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["output"], "ok");
}

#[tokio::test]
async fn malformed_string_arguments_degrade_to_empty() {
    let endpoint = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"arguments": {}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&endpoint)
        .await;

    let handler = McpBlockHandler::new(McpDispatch::Endpoint {
        client: reqwest::Client::new(),
        base_url: endpoint.uri(),
    });
    let inputs: HashMap<String, Value> = [
        ("serverId".to_string(), json!("srv-1")),
        ("toolName".to_string(), json!("search")),
        ("arguments".to_string(), json!("{not json")),
    ]
    .into();
    handler
        .execute(&block("b1", "mcp", "", &[]), &inputs, &ctx())
        .await
        .unwrap();
}

#[tokio::test]
async fn composite_tool_id_feeds_the_call_when_params_are_absent() {
    let endpoint = MockServer::start().await;
    Mock::given(body_partial_json(json!({
        "serverId": "my-server",
        "toolName": "search",
    })))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
    .expect(1)
    .mount(&endpoint)
    .await;

    let handler = McpBlockHandler::new(McpDispatch::Endpoint {
        client: reqwest::Client::new(),
        base_url: endpoint.uri(),
    });
    handler
        .execute(
            &block("b1", "mcp", "mcp-my-server-search", &[]),
            &HashMap::new(),
            &ctx(),
        )
        .await
        .unwrap();
}
