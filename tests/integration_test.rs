//! End-to-end tests: editable state through compilation, dispatch,
//! streaming, and delivery.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use blockflow::blocks::BlockRegistry;
use blockflow::engine::{Engine, ExecutionContext};
use blockflow::handlers::{
    BlockHandler, GenericBlockHandler, HandlerRegistry, McpBlockHandler, McpDispatch,
};
use blockflow::model::{BlockState, Edge, SerializedBlock, SubBlockState};
use blockflow::serializer::Serializer;
use blockflow::stream::{
    StreamAssembler, StreamEvent, compose_run_output, resolve_selected_outputs,
};
use blockflow::tools::ToolRegistry;
use blockflow::webhook::{DeliveryNotifier, Disposition, WebhookSubscription, verify_signature};

fn block_state(id: &str, block_type: &str, fields: &[(&str, Value)]) -> BlockState {
    BlockState {
        id: id.to_string(),
        block_type: block_type.to_string(),
        name: format!("{id} block"),
        sub_blocks: fields
            .iter()
            .map(|(key, value)| {
                (
                    key.to_string(),
                    SubBlockState {
                        value: Some(value.clone()),
                        kind: None,
                    },
                )
            })
            .collect(),
        enabled: true,
        ..Default::default()
    }
}

fn edge(source: &str, target: &str) -> Edge {
    Edge {
        id: Uuid::new_v4().to_string(),
        source: source.to_string(),
        target: target.to_string(),
        source_handle: None,
        target_handle: None,
    }
}

fn generic_fallback() -> Arc<GenericBlockHandler> {
    Arc::new(GenericBlockHandler::new(
        Arc::new(ToolRegistry::with_builtins()),
        Arc::new(BlockRegistry::with_builtins()),
    ))
}

/// Compile a starter -> mcp graph, execute it against a mocked execution
/// endpoint, and resolve the selected output from the logs.
#[tokio::test]
async fn compiled_mcp_workflow_selects_tool_output() {
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
            "content": [{"type": "text", "text": "ok"}],
        })))
        .expect(1)
        .mount(&endpoint)
        .await;

    // Compile editable state into the IR.
    let serializer = Serializer::new(Arc::new(BlockRegistry::with_builtins()));
    let blocks = vec![
        block_state("start", "starter", &[("input", json!({}))]),
        block_state(
            "m1",
            "mcp",
            &[
                ("serverId", json!("srv-1")),
                ("toolName", json!("search")),
                ("arguments", json!({"q": "rust"})),
            ],
        ),
    ];
    let edges = vec![edge("start", "m1")];
    let workflow = serializer
        .serialize(&blocks, &edges, &HashMap::new(), &HashMap::new(), true)
        .unwrap();

    let compiled = workflow.block("m1").unwrap();
    assert_eq!(compiled.config.tool, "mcp-srv-1-search");

    // Execute through the handler registry.
    let mut handlers = HandlerRegistry::new(generic_fallback());
    handlers.register(Arc::new(McpBlockHandler::new(McpDispatch::Endpoint {
        client: reqwest::Client::new(),
        base_url: endpoint.uri(),
    })));
    let engine = Engine::new(Arc::new(handlers));
    let ctx = ExecutionContext::new("wf-1", "alice");

    let result = engine.execute(&workflow, &ctx).await.unwrap();
    assert!(result.success);
    assert_eq!(result.logs.len(), 1); // the trigger produces no log
    assert_eq!(result.logs[0].block_id, "m1");

    // Selected output references resolve against the logs.
    let text = resolve_selected_outputs(&["m1_output".to_string()], &result.logs);
    assert_eq!(text, "ok");
}

/// Chunk-emitting handler used to exercise the streaming pipeline.
struct ChunkingHandler;

#[async_trait::async_trait]
impl BlockHandler for ChunkingHandler {
    fn name(&self) -> &str {
        "chunking"
    }
    fn can_handle(&self, _block: &SerializedBlock) -> bool {
        true
    }
    async fn execute(
        &self,
        block: &SerializedBlock,
        _inputs: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> blockflow::Result<Value> {
        let text = block.id.to_uppercase();
        for ch in text.chars() {
            ctx.emit(StreamEvent::Chunk {
                block_id: block.id.clone(),
                text: ch.to_string(),
            });
        }
        Ok(json!({"content": text}))
    }
}

#[tokio::test]
async fn streamed_blocks_are_separated_by_a_blank_line() {
    let serializer = Serializer::new(Arc::new(BlockRegistry::with_builtins()));
    let blocks = vec![
        block_state("a", "function", &[("code", json!("noop"))]),
        block_state("b", "function", &[("code", json!("noop"))]),
    ];
    let edges = vec![edge("a", "b")];
    let workflow = serializer
        .serialize(&blocks, &edges, &HashMap::new(), &HashMap::new(), false)
        .unwrap();

    let mut handlers = HandlerRegistry::new(generic_fallback());
    handlers.register(Arc::new(ChunkingHandler));
    let engine = Engine::new(Arc::new(handlers));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let ctx = ExecutionContext::new("wf-1", "alice").with_stream(tx);
    engine.execute(&workflow, &ctx).await.unwrap();

    let mut assembler = StreamAssembler::new();
    let mut saw_run_end = false;
    while let Ok(event) = rx.try_recv() {
        assert!(!saw_run_end, "no events may follow the run end marker");
        if event == StreamEvent::RunEnd {
            saw_run_end = true;
        }
        assembler.feed(&event);
    }
    assert!(saw_run_end);
    assert_eq!(assembler.output(), "A\n\nB");
}

#[test]
fn compiled_workflows_round_trip_back_to_editable_state() {
    let serializer = Serializer::new(Arc::new(BlockRegistry::with_builtins()));
    let blocks = vec![
        block_state("start", "starter", &[("input", json!({}))]),
        block_state(
            "api1",
            "api",
            &[
                ("url", json!("https://example.com/data")),
                ("method", json!("get")),
            ],
        ),
    ];
    let edges = vec![edge("start", "api1")];
    let workflow = serializer
        .serialize(&blocks, &edges, &HashMap::new(), &HashMap::new(), true)
        .unwrap();

    let (restored_blocks, restored_edges) = serializer.deserialize(&workflow).unwrap();
    assert_eq!(restored_blocks.len(), 2);
    let api = restored_blocks.iter().find(|b| b.id == "api1").unwrap();
    assert_eq!(api.block_type, "api");
    assert_eq!(
        api.sub_blocks["url"].value,
        Some(json!("https://example.com/data"))
    );

    assert_eq!(restored_edges.len(), 1);
    assert_eq!(restored_edges[0].source, "start");
    assert_eq!(restored_edges[0].target, "api1");
    // Edge ids are regenerated, not preserved.
    assert_ne!(restored_edges[0].id, edges[0].id);
}

/// A flapping receiver: the delivery id must stay stable across attempts
/// and the retry classification must follow the ladder.
#[tokio::test]
async fn webhook_retries_reuse_the_delivery_id() {
    let receiver = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&receiver)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&receiver)
        .await;

    let notifier = DeliveryNotifier::new();
    let subscription = WebhookSubscription {
        id: Uuid::new_v4(),
        url: receiver.uri(),
        secret: Some("topsecret".to_string()),
        events: Vec::new(),
    };
    let delivery_id = Uuid::new_v4();
    let payload = json!({"event": "run.completed", "runId": "r1"});

    let first = notifier
        .attempt(&subscription, "run.completed", &payload, delivery_id, 1)
        .await
        .unwrap();
    assert_eq!(
        first.disposition,
        Disposition::Retry {
            after: std::time::Duration::from_secs(60)
        }
    );

    let second = notifier
        .attempt(&subscription, "run.completed", &payload, delivery_id, 2)
        .await
        .unwrap();
    assert_eq!(second.disposition, Disposition::Delivered);
    assert_eq!(second.delivery_id, first.delivery_id);

    let requests = receiver.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let ids: Vec<&str> = requests
        .iter()
        .map(|r| r.headers["x-webhook-delivery-id"].to_str().unwrap())
        .collect();
    assert_eq!(ids[0], ids[1]);

    // Each attempt is independently signed and verifiable.
    for request in &requests {
        let timestamp: i64 = request.headers["x-webhook-timestamp"]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = String::from_utf8(request.body.clone()).unwrap();
        let signature = request.headers["x-webhook-signature"].to_str().unwrap();
        assert!(verify_signature("topsecret", timestamp, &body, signature));
    }
}

/// Stream a run and append a selected output after the streamed text,
/// keeping exactly one blank-line separator between the two pieces.
#[tokio::test]
async fn run_output_composes_streamed_text_with_selected_outputs() {
    let serializer = Serializer::new(Arc::new(BlockRegistry::with_builtins()));
    let blocks = vec![
        block_state("a", "function", &[("code", json!("noop"))]),
        block_state("b", "function", &[("code", json!("noop"))]),
    ];
    let edges = vec![edge("a", "b")];
    let workflow = serializer
        .serialize(&blocks, &edges, &HashMap::new(), &HashMap::new(), false)
        .unwrap();

    let mut handlers = HandlerRegistry::new(generic_fallback());
    handlers.register(Arc::new(ChunkingHandler));
    let engine = Engine::new(Arc::new(handlers));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let ctx = ExecutionContext::new("wf-1", "alice").with_stream(tx);
    let result = engine.execute(&workflow, &ctx).await.unwrap();

    let mut assembler = StreamAssembler::new();
    while let Ok(event) = rx.try_recv() {
        assembler.feed(&event);
    }

    let selected = resolve_selected_outputs(&["b_content".to_string()], &result.logs);
    assert_eq!(selected, "B");

    let combined = compose_run_output(&assembler.output(), &selected);
    assert_eq!(combined, "A\n\nB\n\nB");

    // An empty selection leaves the streamed text untouched.
    assert_eq!(compose_run_output(&assembler.output(), ""), "A\n\nB");
}
