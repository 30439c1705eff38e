use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::engine::ExecutionContext;
use crate::error::BlockflowError;

use super::*;

fn ctx() -> ExecutionContext {
    ExecutionContext::new("wf-1", "user-1")
}

fn params(pairs: &[(&str, serde_json::Value)]) -> HashMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn builtin_registry_serves_http_request() {
    let registry = ToolRegistry::with_builtins();
    let tool = registry.get("http_request").unwrap();
    assert_eq!(tool.name(), "HTTP Request");
    assert!(registry.get("nonexistent").is_none());
}

#[test]
fn registration_replaces_by_id() {
    struct Stub;
    #[async_trait::async_trait]
    impl Tool for Stub {
        fn id(&self) -> &str {
            "http_request"
        }
        fn name(&self) -> &str {
            "Stub"
        }
        async fn execute(
            &self,
            _params: HashMap<String, serde_json::Value>,
            _ctx: &ExecutionContext,
        ) -> crate::Result<ToolResponse> {
            Ok(ToolResponse::default())
        }
    }

    let registry = ToolRegistry::with_builtins();
    registry.register(Arc::new(Stub));
    assert_eq!(registry.get("http_request").unwrap().name(), "Stub");
}

#[tokio::test]
async fn http_request_returns_parsed_json_and_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]})))
        .mount(&server)
        .await;

    let tool = HttpRequestTool::new();
    let response = tool
        .execute(
            params(&[("url", json!(format!("{}/data", server.uri())))]),
            &ctx(),
        )
        .await
        .unwrap();

    assert_eq!(response.output["status"], json!(200));
    assert_eq!(response.output["data"], json!({"items": [1, 2]}));
    assert!(response.cost.is_none());
}

#[tokio::test]
async fn http_request_posts_json_body_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header("x-api-key", "k123"))
        .and(body_json(json!({"q": "rust"})))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&server)
        .await;

    let tool = HttpRequestTool::new();
    let response = tool
        .execute(
            params(&[
                ("url", json!(format!("{}/submit", server.uri()))),
                ("method", json!("POST")),
                ("headers", json!({"x-api-key": "k123"})),
                ("body", json!({"q": "rust"})),
            ]),
            &ctx(),
        )
        .await
        .unwrap();

    assert_eq!(response.output["status"], json!(201));
    // Non-JSON bodies come back as plain strings.
    assert_eq!(response.output["data"], json!("created"));
}

#[tokio::test]
async fn http_request_rejects_bad_inputs_before_sending() {
    let tool = HttpRequestTool::new();

    let err = tool.execute(params(&[]), &ctx()).await.unwrap_err();
    assert!(matches!(err, BlockflowError::InvalidArguments(_)));

    let err = tool
        .execute(
            params(&[
                ("url", json!("https://example.com")),
                ("method", json!("TRACE")),
            ]),
            &ctx(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BlockflowError::InvalidArguments(_)));
}

#[tokio::test]
async fn http_request_error_statuses_are_reported_not_raised() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let tool = HttpRequestTool::new();
    let response = tool
        .execute(params(&[("url", json!(server.uri()))]), &ctx())
        .await
        .unwrap();
    // A reachable server that answers 500 is data, not a transport error.
    assert_eq!(response.output["status"], json!(500));
}
