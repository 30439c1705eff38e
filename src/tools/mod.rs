//! Static tool registry
//!
//! Tools are the executable side of ordinary blocks: the serializer resolves
//! each block to a tool id, and the generic handler looks the id up here at
//! dispatch time. Dynamically-namespaced MCP tool ids bypass this registry.

use crate::engine::ExecutionContext;
use crate::model::BlockCost;
use crate::{BlockflowError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Output of a tool execution
///
/// Cost-bearing tools (knowledge domain) attach a cost object; the generic
/// handler hoists it onto the block output.
#[derive(Debug, Clone, Default)]
pub struct ToolResponse {
    pub output: HashMap<String, Value>,
    pub cost: Option<BlockCost>,
}

impl ToolResponse {
    pub fn output(output: HashMap<String, Value>) -> Self {
        Self { output, cost: None }
    }
}

/// Tool trait for block execution
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool identifier referenced from block configs
    fn id(&self) -> &str;

    /// Human-readable name, used in synthesized error messages
    fn name(&self) -> &str;

    /// Execute with canonicalized parameters
    async fn execute(
        &self,
        params: HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<ToolResponse>;
}

/// Registry of tools - uses DashMap for lock-free concurrent access
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(DashMap::new()),
        }
    }

    /// Create a registry preloaded with the built-in tools
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(HttpRequestTool::new()));
        registry
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.id().to_string(), tool);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(id).map(|entry| Arc::clone(&*entry))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Generic HTTP request tool backing the api block
pub struct HttpRequestTool {
    client: reqwest::Client,
}

impl HttpRequestTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpRequestTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn id(&self) -> &str {
        "http_request"
    }

    fn name(&self) -> &str {
        "HTTP Request"
    }

    async fn execute(
        &self,
        params: HashMap<String, Value>,
        _ctx: &ExecutionContext,
    ) -> Result<ToolResponse> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BlockflowError::invalid_arguments("url is required"))?;
        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET");

        let mut request = match method {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "PATCH" => self.client.patch(url),
            "DELETE" => self.client.delete(url),
            other => {
                return Err(BlockflowError::invalid_arguments(format!(
                    "unsupported HTTP method: {}",
                    other
                )));
            }
        };

        if let Some(headers) = params.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }

        if let Some(body) = params.get("body").filter(|v| !v.is_null()) {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BlockflowError::transport(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| BlockflowError::transport(e.to_string()))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(ToolResponse::output(HashMap::from([
            ("data".to_string(), data),
            ("status".to_string(), json!(status)),
        ])))
    }
}

#[cfg(test)]
mod tools_test;
