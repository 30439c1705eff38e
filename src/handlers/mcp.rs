//! MCP block handler - routes protocol tool nodes to the MCP service

use super::*;
use crate::constants::MCP_TOOL_PREFIX;
use crate::mcp::McpService;
use crate::model::McpToolCall;
use crate::BlockflowError;
use serde_json::json;

/// Where protocol tool calls are sent
///
/// `Service` executes against the in-process protocol service; `Endpoint`
/// is a thin call to a remote execution endpoint for runtimes that cannot
/// hold live protocol connections.
pub enum McpDispatch {
    Service(Arc<McpService>),
    Endpoint {
        client: reqwest::Client,
        base_url: String,
    },
}

/// Specialized handler for externally-hosted protocol tools
pub struct McpBlockHandler {
    dispatch: McpDispatch,
}

impl McpBlockHandler {
    pub fn new(dispatch: McpDispatch) -> Self {
        Self { dispatch }
    }

    /// Extract the tagged call from node parameters
    ///
    /// Prefers explicit serverId/toolName; falls back to splitting a
    /// composite `mcp-<serverId>-<toolName>` identifier. Malformed JSON in
    /// string-encoded arguments degrades to empty arguments.
    fn extract_call(
        &self,
        block: &SerializedBlock,
        inputs: &HashMap<String, Value>,
    ) -> Result<McpToolCall> {
        let arguments = match inputs.get("arguments") {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|e| {
                tracing::warn!(block_id = %block.id, error = %e, "malformed tool arguments, using empty");
                json!({})
            }),
            Some(value) => value.clone(),
            None => json!({}),
        };

        let server_id = inputs.get("serverId").and_then(|v| v.as_str());
        let tool_name = inputs.get("toolName").and_then(|v| v.as_str());
        if let (Some(server_id), Some(tool_name)) = (server_id, tool_name) {
            return Ok(McpToolCall {
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments,
            });
        }

        let composite = inputs
            .get("tool")
            .and_then(|v| v.as_str())
            .unwrap_or(block.config.tool.as_str());
        let (server_id, tool_name) = split_composite_id(composite).ok_or_else(|| {
            BlockflowError::invalid_arguments(format!(
                "block {} has no serverId/toolName and no composite tool id",
                block.id
            ))
        })?;

        Ok(McpToolCall {
            server_id,
            tool_name,
            arguments,
        })
    }
}

/// Split `mcp-<serverId>-<toolName>` into its parts
///
/// UUID server ids are fixed-width and unambiguous; for anything else the
/// last hyphen-separated segment is taken as the tool name.
pub(crate) fn split_composite_id(composite: &str) -> Option<(String, String)> {
    let stripped = composite.strip_prefix(MCP_TOOL_PREFIX)?;

    if stripped.len() > 37
        && stripped.as_bytes()[36] == b'-'
        && uuid::Uuid::parse_str(&stripped[..36]).is_ok()
    {
        return Some((stripped[..36].to_string(), stripped[37..].to_string()));
    }

    let (server_id, tool_name) = stripped.rsplit_once('-')?;
    if server_id.is_empty() || tool_name.is_empty() {
        return None;
    }
    Some((server_id.to_string(), tool_name.to_string()))
}

#[async_trait]
impl BlockHandler for McpBlockHandler {
    fn name(&self) -> &str {
        "mcp"
    }

    fn can_handle(&self, block: &SerializedBlock) -> bool {
        block.metadata.id == "mcp" || block.config.tool.starts_with(MCP_TOOL_PREFIX)
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let call = self.extract_call(block, inputs)?;

        match &self.dispatch {
            McpDispatch::Service(service) => {
                if !ctx.has_authenticated_user() {
                    return Err(BlockflowError::unauthorized(
                        "MCP tool execution requires authenticated context",
                    ));
                }
                let result = service
                    .execute_tool(&ctx.user_id, &call, ctx.workspace_id.as_deref())
                    .await?;

                if result.is_error {
                    // Structured failure: callers still record cost/trace
                    return Ok(json!({
                        "success": false,
                        "error": result.text(),
                        "content": result.content,
                    }));
                }
                Ok(json!({
                    "success": true,
                    "output": result.text(),
                    "content": result.content,
                }))
            }
            McpDispatch::Endpoint { client, base_url } => {
                let response = client
                    .post(format!("{}/api/mcp/execute", base_url))
                    .json(&json!({
                        "serverId": call.server_id,
                        "toolName": call.tool_name,
                        "arguments": call.arguments,
                        "workspaceId": ctx.workspace_id,
                    }))
                    .send()
                    .await
                    .map_err(|e| BlockflowError::transport(e.to_string()))?;

                let envelope: Value = response
                    .json()
                    .await
                    .map_err(|e| BlockflowError::transport(e.to_string()))?;
                Ok(envelope)
            }
        }
    }
}
