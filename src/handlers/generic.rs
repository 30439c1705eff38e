//! Generic block handler - catch-all dispatch to the static tool registry

use super::*;
use crate::blocks::BlockRegistry;
use crate::constants::MCP_TOOL_PREFIX;
use crate::tools::ToolRegistry;
use crate::BlockflowError;
use chrono::Utc;

/// Universal fallback handler: resolves the node's tool in the static
/// registry and invokes it
pub struct GenericBlockHandler {
    tools: Arc<ToolRegistry>,
    blocks: Arc<BlockRegistry>,
}

impl GenericBlockHandler {
    pub fn new(tools: Arc<ToolRegistry>, blocks: Arc<BlockRegistry>) -> Self {
        Self { tools, blocks }
    }

    /// Apply the block type's parameter transform, if declared
    ///
    /// Transform failures are logged and the original parameters are used;
    /// dispatch never proceeds with silently-emptied input.
    fn transform_params(
        &self,
        block: &SerializedBlock,
        inputs: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        let Some(config) = self.blocks.get(&block.metadata.id) else {
            return inputs.clone();
        };
        let Some(transform) = config.param_transform else {
            return inputs.clone();
        };
        match transform(inputs.clone()) {
            Ok(transformed) => transformed,
            Err(e) => {
                tracing::warn!(
                    block_id = %block.id,
                    block_type = %block.metadata.id,
                    error = %e,
                    "parameter transform failed, using original parameters"
                );
                inputs.clone()
            }
        }
    }
}

#[async_trait]
impl BlockHandler for GenericBlockHandler {
    fn name(&self) -> &str {
        "generic"
    }

    /// The catch-all accepts every node
    fn can_handle(&self, _block: &SerializedBlock) -> bool {
        true
    }

    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let tool_id = block.config.tool.as_str();

        // Dynamically-namespaced protocol tool ids never resolve in the
        // static registry; the MCP handler owns them
        if tool_id.starts_with(MCP_TOOL_PREFIX) {
            return Err(BlockflowError::transport(format!(
                "protocol tool {} reached the generic handler without an MCP dispatcher",
                tool_id
            )));
        }

        let tool = self.tools.get(tool_id).ok_or_else(|| {
            BlockflowError::tool_not_found(format!(
                "tool {} not found for block {} ({})",
                tool_id, block.id, block.metadata.id
            ))
        })?;

        let params = self.transform_params(block, inputs);

        match tool.execute(params, ctx).await {
            Ok(response) => {
                let mut output = serde_json::to_value(&response.output)?;
                // Cost-bearing tools get their cost hoisted onto the output
                if let Some(cost) = response.cost
                    && let Some(map) = output.as_object_mut()
                {
                    map.insert("cost".to_string(), serde_json::to_value(&cost)?);
                }
                Ok(output)
            }
            Err(e) => {
                // Dispatch never propagates an unlabeled error
                let message = match e.to_string() {
                    s if s.trim().is_empty() => "no error message provided".to_string(),
                    s => s,
                };
                let block_name = block.metadata.name.as_deref().unwrap_or(&block.id);
                Err(BlockflowError::block_execution(
                    block.id.clone(),
                    format!(
                        "tool {} ({}) failed for block {}: {} [at {}]",
                        tool_id,
                        tool.name(),
                        block_name,
                        message,
                        Utc::now().to_rfc3339()
                    ),
                ))
            }
        }
    }
}
