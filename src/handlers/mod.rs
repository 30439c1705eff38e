//! Handler registry and dispatch
//!
//! Each IR node is routed to the first registered handler whose `can_handle`
//! returns true. The catch-all generic handler lives in a dedicated field
//! rather than at the end of the list, so "dispatch never fails for lack of
//! a handler" is a structural guarantee, not a registration convention.

pub mod generic;
pub mod mcp;

use crate::engine::ExecutionContext;
use crate::model::SerializedBlock;
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use generic::GenericBlockHandler;
pub use mcp::{McpBlockHandler, McpDispatch};

/// Capability-matched executor for IR nodes
#[async_trait]
pub trait BlockHandler: Send + Sync {
    /// Handler name, used in logs
    fn name(&self) -> &str;

    /// Whether this handler can process the given node
    fn can_handle(&self, block: &SerializedBlock) -> bool;

    /// Execute the node
    async fn execute(
        &self,
        block: &SerializedBlock,
        inputs: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value>;
}

/// Ordered list of handlers with a structurally-last catch-all
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn BlockHandler>>,
    fallback: Arc<GenericBlockHandler>,
}

impl HandlerRegistry {
    /// Create a registry; the generic handler is always the final fallback
    pub fn new(fallback: Arc<GenericBlockHandler>) -> Self {
        Self {
            handlers: Vec::new(),
            fallback,
        }
    }

    /// Register a handler; earlier registrations win
    pub fn register(&mut self, handler: Arc<dyn BlockHandler>) {
        self.handlers.push(handler);
    }

    /// Route a node to the first matching handler
    pub async fn dispatch(
        &self,
        block: &SerializedBlock,
        inputs: &HashMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        for handler in &self.handlers {
            if handler.can_handle(block) {
                tracing::debug!(
                    block_id = %block.id,
                    handler = handler.name(),
                    "dispatching block"
                );
                return handler.execute(block, inputs, ctx).await;
            }
        }
        self.fallback.execute(block, inputs, ctx).await
    }
}

#[cfg(test)]
mod handlers_test;
