//! Per-run execution context
//!
//! Owned exclusively by one execution; never shared across concurrent runs.
//! Event/env data is immutable after creation (Arc<HashMap>); block outputs
//! use DashMap for lock-free concurrent writes from parallel branches.

use crate::stream::StreamEvent;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Context for one workflow execution
#[derive(Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub execution_id: Uuid,

    /// Already-authorized user identity; empty when running without
    /// server-side credentials
    pub user_id: String,
    pub workspace_id: Option<String>,

    /// Decrypted environment values
    env: Arc<HashMap<String, String>>,

    /// Per-block outputs, written as blocks complete
    outputs: Arc<DashMap<String, Value>>,

    /// Output identifiers the caller wants extracted
    /// (`<blockId>` or `<blockId>_<dotted.path>`)
    pub selected_outputs: Arc<Vec<String>>,

    stream: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: Uuid::new_v4(),
            user_id: user_id.into(),
            workspace_id: None,
            env: Arc::new(HashMap::new()),
            outputs: Arc::new(DashMap::new()),
            selected_outputs: Arc::new(Vec::new()),
            stream: None,
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    pub fn with_selected_outputs(mut self, selected: Vec<String>) -> Self {
        self.selected_outputs = Arc::new(selected);
        self
    }

    pub fn with_stream(mut self, sender: mpsc::UnboundedSender<StreamEvent>) -> Self {
        self.stream = Some(sender);
        self
    }

    /// Look up a decrypted environment value
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(|s| s.as_str())
    }

    pub fn get_output(&self, block_id: &str) -> Option<Value> {
        self.outputs.get(block_id).map(|v| v.clone())
    }

    pub fn set_output(&self, block_id: String, value: Value) {
        self.outputs.insert(block_id, value);
    }

    /// Whether server-side credentials are available for protocol calls
    pub fn has_authenticated_user(&self) -> bool {
        !self.user_id.is_empty()
    }

    /// Emit a streaming event; receivers gone is not an error
    pub fn emit(&self, event: StreamEvent) {
        if let Some(ref sender) = self.stream {
            let _ = sender.send(event);
        }
    }
}
