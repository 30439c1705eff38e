//! Core data models for Blockflow
//!
//! This module contains the data structures for editable block state, the
//! serialized execution IR, MCP server configuration, and execution records.
//! Editable state is owned by the graphical editor and arrives as JSON; the
//! IR is produced once per compile and immutable afterward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// EDITABLE STATE (input to the serializer)
// ============================================================================

/// Canvas position of a block
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single editable sub-block field (one UI control)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubBlockState {
    /// Current field value, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,

    /// UI control type (short-input, dropdown, code, ...)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// An editable block as the visual editor holds it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockState {
    /// Unique block identifier (REQUIRED)
    pub id: String,

    /// Block type identifier, resolved against the block registry
    #[serde(rename = "type")]
    pub block_type: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Canvas position
    #[serde(default)]
    pub position: Position,

    /// Field id -> editable value/type
    #[serde(default, rename = "subBlocks")]
    pub sub_blocks: HashMap<String, SubBlockState>,

    /// Whether the block participates in execution
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Advanced mode toggles canonical-group precedence (see serializer)
    #[serde(default, rename = "advancedMode")]
    pub advanced_mode: bool,

    /// Trigger mode marks the block as a workflow entry point
    #[serde(default, rename = "triggerMode")]
    pub trigger_mode: bool,
}

fn default_true() -> bool {
    true
}

/// An editable edge between two blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,

    #[serde(rename = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,

    #[serde(rename = "targetHandle", skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

// ============================================================================
// EXECUTION IR (output of the serializer)
// ============================================================================

/// Tool binding and canonicalized parameters for one IR node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializedBlockConfig {
    /// Resolved concrete tool identifier (empty for subflow containers)
    pub tool: String,

    /// Flattened, canonicalized parameters
    pub params: HashMap<String, serde_json::Value>,
}

/// Display and routing metadata carried on an IR node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializedBlockMetadata {
    /// Block type id
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// One immutable IR node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerializedBlock {
    pub id: String,
    pub position: Position,
    pub config: SerializedBlockConfig,

    /// Static input type declarations from the block schema
    #[serde(default)]
    pub inputs: HashMap<String, serde_json::Value>,

    /// Carried block outputs (augmented with parsed response format)
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,

    pub metadata: SerializedBlockMetadata,
    pub enabled: bool,
}

/// A directed connection in the IR; ids are regenerated on deserialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedConnection {
    pub source: String,
    pub target: String,

    #[serde(rename = "sourceHandle", skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,

    #[serde(rename = "targetHandle", skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

/// Loop subflow descriptor: passed through compilation untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopDescriptor {
    pub id: String,

    /// Member block ids
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Iteration count for counted loops
    #[serde(default)]
    pub iterations: u32,

    /// Iteration source expression for forEach loops
    #[serde(rename = "forEach", skip_serializing_if = "Option::is_none")]
    pub for_each: Option<serde_json::Value>,

    #[serde(rename = "loopType", default)]
    pub loop_type: String,
}

/// Parallel subflow descriptor: passed through compilation untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParallelDescriptor {
    pub id: String,

    /// Member block ids
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Branch count for counted fan-out
    #[serde(default)]
    pub count: u32,

    /// Distribution expression for data-driven fan-out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<serde_json::Value>,

    #[serde(rename = "parallelType", default)]
    pub parallel_type: String,
}

/// The versioned, validated execution IR
///
/// Invariants: every connection endpoint references an existing block id and
/// no block belongs to more than one subflow container. Consumers must check
/// `version` before trusting field shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedWorkflow {
    pub version: String,
    pub blocks: Vec<SerializedBlock>,
    pub connections: Vec<SerializedConnection>,

    #[serde(default)]
    pub loops: HashMap<String, LoopDescriptor>,

    #[serde(default)]
    pub parallels: HashMap<String, ParallelDescriptor>,
}

impl SerializedWorkflow {
    /// Look up a block by id
    pub fn block(&self, id: &str) -> Option<&SerializedBlock> {
        self.blocks.iter().find(|b| b.id == id)
    }
}

// ============================================================================
// MCP
// ============================================================================

/// MCP transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransport {
    Http,
    Sse,
    Stdio,
}

impl McpTransport {
    /// Network transports require a validated URL; stdio requires a command
    pub fn is_network(&self) -> bool {
        matches!(self, McpTransport::Http | McpTransport::Sse)
    }
}

/// MCP server configuration
///
/// Created by user action; soft-deleted (tombstoned) on disconnect-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique server identifier
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub name: String,
    pub transport: McpTransport,

    /// Server URL (network transports)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra request headers (network transports)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,

    /// Command to execute (stdio transport)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Command arguments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    /// Environment variables for the child process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Transport retry count
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tombstone; set on soft delete, never physically removed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn default_timeout_ms() -> u64 {
    crate::constants::DEFAULT_MCP_TIMEOUT_MS
}

fn default_retries() -> u32 {
    crate::constants::DEFAULT_MCP_RETRIES
}

impl McpServerConfig {
    /// Validate transport-specific required fields
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::BlockflowError::validation("server name is required"));
        }
        match self.transport {
            McpTransport::Http | McpTransport::Sse => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::BlockflowError::validation(
                        "url is required for network transports",
                    ));
                }
            }
            McpTransport::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(crate::BlockflowError::validation(
                        "command is required for stdio transport",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether the server is live (enabled and not tombstoned)
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

/// A remotely-hosted tool, derived from a live listTools call
///
/// Cached but never persisted as source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "serverId")]
    pub server_id: Uuid,

    #[serde(rename = "serverName")]
    pub server_name: String,

    /// JSON-Schema-like object describing accepted arguments
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// An explicit tagged tool call, replacing string-encoded composite ids
///
/// The server id arrives as a string at API boundaries and is resolved to a
/// registered server by the protocol service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolCall {
    #[serde(rename = "serverId")]
    pub server_id: String,

    #[serde(rename = "toolName")]
    pub tool_name: String,

    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// One typed part of a tool result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContentPart {
    Text { text: String },
}

/// Result envelope from an MCP tool call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpToolResult {
    #[serde(default)]
    pub content: Vec<McpContentPart>,

    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl McpToolResult {
    /// Concatenate all text parts
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|part| match part {
                McpContentPart::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

// ============================================================================
// EXECUTION RECORDS
// ============================================================================

/// Token counts attached to a block cost
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// Cost attached to a block output by cost-bearing tools
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockCost {
    pub input: f64,
    pub output: f64,
    pub total: f64,

    #[serde(default)]
    pub tokens: TokenUsage,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Append-only execution record for one block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLog {
    pub block_id: String,
    pub block_name: String,
    pub block_type: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<BlockCost>,
}

/// One span in the run-level trace tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub id: String,
    pub name: String,

    #[serde(rename = "type")]
    pub span_type: String,

    pub status: String,

    /// Relative start offset in milliseconds
    pub start_time: u64,

    /// Relative end offset in milliseconds
    pub end_time: u64,

    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceSpan>,
}

/// Per-model cost breakdown entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    pub total: f64,
    pub tokens: TokenUsage,
}

/// Run-level cost summary, aggregated from every block's recorded cost
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub input: f64,
    pub output: f64,
    pub total: f64,
    pub tokens: TokenUsage,

    #[serde(default)]
    pub models: HashMap<String, ModelCost>,
}
