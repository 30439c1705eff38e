//! Constants used throughout Blockflow
//!
//! This module contains all constant values used in the Blockflow runtime,
//! including tool-id prefixes, protocol versions, and execution defaults.

// ============================================================================
// WORKFLOW IR
// ============================================================================

/// Current serialized workflow format version
pub const WORKFLOW_VERSION: &str = "1.0";

/// Block type: starter
pub const BLOCK_TYPE_STARTER: &str = "starter";

/// Block type: loop container
pub const BLOCK_TYPE_LOOP: &str = "loop";

/// Block type: parallel container
pub const BLOCK_TYPE_PARALLEL: &str = "parallel";

/// Block category for trigger blocks (exempt from validation and param mapping)
pub const BLOCK_CATEGORY_TRIGGERS: &str = "triggers";

/// Block category for knowledge-domain blocks (may attach cost to outputs)
pub const BLOCK_CATEGORY_KNOWLEDGE: &str = "knowledge";

// ============================================================================
// MCP (Model Context Protocol)
// ============================================================================

/// Prefix marking dynamically-namespaced MCP tool ids in the IR
pub const MCP_TOOL_PREFIX: &str = "mcp-";

/// Preferred protocol version offered during negotiation
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Client name reported during initialize
pub const MCP_CLIENT_NAME: &str = "blockflow";

/// MCP transport: streamable HTTP
pub const MCP_TRANSPORT_HTTP: &str = "http";

/// MCP transport: server-sent events
pub const MCP_TRANSPORT_SSE: &str = "sse";

/// MCP transport: child process stdio
pub const MCP_TRANSPORT_STDIO: &str = "stdio";

/// Default per-request MCP timeout in milliseconds
pub const DEFAULT_MCP_TIMEOUT_MS: u64 = 30_000;

/// Default MCP retry count
pub const DEFAULT_MCP_RETRIES: u32 = 3;

/// Default discovery cache TTL in seconds
pub const DEFAULT_DISCOVERY_TTL_SECS: u64 = 300;

/// Default hourly tool-execution ceiling per server
pub const DEFAULT_MAX_TOOL_EXECUTIONS_PER_HOUR: u32 = 100;

// ============================================================================
// STREAMING
// ============================================================================

/// Separator inserted between two different blocks' streamed output
pub const STREAM_BLOCK_SEPARATOR: &str = "\n\n";

// ============================================================================
// WEBHOOK EGRESS
// ============================================================================

/// Header carrying the event type
pub const WEBHOOK_HEADER_EVENT: &str = "x-webhook-event";

/// Header carrying the unix timestamp used in the signature base string
pub const WEBHOOK_HEADER_TIMESTAMP: &str = "x-webhook-timestamp";

/// Header carrying the delivery id (doubles as idempotency key)
pub const WEBHOOK_HEADER_DELIVERY_ID: &str = "x-webhook-delivery-id";

/// Header carrying the HMAC-SHA256 signature
pub const WEBHOOK_HEADER_SIGNATURE: &str = "x-webhook-signature";

/// Maximum delivery attempts before a delivery is marked failed
pub const WEBHOOK_MAX_ATTEMPTS: u32 = 10;

/// Fixed retry backoff ladder in seconds (1m, 5m, 15m, 1h, 2h, 4h, 8h, 12h, 24h, 24h)
pub const WEBHOOK_BACKOFF_LADDER_SECS: [u64; 10] = [
    60, 300, 900, 3_600, 7_200, 14_400, 28_800, 43_200, 86_400, 86_400,
];

// ============================================================================
// HTTP
// ============================================================================

/// Default API server port
pub const DEFAULT_HTTP_PORT: u16 = 3330;

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "blockflow.config.json";
