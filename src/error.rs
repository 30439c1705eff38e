//! Error types for Blockflow
//!
//! This module provides a comprehensive error hierarchy using thiserror.
//! All errors can be converted to BlockflowError for unified error handling.

use thiserror::Error;

/// Main error type for Blockflow operations
#[derive(Error, Debug)]
pub enum BlockflowError {
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authorization required: {0}")]
    Unauthorized(String),

    #[error("Block execution failed: {block_id}: {message}")]
    BlockExecution { block_id: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Protocol-layer errors for MCP server communication
#[derive(Error, Debug)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Tool execution timed out after {0}ms")]
    Timeout(u64),

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Rate limit exceeded: {0} executions per hour")]
    RateLimited(u32),

    #[error("User consent required for tool execution on {0}")]
    ConsentRequired(String),

    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Webhook egress errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Delivery failed with status {status}: {message}")]
    Failed { status: u16, message: String },

    #[error("Delivery exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Request error: {0}")]
    Request(String),
}

/// Convenient result type for Blockflow operations
pub type Result<T> = std::result::Result<T, BlockflowError>;

impl BlockflowError {
    /// Create a validation error
    #[inline]
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        BlockflowError::Validation(msg.into())
    }

    /// Create a tool-not-found error
    #[inline]
    pub fn tool_not_found<S: Into<String>>(msg: S) -> Self {
        BlockflowError::ToolNotFound(msg.into())
    }

    /// Create an invalid-arguments error
    #[inline]
    pub fn invalid_arguments<S: Into<String>>(msg: S) -> Self {
        BlockflowError::InvalidArguments(msg.into())
    }

    /// Create a config error
    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        BlockflowError::Config(msg.into())
    }

    /// Create an unauthorized error
    #[inline]
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        BlockflowError::Unauthorized(msg.into())
    }

    /// Create a transport error
    #[inline]
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        BlockflowError::Mcp(McpError::Transport(msg.into()))
    }

    /// Create a block execution error
    #[inline]
    pub fn block_execution<S: Into<String>>(block_id: S, message: S) -> Self {
        BlockflowError::BlockExecution {
            block_id: block_id.into(),
            message: message.into(),
        }
    }

    /// Whether this error indicates a transient protocol condition worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlockflowError::Mcp(McpError::Transport(_))
                | BlockflowError::Mcp(McpError::Timeout(_))
                | BlockflowError::Mcp(McpError::Http(_))
        )
    }
}
