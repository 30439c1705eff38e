//! Configuration management
//!
//! Loads configuration from blockflow.config.json. Every field has a
//! working default so a missing file yields a usable local setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BlockflowError, Result, constants};

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    /// MCP integration configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpConfig>,

    /// Webhook egress configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,

    /// Logging configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: constants::DEFAULT_HTTP_PORT,
        }
    }
}

/// MCP integration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    /// Default per-request timeout for servers that don't override it
    pub timeout_ms: u64,

    /// Tool inventory cache TTL
    pub discovery_ttl_secs: u64,

    /// Per-connection rolling-hour tool execution cap
    pub max_tool_executions_per_hour: u32,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: constants::DEFAULT_MCP_TIMEOUT_MS,
            discovery_ttl_secs: constants::DEFAULT_DISCOVERY_TTL_SECS,
            max_tool_executions_per_hour: constants::DEFAULT_MAX_TOOL_EXECUTIONS_PER_HOUR,
        }
    }
}

/// Webhook egress settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    /// Default signing secret for subscriptions that don't carry their own
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, e.g. "blockflow=debug"
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "blockflow=info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default file location.
    pub fn load() -> Result<Self> {
        Self::load_from_path(constants::CONFIG_FILE_NAME)
    }

    /// Load configuration from a specific path; a missing file is the
    /// default configuration, not an error.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| BlockflowError::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref http) = self.http {
            if http.host.trim().is_empty() {
                return Err(BlockflowError::config("http.host must not be empty"));
            }
            if http.port == 0 {
                return Err(BlockflowError::config("http.port must be non-zero"));
            }
        }
        if let Some(ref mcp) = self.mcp
            && mcp.timeout_ms == 0
        {
            return Err(BlockflowError::config("mcp.timeoutMs must be non-zero"));
        }
        Ok(())
    }

    pub fn http(&self) -> HttpConfig {
        self.http.clone().unwrap_or_default()
    }

    pub fn mcp(&self) -> McpConfig {
        self.mcp.clone().unwrap_or_default()
    }

    pub fn log(&self) -> LogConfig {
        self.log.clone().unwrap_or_default()
    }
}
