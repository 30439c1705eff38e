//! Process-wide MCP façade: server registry, discovery cache, and tool
//! execution.
//!
//! Server configurations are owned by the user who registered them and are
//! soft-deleted, never physically removed. Tool inventories come from live
//! `tools/list` calls and pass through an injectable TTL cache; any server
//! mutation invalidates the owner's cached entries so stale inventories
//! cannot outlive a config change. Tool arguments are validated against the
//! discovered input schema before any transport round-trip.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::constants::{DEFAULT_DISCOVERY_TTL_SECS, DEFAULT_MAX_TOOL_EXECUTIONS_PER_HOUR};
use crate::error::{BlockflowError, McpError, Result};
use crate::model::{McpServerConfig, McpTool, McpToolCall, McpToolResult};

use super::client::{ConnectionState, McpClient, McpSecurityPolicy};
use super::url::validate_server_url;

// ============================================================================
// DISCOVERY CACHE
// ============================================================================

struct CacheEntry {
    tools: Vec<McpTool>,
    fetched_at: Instant,
}

/// TTL cache for discovered tool inventories, keyed by
/// (user, workspace, server). Injectable so tests can observe hit/miss
/// behavior and tune the TTL.
pub struct DiscoveryCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn key(user_id: &str, workspace_id: Option<&str>, server_id: Uuid) -> String {
        format!(
            "{user_id}|{}|{server_id}",
            workspace_id.unwrap_or("-")
        )
    }

    pub fn get(&self, user_id: &str, workspace_id: Option<&str>, server_id: Uuid) -> Option<Vec<McpTool>> {
        let key = Self::key(user_id, workspace_id, server_id);
        let entry = self.entries.get(&key)?;
        if entry.fetched_at.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.tools.clone())
    }

    pub fn put(&self, user_id: &str, workspace_id: Option<&str>, server_id: Uuid, tools: Vec<McpTool>) {
        self.entries.insert(
            Self::key(user_id, workspace_id, server_id),
            CacheEntry {
                tools,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Drop every cached inventory belonging to a user, across workspaces.
    pub fn invalidate_user(&self, user_id: &str) {
        let prefix = format!("{user_id}|");
        self.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_DISCOVERY_TTL_SECS))
    }
}

// ============================================================================
// SERVICE
// ============================================================================

struct ServerRecord {
    owner: String,
    workspace_id: Option<String>,
    config: McpServerConfig,
}

/// Outcome of a connectivity probe; nothing is persisted either way
#[derive(Debug, Serialize)]
pub struct TestConnectionResult {
    pub success: bool,
    #[serde(rename = "negotiatedVersion", skip_serializing_if = "Option::is_none")]
    pub negotiated_version: Option<String>,
    #[serde(rename = "toolCount")]
    pub tool_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefreshedServer {
    #[serde(rename = "serverId")]
    pub server_id: Uuid,
    pub name: String,
    #[serde(rename = "toolCount")]
    pub tool_count: usize,
}

#[derive(Debug, Serialize)]
pub struct FailedServer {
    #[serde(rename = "serverId")]
    pub server_id: Uuid,
    pub name: String,
    pub error: String,
}

/// Rolled-up counts for a fan-out refresh
#[derive(Debug, Serialize)]
pub struct RefreshTotals {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Per-server outcomes of a fan-out refresh; one failure never aborts the rest
#[derive(Debug, Serialize)]
pub struct RefreshSummary {
    pub refreshed: Vec<RefreshedServer>,
    pub failed: Vec<FailedServer>,
    pub summary: RefreshTotals,
}

/// Registry and execution façade over every configured MCP server
pub struct McpService {
    servers: DashMap<Uuid, ServerRecord>,
    clients: DashMap<Uuid, Arc<McpClient>>,
    cache: Arc<DiscoveryCache>,
    max_tool_executions_per_hour: u32,
}

impl McpService {
    pub fn new() -> Self {
        Self::with_cache(Arc::new(DiscoveryCache::default()))
    }

    pub fn with_cache(cache: Arc<DiscoveryCache>) -> Self {
        Self {
            servers: DashMap::new(),
            clients: DashMap::new(),
            cache,
            max_tool_executions_per_hour: DEFAULT_MAX_TOOL_EXECUTIONS_PER_HOUR,
        }
    }

    pub fn with_rate_limit(mut self, max_tool_executions_per_hour: u32) -> Self {
        self.max_tool_executions_per_hour = max_tool_executions_per_hour;
        self
    }

    // ------------------------------------------------------------------
    // Server registry
    // ------------------------------------------------------------------

    /// Register a server for a user. Network URLs are vetted and normalized
    /// before the config is stored.
    pub fn create_server(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        mut config: McpServerConfig,
    ) -> Result<McpServerConfig> {
        config.validate()?;
        if config.transport.is_network() {
            let url = config.url.as_deref().unwrap_or("");
            config.url = Some(validate_server_url(url)?);
        }
        config.deleted_at = None;

        self.servers.insert(
            config.id,
            ServerRecord {
                owner: user_id.to_string(),
                workspace_id: workspace_id.map(str::to_string),
                config: config.clone(),
            },
        );
        self.cache.invalidate_user(user_id);
        tracing::info!(user = user_id, server = %config.name, id = %config.id, "registered MCP server");
        Ok(config)
    }

    /// Replace a server's configuration in place. The id and owner survive;
    /// any live connection is torn down so the next use redials.
    pub async fn update_server(
        &self,
        user_id: &str,
        server_id: &str,
        mut config: McpServerConfig,
    ) -> Result<McpServerConfig> {
        let id = self.resolve_owned(user_id, server_id)?.id;
        config.id = id;
        config.validate()?;
        if config.transport.is_network() {
            let url = config.url.as_deref().unwrap_or("");
            config.url = Some(validate_server_url(url)?);
        }

        match self.servers.get_mut(&id) {
            Some(mut record) => {
                config.deleted_at = record.config.deleted_at;
                record.config = config.clone();
            }
            None => return Err(McpError::ServerNotFound(server_id.to_string()).into()),
        }
        self.drop_client(id).await;
        self.cache.invalidate_user(user_id);
        Ok(config)
    }

    /// Soft-delete: tombstone the config, disconnect, and forget cached tools.
    pub async fn delete_server(&self, user_id: &str, server_id: &str) -> Result<()> {
        let id = self.resolve_owned(user_id, server_id)?.id;
        if let Some(mut record) = self.servers.get_mut(&id) {
            record.config.deleted_at = Some(Utc::now());
        }
        self.drop_client(id).await;
        self.cache.invalidate_user(user_id);
        tracing::info!(user = user_id, server_id = %id, "soft-deleted MCP server");
        Ok(())
    }

    /// All non-deleted servers visible to a user in a workspace.
    pub fn list_servers(&self, user_id: &str, workspace_id: Option<&str>) -> Vec<McpServerConfig> {
        self.servers
            .iter()
            .filter(|record| Self::visible(record.value(), user_id, workspace_id))
            .filter(|record| record.config.deleted_at.is_none())
            .map(|record| record.config.clone())
            .collect()
    }

    pub fn get_server(&self, user_id: &str, server_id: &str) -> Result<McpServerConfig> {
        self.resolve_owned(user_id, server_id)
    }

    /// Insert a config without URL vetting. Tests point servers at
    /// 127.0.0.1 mocks, which the production path refuses.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        config: McpServerConfig,
    ) {
        self.servers.insert(
            config.id,
            ServerRecord {
                owner: user_id.to_string(),
                workspace_id: workspace_id.map(str::to_string),
                config,
            },
        );
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Aggregate tool discovery across every active server.
    ///
    /// Per-server failures are logged and skipped; the caller always gets a
    /// (possibly empty) list, never an error from one bad server.
    pub async fn discover_tools(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        force_refresh: bool,
    ) -> Vec<McpTool> {
        let servers = self.active_servers(user_id, workspace_id);

        let lookups = servers.iter().map(|config| {
            self.discover_server_tools(user_id, workspace_id, config, force_refresh)
        });
        let results = futures::future::join_all(lookups).await;

        let mut tools = Vec::new();
        for (config, result) in servers.iter().zip(results) {
            match result {
                Ok(mut found) => tools.append(&mut found),
                Err(e) => {
                    tracing::warn!(server = %config.name, error = %e, "tool discovery failed");
                }
            }
        }
        tools
    }

    /// Reconnect and rediscover a chosen set of servers (or all of them),
    /// reporting per-server outcomes.
    pub async fn refresh_servers(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        server_ids: Option<&[String]>,
    ) -> RefreshSummary {
        let mut targets = self.active_servers(user_id, workspace_id);
        if let Some(ids) = server_ids {
            targets.retain(|config| {
                ids.iter()
                    .any(|id| id == &config.id.to_string() || id == &config.name)
            });
        }

        let lookups = targets
            .iter()
            .map(|config| self.discover_server_tools(user_id, workspace_id, config, true));
        let results = futures::future::join_all(lookups).await;

        let mut refreshed = Vec::new();
        let mut failed = Vec::new();
        for (config, result) in targets.iter().zip(results) {
            match result {
                Ok(tools) => refreshed.push(RefreshedServer {
                    server_id: config.id,
                    name: config.name.clone(),
                    tool_count: tools.len(),
                }),
                Err(e) => failed.push(FailedServer {
                    server_id: config.id,
                    name: config.name.clone(),
                    error: e.to_string(),
                }),
            }
        }
        RefreshSummary {
            summary: RefreshTotals {
                total: refreshed.len() + failed.len(),
                succeeded: refreshed.len(),
                failed: failed.len(),
            },
            refreshed,
            failed,
        }
    }

    /// Discover one server's tools, addressed by UUID or name.
    pub async fn discover_server(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        server_id: &str,
        force_refresh: bool,
    ) -> Result<Vec<McpTool>> {
        let config = self.resolve(user_id, workspace_id, server_id)?;
        if !config.is_active() {
            return Err(McpError::ServerNotFound(server_id.to_string()).into());
        }
        self.discover_server_tools(user_id, workspace_id, &config, force_refresh)
            .await
    }

    async fn discover_server_tools(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        config: &McpServerConfig,
        force_refresh: bool,
    ) -> Result<Vec<McpTool>> {
        if !force_refresh
            && let Some(tools) = self.cache.get(user_id, workspace_id, config.id)
        {
            return Ok(tools);
        }

        let client = self.client_for(config).await?;
        let tools = client.list_tools().await.map_err(BlockflowError::from)?;
        self.cache.put(user_id, workspace_id, config.id, tools.clone());
        Ok(tools)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute one tool call on behalf of a user.
    ///
    /// Arguments are validated against the discovered input schema before
    /// the transport is touched, so malformed calls cost the server nothing.
    pub async fn execute_tool(
        &self,
        user_id: &str,
        call: &McpToolCall,
        workspace_id: Option<&str>,
    ) -> Result<McpToolResult> {
        let config = self.resolve(user_id, workspace_id, &call.server_id)?;
        if !config.is_active() {
            return Err(McpError::ServerNotFound(call.server_id.clone()).into());
        }

        let tools = self
            .discover_server_tools(user_id, workspace_id, &config, false)
            .await?;
        let tool = tools
            .iter()
            .find(|t| t.name == call.tool_name)
            .ok_or_else(|| {
                BlockflowError::tool_not_found(format!(
                    "{} on server {}",
                    call.tool_name, config.name
                ))
            })?;

        validate_arguments(&tool.input_schema, &call.arguments)?;

        let client = self.client_for(&config).await?;
        let result = client
            .call_tool(&call.tool_name, call.arguments.clone())
            .await?;
        Ok(result)
    }

    /// Probe a candidate configuration without persisting anything.
    ///
    /// The probe policy's zero execution cap guarantees no tool can run, and
    /// the connection is always torn down, success or not.
    pub async fn test_connection(&self, config: McpServerConfig) -> TestConnectionResult {
        if let Err(e) = config.validate() {
            return TestConnectionResult {
                success: false,
                negotiated_version: None,
                tool_count: 0,
                error: Some(e.to_string()),
            };
        }
        if config.transport.is_network()
            && let Err(e) = validate_server_url(config.url.as_deref().unwrap_or(""))
        {
            return TestConnectionResult {
                success: false,
                negotiated_version: None,
                tool_count: 0,
                error: Some(e.to_string()),
            };
        }

        let client = McpClient::new(config, McpSecurityPolicy::probe());
        let outcome = async {
            client.connect().await?;
            client.list_tools().await
        }
        .await;
        let negotiated_version = client.negotiated_version();
        client.disconnect().await;

        match outcome {
            Ok(tools) => TestConnectionResult {
                success: true,
                negotiated_version,
                tool_count: tools.len(),
                error: None,
            },
            Err(e) => TestConnectionResult {
                success: false,
                negotiated_version,
                tool_count: 0,
                error: Some(e.to_string()),
            },
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn visible(record: &ServerRecord, user_id: &str, workspace_id: Option<&str>) -> bool {
        if record.owner != user_id {
            return false;
        }
        match (&record.workspace_id, workspace_id) {
            (None, _) => true,
            (Some(ws), Some(requested)) => ws == requested,
            (Some(_), None) => false,
        }
    }

    fn active_servers(&self, user_id: &str, workspace_id: Option<&str>) -> Vec<McpServerConfig> {
        self.servers
            .iter()
            .filter(|record| Self::visible(record.value(), user_id, workspace_id))
            .filter(|record| record.config.is_active())
            .map(|record| record.config.clone())
            .collect()
    }

    /// Resolve a string server id (UUID, or server name as a fallback for
    /// ids that predate UUID addressing) to the user's config.
    fn resolve(
        &self,
        user_id: &str,
        workspace_id: Option<&str>,
        server_id: &str,
    ) -> Result<McpServerConfig> {
        if let Ok(id) = Uuid::parse_str(server_id)
            && let Some(record) = self.servers.get(&id)
            && Self::visible(record.value(), user_id, workspace_id)
        {
            return Ok(record.config.clone());
        }

        self.servers
            .iter()
            .filter(|record| Self::visible(record.value(), user_id, workspace_id))
            .find(|record| record.config.name == server_id)
            .map(|record| record.config.clone())
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()).into())
    }

    /// Owner-only resolution, ignoring workspace scoping. Used for
    /// mutations, which only the registering user may perform.
    fn resolve_owned(&self, user_id: &str, server_id: &str) -> Result<McpServerConfig> {
        if let Ok(id) = Uuid::parse_str(server_id)
            && let Some(record) = self.servers.get(&id)
            && record.owner == user_id
        {
            return Ok(record.config.clone());
        }

        self.servers
            .iter()
            .filter(|record| record.owner == user_id)
            .find(|record| record.config.name == server_id)
            .map(|record| record.config.clone())
            .ok_or_else(|| McpError::ServerNotFound(server_id.to_string()).into())
    }

    async fn client_for(&self, config: &McpServerConfig) -> Result<Arc<McpClient>> {
        if let Some(client) = self.clients.get(&config.id)
            && client.state() == ConnectionState::Connected
        {
            return Ok(client.clone());
        }

        let client = Arc::new(McpClient::new(
            config.clone(),
            McpSecurityPolicy::production(self.max_tool_executions_per_hour),
        ));
        // Service-level execution only happens on an explicit user call,
        // which is the consent the production policy requires.
        client.grant_consent();
        client.connect().await?;
        self.clients.insert(config.id, client.clone());
        Ok(client)
    }

    async fn drop_client(&self, server_id: Uuid) {
        if let Some((_, client)) = self.clients.remove(&server_id) {
            client.disconnect().await;
        }
    }
}

impl Default for McpService {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate tool-call arguments against the discovered input schema.
///
/// Checks required properties and primitive type agreement; anything the
/// schema does not describe passes through untouched.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<()> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    let empty = serde_json::Map::new();
    let args = match arguments {
        Value::Object(map) => map,
        Value::Null => &empty,
        other => {
            return Err(BlockflowError::invalid_arguments(format!(
                "arguments must be an object, got {}",
                type_name(other)
            )));
        }
    };

    if let Some(required) = schema_obj.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !args.contains_key(name) {
                return Err(BlockflowError::invalid_arguments(format!(
                    "missing required argument '{name}'"
                )));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(|v| v.as_object()) {
        for (name, value) in args {
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(BlockflowError::invalid_arguments(format!(
                    "argument '{name}' must be of type {expected}, got {}",
                    type_name(value)
                )));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        // Unknown schema types are not enforced.
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
