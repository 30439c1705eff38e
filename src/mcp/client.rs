//! JSON-RPC client for a single MCP server connection.
//!
//! Supports stdio (child process, newline-delimited JSON-RPC) and http/sse
//! transports. Every request runs under the server's configured timeout;
//! timeouts and transport failures are retried up to the configured count,
//! and once attempts are exhausted the connection is torn down and marked
//! errored so a faulted stream is never reused. Tool invocation is gated by
//! the connection's [`McpSecurityPolicy`] before any bytes go on the wire.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::constants::{MCP_CLIENT_NAME, MCP_PROTOCOL_VERSION};
use crate::error::McpError;
use crate::model::{McpServerConfig, McpTool, McpToolResult, McpTransport};

const RATE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: i64,
    method: String,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<i64>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[allow(dead_code)]
    data: Option<Value>,
}

/// How much of each tool invocation gets written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    None,
    Basic,
    Detailed,
}

/// Per-connection execution policy, enforced before the transport is touched
#[derive(Debug, Clone)]
pub struct McpSecurityPolicy {
    /// When set, tool execution is refused until the owner of this client
    /// records the user's consent via [`McpClient::grant_consent`]
    pub require_consent: bool,
    pub audit_level: AuditLevel,
    /// Rolling-hour tool execution cap; zero means no tool may run at all
    pub max_tool_executions_per_hour: u32,
}

impl McpSecurityPolicy {
    /// Policy for regular user-facing connections
    pub fn production(max_tool_executions_per_hour: u32) -> Self {
        Self {
            require_consent: true,
            audit_level: AuditLevel::Basic,
            max_tool_executions_per_hour,
        }
    }

    /// Policy for connectivity probes: handshake and discovery only, the
    /// zero cap guarantees no tool can be invoked through the probe.
    pub fn probe() -> Self {
        Self {
            require_consent: false,
            audit_level: AuditLevel::Detailed,
            max_tool_executions_per_hour: 0,
        }
    }
}

/// Connection lifecycle, observable by the service layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

enum Transport {
    Stdio {
        process: Child,
        stdin: ChildStdin,
        stdout: BufReader<ChildStdout>,
    },
    Http {
        client: reqwest::Client,
        url: String,
        sse: bool,
    },
}

/// A live connection to one MCP server
pub struct McpClient {
    config: McpServerConfig,
    policy: McpSecurityPolicy,
    state: RwLock<ConnectionState>,
    negotiated_version: RwLock<Option<String>>,
    transport: Mutex<Option<Transport>>,
    next_id: AtomicI64,
    executions: SyncMutex<VecDeque<Instant>>,
    consent: AtomicBool,
}

impl McpClient {
    pub fn new(config: McpServerConfig, policy: McpSecurityPolicy) -> Self {
        Self {
            config,
            policy,
            state: RwLock::new(ConnectionState::Disconnected),
            negotiated_version: RwLock::new(None),
            transport: Mutex::new(None),
            next_id: AtomicI64::new(1),
            executions: SyncMutex::new(VecDeque::new()),
            consent: AtomicBool::new(false),
        }
    }

    /// Record the user's consent to run tools over this connection. A
    /// policy with `require_consent` refuses every `call_tool` until then.
    pub fn grant_consent(&self) {
        self.consent.store(true, Ordering::Relaxed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Protocol version the server reported during the handshake
    pub fn negotiated_version(&self) -> Option<String> {
        self.negotiated_version.read().clone()
    }

    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    /// Establish the transport and run the initialize handshake.
    ///
    /// A version mismatch is logged but not fatal; transport or handshake
    /// failures leave the client in the `Error` state with no transport.
    pub async fn connect(&self) -> Result<(), McpError> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        *self.state.write() = ConnectionState::Connecting;

        let result = self.connect_inner().await;
        match &result {
            Ok(()) => *self.state.write() = ConnectionState::Connected,
            Err(e) => {
                tracing::warn!(server = %self.config.name, error = %e, "MCP connect failed");
                *self.transport.lock().await = None;
                *self.state.write() = ConnectionState::Error;
            }
        }
        result
    }

    async fn connect_inner(&self) -> Result<(), McpError> {
        let transport = self.open_transport().await?;
        *self.transport.lock().await = Some(transport);

        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": MCP_CLIENT_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;

        let negotiated = result
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(MCP_PROTOCOL_VERSION)
            .to_string();
        if negotiated != MCP_PROTOCOL_VERSION {
            tracing::warn!(
                server = %self.config.name,
                requested = MCP_PROTOCOL_VERSION,
                negotiated = %negotiated,
                "MCP protocol version mismatch, continuing with server version"
            );
        }
        *self.negotiated_version.write() = Some(negotiated);

        self.notify(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        }))
        .await?;

        Ok(())
    }

    async fn open_transport(&self) -> Result<Transport, McpError> {
        match self.config.transport {
            McpTransport::Stdio => {
                let command = self
                    .config
                    .command
                    .as_deref()
                    .ok_or_else(|| McpError::Transport("stdio transport without command".into()))?;
                let mut cmd = Command::new(command);
                if let Some(ref args) = self.config.args {
                    cmd.args(args);
                }
                if let Some(ref env) = self.config.env {
                    cmd.envs(env);
                }
                cmd.stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true);

                let mut process = cmd.spawn().map_err(|e| {
                    McpError::Transport(format!(
                        "failed to spawn MCP server '{}': {e}",
                        self.config.name
                    ))
                })?;
                let stdin = process
                    .stdin
                    .take()
                    .ok_or_else(|| McpError::Transport("failed to open child stdin".into()))?;
                let stdout = process
                    .stdout
                    .take()
                    .ok_or_else(|| McpError::Transport("failed to open child stdout".into()))?;

                Ok(Transport::Stdio {
                    process,
                    stdin,
                    stdout: BufReader::new(stdout),
                })
            }
            McpTransport::Http | McpTransport::Sse => {
                let url = self
                    .config
                    .url
                    .clone()
                    .ok_or_else(|| McpError::Transport("network transport without url".into()))?;
                // Request cancellation belongs to the timer in `request`;
                // the inner client only bounds connection establishment.
                let mut builder = reqwest::Client::builder()
                    .connect_timeout(Duration::from_millis(self.config.timeout_ms));
                if let Some(ref headers) = self.config.headers {
                    let mut map = reqwest::header::HeaderMap::new();
                    for (k, v) in headers {
                        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
                            .map_err(|e| McpError::Transport(format!("bad header name {k}: {e}")))?;
                        let value = reqwest::header::HeaderValue::from_str(v)
                            .map_err(|e| McpError::Transport(format!("bad header value for {k}: {e}")))?;
                        map.insert(name, value);
                    }
                    builder = builder.default_headers(map);
                }
                let client = builder.build()?;
                Ok(Transport::Http {
                    client,
                    url,
                    sse: self.config.transport == McpTransport::Sse,
                })
            }
        }
    }

    /// Tear the connection down. Stdio children are killed, not waited on.
    pub async fn disconnect(&self) {
        if let Some(Transport::Stdio { mut process, .. }) = self.transport.lock().await.take() {
            let _ = process.kill().await;
        }
        *self.negotiated_version.write() = None;
        *self.state.write() = ConnectionState::Disconnected;
    }

    /// Fetch the server's tool list, tagged with this server's identity.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self.request("tools/list", json!({})).await?;

        let mut tools = Vec::new();
        if let Some(items) = result.get("tools").and_then(|v| v.as_array()) {
            for item in items {
                let Some(name) = item.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                tools.push(McpTool {
                    name: name.to_string(),
                    description: item
                        .get("description")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    server_id: self.config.id,
                    server_name: self.config.name.clone(),
                    input_schema: item.get("inputSchema").cloned().unwrap_or(json!({})),
                });
            }
        }
        Ok(tools)
    }

    /// Invoke a tool. The security policy is checked before the transport
    /// is touched, so a rate-limited call costs the server nothing.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<McpToolResult, McpError> {
        if self.policy.require_consent && !self.consent.load(Ordering::Relaxed) {
            return Err(McpError::ConsentRequired(self.config.name.clone()));
        }
        self.check_rate_limit()?;
        self.audit(tool_name, &arguments);

        let result = self
            .request(
                "tools/call",
                json!({
                    "name": tool_name,
                    "arguments": arguments,
                }),
            )
            .await?;

        serde_json::from_value(result)
            .map_err(|e| McpError::Transport(format!("malformed tool result: {e}")))
    }

    /// Sliding rolling-hour window over successful admissions.
    pub(crate) fn check_rate_limit(&self) -> Result<(), McpError> {
        let max = self.policy.max_tool_executions_per_hour;
        if max == 0 {
            return Err(McpError::RateLimited(0));
        }
        let now = Instant::now();
        let mut window = self.executions.lock();
        while let Some(front) = window.front() {
            if now.duration_since(*front) > RATE_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= max {
            return Err(McpError::RateLimited(max));
        }
        window.push_back(now);
        Ok(())
    }

    fn audit(&self, tool_name: &str, arguments: &Value) {
        match self.policy.audit_level {
            AuditLevel::None => {}
            AuditLevel::Basic => {
                tracing::info!(server = %self.config.name, tool = tool_name, "MCP tool execution");
            }
            AuditLevel::Detailed => {
                tracing::info!(
                    server = %self.config.name,
                    tool = tool_name,
                    arguments = %arguments,
                    "MCP tool execution"
                );
            }
        }
    }

    /// One JSON-RPC request under the configured timeout. Timeouts and
    /// transport errors both count as retryable attempts; the timer owns
    /// cancellation, so an expired attempt's pending read is dropped
    /// immediately and its late response is discarded by id on the next
    /// attempt. Exhausting every attempt faults the connection.
    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut last_err = None;

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                tracing::debug!(
                    server = %self.config.name,
                    method,
                    attempt,
                    "retrying MCP request"
                );
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let request = JsonRpcRequest {
                jsonrpc: "2.0".to_string(),
                id,
                method: method.to_string(),
                params: params.clone(),
            };

            let outcome = tokio::time::timeout(timeout, self.send_request(&request)).await;
            match outcome {
                Err(_) => last_err = Some(McpError::Timeout(self.config.timeout_ms)),
                Ok(Ok(response)) => {
                    if let Some(error) = response.error {
                        return Err(McpError::Protocol {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return response.result.ok_or_else(|| {
                        McpError::Transport(format!("empty result for {method}"))
                    });
                }
                Ok(Err(e)) => last_err = Some(e),
            }
        }

        self.fault().await;
        Err(last_err.unwrap_or_else(|| McpError::Transport("request failed".into())))
    }

    /// Tear down a faulted connection: the transport is dropped (killing a
    /// stdio child) and the state machine moves to `Error`, so the pool
    /// opens a fresh connection instead of reusing a broken stream.
    async fn fault(&self) {
        if let Some(Transport::Stdio { mut process, .. }) = self.transport.lock().await.take() {
            let _ = process.kill().await;
        }
        *self.state.write() = ConnectionState::Error;
    }

    async fn send_request(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, McpError> {
        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("not connected".into()))?;

        match transport {
            Transport::Stdio { stdin, stdout, .. } => {
                let line = serde_json::to_string(request)
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                stdin
                    .write_all(b"\n")
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;

                // The stream may still carry the late answer to a request
                // whose timer already expired, plus server-initiated
                // notifications; read until the id matches this request.
                loop {
                    let mut response_line = String::new();
                    let n = stdout
                        .read_line(&mut response_line)
                        .await
                        .map_err(|e| McpError::Transport(e.to_string()))?;
                    if n == 0 {
                        return Err(McpError::Transport("server closed stdout".into()));
                    }
                    let response: JsonRpcResponse = match serde_json::from_str(&response_line) {
                        Ok(response) => response,
                        Err(e) => {
                            tracing::debug!(
                                server = %self.config.name,
                                error = %e,
                                "skipping non-response line on stdio"
                            );
                            continue;
                        }
                    };
                    if response.id != Some(request.id) {
                        tracing::debug!(
                            server = %self.config.name,
                            got = ?response.id,
                            want = request.id,
                            "discarding response for a superseded request"
                        );
                        continue;
                    }
                    return Ok(response);
                }
            }
            Transport::Http { client, url, sse } => {
                let mut req = client.post(url.as_str()).json(request);
                if *sse {
                    req = req.header("accept", "text/event-stream, application/json");
                }
                let response = req.send().await?;
                let status = response.status();
                let body = response.text().await?;
                if !status.is_success() {
                    return Err(McpError::Transport(format!(
                        "server returned {status}: {body}"
                    )));
                }
                let payload = extract_sse_data(&body).unwrap_or(&body);
                serde_json::from_str(payload)
                    .map_err(|e| McpError::Transport(format!("malformed response: {e}")))
            }
        }
    }

    async fn notify(&self, notification: Value) -> Result<(), McpError> {
        let mut guard = self.transport.lock().await;
        let transport = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("not connected".into()))?;

        match transport {
            Transport::Stdio { stdin, .. } => {
                let line = serde_json::to_string(&notification)
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                stdin
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                stdin
                    .write_all(b"\n")
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                stdin
                    .flush()
                    .await
                    .map_err(|e| McpError::Transport(e.to_string()))?;
                Ok(())
            }
            Transport::Http { client, url, .. } => {
                // Notifications carry no id and expect no response body.
                client.post(url.as_str()).json(&notification).send().await?;
                Ok(())
            }
        }
    }
}

/// Pull the JSON payload out of an `event-stream` body, if it is one.
pub(super) fn extract_sse_data(body: &str) -> Option<&str> {
    body.lines()
        .find_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
}
