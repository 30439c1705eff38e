//! HTTP API server
//!
//! REST surface for MCP server management, tool discovery, and tool
//! execution. Caller identity arrives in the `x-user-id` header and
//! optional workspace scoping in `x-workspace-id`; every MCP route
//! requires an identified caller.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    LatencyUnit,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::config::Config;
use crate::error::{BlockflowError, DeliveryError, McpError, Result};
use crate::mcp::McpService;
use crate::model::{McpServerConfig, McpToolCall};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub mcp: Arc<McpService>,
}

/// Error wrapper translating crate errors into sanitized HTTP responses
#[derive(Debug)]
pub struct AppError(BlockflowError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self.0 {
            BlockflowError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            BlockflowError::InvalidArguments(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_arguments", msg.clone())
            }
            BlockflowError::ToolNotFound(msg) => {
                (StatusCode::NOT_FOUND, "tool_not_found", msg.clone())
            }
            BlockflowError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, "auth_error", msg.clone())
            }
            BlockflowError::Config(msg) => {
                (StatusCode::BAD_REQUEST, "config_error", msg.clone())
            }
            BlockflowError::Mcp(mcp) => match mcp {
                McpError::ServerNotFound(id) => (
                    StatusCode::NOT_FOUND,
                    "server_not_found",
                    format!("server not found: {id}"),
                ),
                McpError::InvalidUrl(msg) => {
                    (StatusCode::BAD_REQUEST, "invalid_url", msg.clone())
                }
                McpError::Timeout(ms) => (
                    StatusCode::REQUEST_TIMEOUT,
                    "timeout",
                    format!("tool execution timed out after {ms}ms"),
                ),
                McpError::RateLimited(max) => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    format!("rate limit exceeded: {max} executions per hour"),
                ),
                McpError::ConsentRequired(server) => (
                    StatusCode::UNAUTHORIZED,
                    "consent_required",
                    format!("user consent required for tool execution on {server}"),
                ),
                _ => {
                    tracing::error!("MCP error: {:?}", mcp);
                    (
                        StatusCode::BAD_GATEWAY,
                        "mcp_error",
                        "an upstream MCP error occurred".to_string(),
                    )
                }
            },
            BlockflowError::Delivery(e) => match e {
                DeliveryError::Failed { status, .. } => (
                    StatusCode::BAD_GATEWAY,
                    "delivery_error",
                    format!("webhook receiver responded {status}"),
                ),
                _ => {
                    tracing::error!("Delivery error: {:?}", e);
                    (
                        StatusCode::BAD_GATEWAY,
                        "delivery_error",
                        "webhook delivery failed".to_string(),
                    )
                }
            },
            BlockflowError::BlockExecution { block_id, message } => {
                tracing::error!("Block execution failed: {} - {}", block_id, message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "execution_error",
                    "a block execution error occurred".to_string(),
                )
            }
            _ => {
                tracing::error!("Internal error: {:?}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "an internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": {
                "type": error_type,
                "message": message,
                "status": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<BlockflowError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Caller identity, pulled from request headers
struct Caller {
    user_id: String,
    workspace_id: Option<String>,
}

fn caller(headers: &HeaderMap) -> Result<Caller> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| BlockflowError::unauthorized("missing x-user-id header"))?
        .to_string();
    let workspace_id = headers
        .get("x-workspace-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    Ok(Caller {
        user_id,
        workspace_id,
    })
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    let http_config = config.http();
    let mcp_config = config.mcp();

    let mcp = Arc::new(
        McpService::with_cache(Arc::new(crate::mcp::DiscoveryCache::new(
            std::time::Duration::from_secs(mcp_config.discovery_ttl_secs),
        )))
        .with_rate_limit(mcp_config.max_tool_executions_per_hour),
    );
    let state = AppState { mcp };

    let app = build_router(state);

    let addr = format!("{}:{}", http_config.host, http_config.port);
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| BlockflowError::config(format!("invalid address {addr}: {e}")))?;

    tracing::info!("Starting HTTP server on {}", socket_addr);

    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| BlockflowError::config(format!("server error: {e}")))?;

    Ok(())
}

/// Build the router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/mcp/servers", get(list_servers).post(create_server))
        .route(
            "/api/mcp/servers/{id}",
            get(get_server).patch(update_server).delete(delete_server),
        )
        .route("/api/mcp/tools", get(discover_tools))
        .route("/api/mcp/tools/refresh", post(refresh_tools))
        .route("/api/mcp/execute", post(execute_tool))
        .route("/api/mcp/test-connection", post(test_connection))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new())
                        .on_response(
                            DefaultOnResponse::new()
                                .level(tracing::Level::INFO)
                                .latency_unit(LatencyUnit::Micros),
                        ),
                )
                .layer(CorsLayer::permissive()),
        )
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// MCP server management
// ---------------------------------------------------------------------------

async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let caller = caller(&headers)?;
    let servers = state
        .mcp
        .list_servers(&caller.user_id, caller.workspace_id.as_deref());
    Ok(Json(json!({ "servers": servers })))
}

async fn create_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<McpServerConfig>,
) -> std::result::Result<Response, AppError> {
    let caller = caller(&headers)?;
    let created = state
        .mcp
        .create_server(&caller.user_id, caller.workspace_id.as_deref(), config)?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn get_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> std::result::Result<Json<McpServerConfig>, AppError> {
    let caller = caller(&headers)?;
    Ok(Json(state.mcp.get_server(&caller.user_id, &id)?))
}

async fn update_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
    Json(config): Json<McpServerConfig>,
) -> std::result::Result<Json<McpServerConfig>, AppError> {
    let caller = caller(&headers)?;
    Ok(Json(
        state.mcp.update_server(&caller.user_id, &id, config).await?,
    ))
}

async fn delete_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    AxumPath(id): AxumPath<String>,
) -> std::result::Result<StatusCode, AppError> {
    let caller = caller(&headers)?;
    state.mcp.delete_server(&caller.user_id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Discovery and execution
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DiscoverQuery {
    #[serde(default)]
    refresh: bool,
    #[serde(rename = "serverId")]
    server_id: Option<String>,
    #[serde(rename = "workspaceId")]
    workspace_id: Option<String>,
}

async fn discover_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DiscoverQuery>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let caller = caller(&headers)?;
    // A query-string workspace narrows the header-derived scope.
    let workspace = query
        .workspace_id
        .as_deref()
        .or(caller.workspace_id.as_deref());

    let tools = match query.server_id.as_deref() {
        Some(server_id) => {
            state
                .mcp
                .discover_server(&caller.user_id, workspace, server_id, query.refresh)
                .await?
        }
        None => {
            state
                .mcp
                .discover_tools(&caller.user_id, workspace, query.refresh)
                .await
        }
    };

    let mut by_server: BTreeMap<String, usize> = BTreeMap::new();
    for tool in &tools {
        *by_server.entry(tool.server_id.to_string()).or_insert(0) += 1;
    }
    Ok(Json(json!({
        "tools": tools,
        "totalCount": tools.len(),
        "byServer": by_server,
    })))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    #[serde(rename = "serverIds")]
    server_ids: Option<Vec<String>>,
}

async fn refresh_tools(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RefreshRequest>,
) -> std::result::Result<Json<crate::mcp::RefreshSummary>, AppError> {
    let caller = caller(&headers)?;
    let summary = state
        .mcp
        .refresh_servers(
            &caller.user_id,
            caller.workspace_id.as_deref(),
            request.server_ids.as_deref(),
        )
        .await;
    Ok(Json(summary))
}

async fn execute_tool(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(call): Json<McpToolCall>,
) -> std::result::Result<Json<serde_json::Value>, AppError> {
    let caller = caller(&headers)?;
    let result = state
        .mcp
        .execute_tool(&caller.user_id, &call, caller.workspace_id.as_deref())
        .await?;
    Ok(Json(json!({
        "success": !result.is_error,
        "output": result.text(),
        "content": result.content,
    })))
}

async fn test_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<McpServerConfig>,
) -> std::result::Result<Json<crate::mcp::TestConnectionResult>, AppError> {
    // Probes still require an identified caller, though nothing persists.
    let _ = caller(&headers)?;
    Ok(Json(state.mcp.test_connection(config).await))
}
