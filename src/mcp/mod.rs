//! MCP (Model Context Protocol) integration layer
//!
//! [`client`] owns a single server connection: transport, version
//! negotiation, timeouts, retries, and the per-connection security policy.
//! [`service`] is the process-wide façade the handler registry and the HTTP
//! surface talk to: server registry, discovery cache, argument validation,
//! and fan-out refresh. [`url`] is the shared URL security boundary.

pub mod client;
pub mod service;
pub mod url;

pub use client::{AuditLevel, ConnectionState, McpClient, McpSecurityPolicy};
pub use service::{
    DiscoveryCache, McpService, RefreshSummary, RefreshTotals, TestConnectionResult,
};
pub use url::validate_server_url;
