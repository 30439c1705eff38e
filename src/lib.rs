//! Blockflow - visual workflow compilation and execution runtime
//!
//! This library turns an editable block graph (blocks, edges, loop and
//! parallel containers) into a versioned execution IR and runs it:
//! - A serializer that extracts, canonicalizes, and validates block
//!   parameters into [`model::SerializedWorkflow`]
//! - A handler registry that dispatches each block to the right executor,
//!   with a generic tool-backed fallback
//! - An MCP integration layer: per-server JSON-RPC clients, a discovery
//!   cache, security policy, and an HTTP management API
//! - A streaming pipeline with block separators, cost aggregation, and a
//!   run trace
//! - Signed webhook delivery with a fixed retry ladder
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use blockflow::blocks::BlockRegistry;
//! use blockflow::serializer::Serializer;
//!
//! # fn main() -> blockflow::Result<()> {
//! let registry = Arc::new(BlockRegistry::with_builtins());
//! let serializer = Serializer::new(registry);
//! let workflow = serializer.serialize(&[], &[], &HashMap::new(), &HashMap::new(), true)?;
//! assert_eq!(workflow.version, blockflow::constants::WORKFLOW_VERSION);
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod constants;
pub mod error;
pub mod model;

// Compilation
pub mod blocks;
pub mod serializer;

// Execution
pub mod engine;
pub mod handlers;
pub mod stream;
pub mod tools;

// Integrations
pub mod mcp;
pub mod webhook;

// Infrastructure
pub mod config;
pub mod http;

// Re-exports for convenience
pub use engine::{Engine, ExecutionContext, ExecutionResult};
pub use error::{BlockflowError, Result};
pub use model::{BlockState, Edge, SerializedBlock, SerializedWorkflow};

/// Initialize logging for the application
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "blockflow=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
