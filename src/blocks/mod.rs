//! Block type registry
//!
//! Every block type the editor can place is described by a [`BlockConfig`]:
//! its sub-block fields (with visibility conditions, defaults and canonical
//! parameter groups), the tools it can resolve to, and its static input and
//! output declarations. The serializer and the handler registry both consult
//! this registry; it is the single source of block metadata.

use crate::constants::*;
use dashmap::DashMap;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Which side of a canonical parameter group a field feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalRole {
    Basic,
    Advanced,
}

/// Membership of a field in a canonical parameter group
///
/// Exactly one value per group survives compilation under the canonical key;
/// all source keys are removed afterward.
#[derive(Debug, Clone)]
pub struct CanonicalParam {
    /// Canonical key the winning value is stored under
    pub group: String,
    pub role: CanonicalRole,
}

/// Visibility condition over already-extracted fields
///
/// Evaluated left-to-right during parameter extraction; an optional second
/// condition is AND-ed with the first. `value` may be a scalar or an array
/// (match-any); `not` inverts the comparison.
#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub field: String,
    pub value: Value,
    pub not: bool,
    pub and: Option<Box<FieldCondition>>,
}

impl FieldCondition {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
            not: false,
            and: None,
        }
    }

    /// Evaluate against extracted params; missing fields never match
    pub fn holds(&self, params: &HashMap<String, Value>) -> bool {
        let actual = params.get(&self.field);
        let matched = match (actual, &self.value) {
            (Some(actual), Value::Array(options)) => options.iter().any(|v| v == actual),
            (Some(actual), expected) => actual == expected,
            (None, _) => false,
        };
        let first = if self.not { !matched } else { matched };
        match &self.and {
            Some(and) => first && and.holds(params),
            None => first,
        }
    }
}

/// Schema for one sub-block field
#[derive(Clone)]
pub struct SubBlockConfig {
    pub id: String,

    /// Required for execution when set; checked post-mapping during compile
    pub required: bool,

    /// Only user-suppliable (cannot be satisfied by upstream block outputs);
    /// validation is restricted to fields that are both required and user-only
    pub user_only: bool,

    /// Visibility condition; a field whose condition does not hold is skipped
    pub condition: Option<FieldCondition>,

    /// Default applied when extraction finds the field empty
    pub default_value: Option<fn() -> Value>,

    /// Canonical parameter group membership
    pub canonical: Option<CanonicalParam>,
}

impl SubBlockConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: false,
            user_only: false,
            condition: None,
            default_value: None,
            canonical: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self.user_only = true;
        self
    }

    pub fn condition(mut self, condition: FieldCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn default_value(mut self, default: fn() -> Value) -> Self {
        self.default_value = Some(default);
        self
    }

    pub fn canonical(mut self, group: impl Into<String>, role: CanonicalRole) -> Self {
        self.canonical = Some(CanonicalParam {
            group: group.into(),
            role,
        });
        self
    }
}

/// Tool selection for a block type
///
/// `access` statically declares the tools a block may resolve to; `select`
/// optionally picks one based on the canonicalized parameters. Selector
/// failures fall back to the first access entry with a logged warning.
#[derive(Clone, Default)]
pub struct BlockTools {
    pub access: Vec<String>,
    pub select: Option<fn(&HashMap<String, Value>) -> Result<String, String>>,
}

/// Block-specific transform applied to params before tool invocation
pub type ParamTransform =
    fn(HashMap<String, Value>) -> Result<HashMap<String, Value>, String>;

/// Complete schema for one block type
#[derive(Clone)]
pub struct BlockConfig {
    pub block_type: String,
    pub name: String,
    pub category: String,
    pub sub_blocks: Vec<SubBlockConfig>,
    pub tools: BlockTools,

    /// Static input type declarations emitted onto the IR node
    pub inputs: HashMap<String, Value>,

    /// Output declarations carried onto the IR node
    pub outputs: HashMap<String, Value>,

    /// Optional transform applied by the generic handler before dispatch
    pub param_transform: Option<ParamTransform>,
}

impl BlockConfig {
    /// Whether this block is a pure control-flow container
    pub fn is_container(&self) -> bool {
        self.block_type == BLOCK_TYPE_LOOP || self.block_type == BLOCK_TYPE_PARALLEL
    }
}

/// Registry of block type schemas - uses DashMap for lock-free concurrent access
pub struct BlockRegistry {
    configs: Arc<DashMap<String, Arc<BlockConfig>>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            configs: Arc::new(DashMap::new()),
        }
    }

    /// Create a registry preloaded with the built-in block types
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for config in builtin_blocks() {
            registry.register(config);
        }
        registry
    }

    pub fn register(&self, config: BlockConfig) {
        self.configs
            .insert(config.block_type.clone(), Arc::new(config));
    }

    pub fn get(&self, block_type: &str) -> Option<Arc<BlockConfig>> {
        self.configs.get(block_type).map(|entry| Arc::clone(&*entry))
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ============================================================================
// BUILT-IN BLOCK TYPES
// ============================================================================

fn builtin_blocks() -> Vec<BlockConfig> {
    vec![
        starter_block(),
        agent_block(),
        api_block(),
        function_block(),
        knowledge_block(),
        mcp_block(),
        loop_block(),
        parallel_block(),
    ]
}

fn starter_block() -> BlockConfig {
    BlockConfig {
        block_type: BLOCK_TYPE_STARTER.to_string(),
        name: "Starter".to_string(),
        category: BLOCK_CATEGORY_TRIGGERS.to_string(),
        sub_blocks: vec![SubBlockConfig::new("input")],
        tools: BlockTools::default(),
        inputs: HashMap::new(),
        outputs: HashMap::from([("input".to_string(), json!("any"))]),
        param_transform: None,
    }
}

fn agent_block() -> BlockConfig {
    BlockConfig {
        block_type: "agent".to_string(),
        name: "Agent".to_string(),
        category: "blocks".to_string(),
        sub_blocks: vec![
            SubBlockConfig::new("model").required(),
            // systemPrompt (basic) and messages (advanced) feed one canonical
            // group; precedence depends on the block's advanced mode
            SubBlockConfig::new("systemPrompt").canonical("systemPrompt", CanonicalRole::Basic),
            SubBlockConfig::new("messages").canonical("systemPrompt", CanonicalRole::Advanced),
            SubBlockConfig::new("temperature").default_value(|| json!(0.7)),
            SubBlockConfig::new("apiKey").required(),
            SubBlockConfig::new("responseFormat"),
            SubBlockConfig::new("azureEndpoint")
                .condition(FieldCondition::eq("model", json!("azure-openai"))),
        ],
        tools: BlockTools {
            access: vec![
                "openai_chat".to_string(),
                "anthropic_chat".to_string(),
                "azure_openai_chat".to_string(),
            ],
            select: Some(select_agent_tool),
        },
        inputs: HashMap::from([
            ("model".to_string(), json!("string")),
            ("systemPrompt".to_string(), json!("string")),
            ("temperature".to_string(), json!("number")),
        ]),
        outputs: HashMap::from([
            ("content".to_string(), json!("string")),
            ("model".to_string(), json!("string")),
            ("tokens".to_string(), json!("any")),
        ]),
        param_transform: None,
    }
}

fn select_agent_tool(params: &HashMap<String, Value>) -> Result<String, String> {
    let model = params
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "model parameter missing".to_string())?;

    if model.starts_with("claude") {
        Ok("anthropic_chat".to_string())
    } else if model == "azure-openai" {
        Ok("azure_openai_chat".to_string())
    } else if model.starts_with("gpt") || model.starts_with("o") {
        Ok("openai_chat".to_string())
    } else {
        Err(format!("no provider tool for model '{}'", model))
    }
}

fn api_block() -> BlockConfig {
    BlockConfig {
        block_type: "api".to_string(),
        name: "API".to_string(),
        category: "blocks".to_string(),
        sub_blocks: vec![
            SubBlockConfig::new("url").required(),
            SubBlockConfig::new("method").default_value(|| json!("GET")),
            // body (basic) vs rawBody (advanced) canonical group
            SubBlockConfig::new("body").canonical("body", CanonicalRole::Basic),
            SubBlockConfig::new("rawBody").canonical("body", CanonicalRole::Advanced),
            SubBlockConfig::new("headers"),
        ],
        tools: BlockTools {
            access: vec!["http_request".to_string()],
            select: None,
        },
        inputs: HashMap::from([
            ("url".to_string(), json!("string")),
            ("method".to_string(), json!("string")),
            ("body".to_string(), json!("any")),
        ]),
        outputs: HashMap::from([
            ("data".to_string(), json!("any")),
            ("status".to_string(), json!("number")),
        ]),
        param_transform: Some(uppercase_method),
    }
}

fn uppercase_method(mut params: HashMap<String, Value>) -> Result<HashMap<String, Value>, String> {
    if let Some(method) = params.get("method").and_then(|v| v.as_str()) {
        let upper = method.to_uppercase();
        params.insert("method".to_string(), json!(upper));
    }
    Ok(params)
}

fn function_block() -> BlockConfig {
    BlockConfig {
        block_type: "function".to_string(),
        name: "Function".to_string(),
        category: "blocks".to_string(),
        sub_blocks: vec![SubBlockConfig::new("code").required()],
        tools: BlockTools {
            access: vec!["function_execute".to_string()],
            select: None,
        },
        inputs: HashMap::from([("code".to_string(), json!("string"))]),
        outputs: HashMap::from([("result".to_string(), json!("any"))]),
        param_transform: None,
    }
}

fn knowledge_block() -> BlockConfig {
    BlockConfig {
        block_type: "knowledge".to_string(),
        name: "Knowledge".to_string(),
        category: BLOCK_CATEGORY_KNOWLEDGE.to_string(),
        sub_blocks: vec![
            SubBlockConfig::new("query").required(),
            SubBlockConfig::new("topK").default_value(|| json!(10)),
        ],
        tools: BlockTools {
            access: vec!["knowledge_search".to_string()],
            select: None,
        },
        inputs: HashMap::from([("query".to_string(), json!("string"))]),
        outputs: HashMap::from([("results".to_string(), json!("any"))]),
        param_transform: None,
    }
}

fn mcp_block() -> BlockConfig {
    BlockConfig {
        block_type: "mcp".to_string(),
        name: "MCP Tool".to_string(),
        category: "tools".to_string(),
        sub_blocks: vec![
            SubBlockConfig::new("serverId"),
            SubBlockConfig::new("toolName"),
            SubBlockConfig::new("tool"),
            SubBlockConfig::new("arguments"),
        ],
        tools: BlockTools {
            access: vec![],
            select: Some(select_mcp_tool),
        },
        inputs: HashMap::from([("arguments".to_string(), json!("object"))]),
        outputs: HashMap::from([("output".to_string(), json!("any"))]),
        param_transform: None,
    }
}

/// Build the dynamically-namespaced tool id for an MCP node
///
/// Prefers explicit serverId/toolName params; accepts an already-composite
/// `tool` param as-is.
fn select_mcp_tool(params: &HashMap<String, Value>) -> Result<String, String> {
    if let (Some(server_id), Some(tool_name)) = (
        params.get("serverId").and_then(|v| v.as_str()),
        params.get("toolName").and_then(|v| v.as_str()),
    ) {
        return Ok(format!("{}{}-{}", MCP_TOOL_PREFIX, server_id, tool_name));
    }
    if let Some(tool) = params.get("tool").and_then(|v| v.as_str()) {
        if tool.starts_with(MCP_TOOL_PREFIX) {
            return Ok(tool.to_string());
        }
        return Ok(format!("{}{}", MCP_TOOL_PREFIX, tool));
    }
    Err("mcp block missing serverId/toolName".to_string())
}

fn loop_block() -> BlockConfig {
    BlockConfig {
        block_type: BLOCK_TYPE_LOOP.to_string(),
        name: "Loop".to_string(),
        category: "subflows".to_string(),
        sub_blocks: vec![],
        tools: BlockTools::default(),
        inputs: HashMap::new(),
        outputs: HashMap::new(),
        param_transform: None,
    }
}

fn parallel_block() -> BlockConfig {
    BlockConfig {
        block_type: BLOCK_TYPE_PARALLEL.to_string(),
        name: "Parallel".to_string(),
        category: "subflows".to_string(),
        sub_blocks: vec![],
        tools: BlockTools::default(),
        inputs: HashMap::new(),
        outputs: HashMap::new(),
        param_transform: None,
    }
}

#[cfg(test)]
mod blocks_test;
