//! Workflow serializer
//!
//! Pure transformation from editable block/edge/subflow state into the
//! versioned execution IR, and the structural inverse. No I/O.
//!
//! Compilation per block:
//! 1. subflow containers pass their raw configuration through untouched
//! 2. parameters are extracted left-to-right, skipping fields whose
//!    visibility condition does not hold, applying defaults to empty entries
//! 3. canonical parameter groups collapse to a single winning value
//! 4. the concrete tool id is resolved (static list or selector function)
//! 5. required user-supplied fields are checked against the mapped params
//! 6. static input declarations and augmented outputs are emitted

use crate::blocks::{BlockConfig, BlockRegistry, CanonicalRole};
use crate::constants::*;
use crate::model::*;
use crate::{BlockflowError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Compiles editable state into the execution IR
pub struct Serializer {
    registry: Arc<BlockRegistry>,
}

impl Serializer {
    pub fn new(registry: Arc<BlockRegistry>) -> Self {
        Self { registry }
    }

    /// Compile editable state into a [`SerializedWorkflow`]
    ///
    /// With `validate` set, fails with a validation error listing every
    /// missing required user-supplied field. Trigger blocks are exempt from
    /// both validation and parameter mapping.
    pub fn serialize(
        &self,
        blocks: &[BlockState],
        edges: &[Edge],
        loops: &HashMap<String, LoopDescriptor>,
        parallels: &HashMap<String, ParallelDescriptor>,
        validate: bool,
    ) -> Result<SerializedWorkflow> {
        self.check_graph_invariants(blocks, edges, loops, parallels)?;

        let mut serialized = Vec::with_capacity(blocks.len());
        let mut missing: Vec<String> = Vec::new();

        for block in blocks {
            let config = self.registry.get(&block.block_type).ok_or_else(|| {
                BlockflowError::validation(format!("unknown block type: {}", block.block_type))
            })?;

            let node = self.serialize_block(block, &config, validate, &mut missing)?;
            serialized.push(node);
        }

        if validate && !missing.is_empty() {
            return Err(BlockflowError::validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let connections = edges
            .iter()
            .map(|edge| SerializedConnection {
                source: edge.source.clone(),
                target: edge.target.clone(),
                source_handle: edge.source_handle.clone(),
                target_handle: edge.target_handle.clone(),
            })
            .collect();

        Ok(SerializedWorkflow {
            version: WORKFLOW_VERSION.to_string(),
            blocks: serialized,
            connections,
            loops: loops.clone(),
            parallels: parallels.clone(),
        })
    }

    /// Structural inverse: IR back to editable block state and edges
    ///
    /// Per-field values are seeded from `config.params`; connections regain
    /// generated identifiers.
    pub fn deserialize(
        &self,
        workflow: &SerializedWorkflow,
    ) -> Result<(Vec<BlockState>, Vec<Edge>)> {
        let blocks = workflow
            .blocks
            .iter()
            .map(|node| {
                let sub_blocks = node
                    .config
                    .params
                    .iter()
                    .map(|(key, value)| {
                        (
                            key.clone(),
                            SubBlockState {
                                value: Some(value.clone()),
                                kind: None,
                            },
                        )
                    })
                    .collect();

                BlockState {
                    id: node.id.clone(),
                    block_type: node.metadata.id.clone(),
                    name: node.metadata.name.clone().unwrap_or_default(),
                    position: node.position,
                    sub_blocks,
                    enabled: node.enabled,
                    advanced_mode: false,
                    trigger_mode: false,
                }
            })
            .collect();

        let edges = workflow
            .connections
            .iter()
            .map(|conn| Edge {
                id: Uuid::new_v4().to_string(),
                source: conn.source.clone(),
                target: conn.target.clone(),
                source_handle: conn.source_handle.clone(),
                target_handle: conn.target_handle.clone(),
            })
            .collect();

        Ok((blocks, edges))
    }

    fn serialize_block(
        &self,
        block: &BlockState,
        config: &BlockConfig,
        validate: bool,
        missing: &mut Vec<String>,
    ) -> Result<SerializedBlock> {
        let metadata = SerializedBlockMetadata {
            id: config.block_type.clone(),
            name: Some(if block.name.is_empty() {
                config.name.clone()
            } else {
                block.name.clone()
            }),
            category: Some(config.category.clone()),
        };

        // Pure control-flow containers carry no tool and pass raw config through
        if config.is_container() {
            return Ok(SerializedBlock {
                id: block.id.clone(),
                position: block.position,
                config: SerializedBlockConfig {
                    tool: String::new(),
                    params: raw_params(block),
                },
                inputs: HashMap::new(),
                outputs: HashMap::new(),
                metadata,
                enabled: block.enabled,
            });
        }

        // Trigger blocks are exempt from parameter mapping and validation
        let is_trigger = block.trigger_mode || config.category == BLOCK_CATEGORY_TRIGGERS;
        if is_trigger {
            return Ok(SerializedBlock {
                id: block.id.clone(),
                position: block.position,
                config: SerializedBlockConfig {
                    tool: String::new(),
                    params: raw_params(block),
                },
                inputs: config.inputs.clone(),
                outputs: config.outputs.clone(),
                metadata,
                enabled: block.enabled,
            });
        }

        let extracted = extract_params(block, config);
        let params = canonicalize(extracted, block, config);
        let tool = self.resolve_tool(block, config, &params);

        if validate {
            for sub in &config.sub_blocks {
                if !(sub.required && sub.user_only) {
                    continue;
                }
                // Validation runs on the mapped params: the canonical key,
                // not the raw field id, is what must be populated
                let key = sub
                    .canonical
                    .as_ref()
                    .map(|c| c.group.as_str())
                    .unwrap_or(sub.id.as_str());
                if params.get(key).is_none_or(is_empty_value) {
                    missing.push(format!("{}: {}", metadata.name.as_deref().unwrap_or(""), key));
                }
            }
        }

        let mut outputs = config.outputs.clone();
        if let Some(format) = params.get("responseFormat")
            && let Some(parsed) = parse_response_format(format)
        {
            outputs.insert("responseFormat".to_string(), parsed);
        }

        Ok(SerializedBlock {
            id: block.id.clone(),
            position: block.position,
            config: SerializedBlockConfig { tool, params },
            inputs: config.inputs.clone(),
            outputs,
            metadata,
            enabled: block.enabled,
        })
    }

    /// Resolve the concrete tool id for a block
    ///
    /// Selector failures fall back to the first statically declared tool;
    /// the substitution is logged so it stays distinguishable from success.
    fn resolve_tool(
        &self,
        block: &BlockState,
        config: &BlockConfig,
        params: &HashMap<String, Value>,
    ) -> String {
        if let Some(select) = config.tools.select {
            match select(params) {
                Ok(tool) => return tool,
                Err(e) => {
                    let fallback = config.tools.access.first().cloned().unwrap_or_default();
                    tracing::warn!(
                        block_id = %block.id,
                        block_type = %config.block_type,
                        error = %e,
                        fallback = %fallback,
                        "tool selector failed, substituting first declared tool"
                    );
                    return fallback;
                }
            }
        }
        config.tools.access.first().cloned().unwrap_or_default()
    }

    fn check_graph_invariants(
        &self,
        blocks: &[BlockState],
        edges: &[Edge],
        loops: &HashMap<String, LoopDescriptor>,
        parallels: &HashMap<String, ParallelDescriptor>,
    ) -> Result<()> {
        let ids: std::collections::HashSet<&str> =
            blocks.iter().map(|b| b.id.as_str()).collect();

        for edge in edges {
            if !ids.contains(edge.source.as_str()) {
                return Err(BlockflowError::validation(format!(
                    "connection references unknown source block: {}",
                    edge.source
                )));
            }
            if !ids.contains(edge.target.as_str()) {
                return Err(BlockflowError::validation(format!(
                    "connection references unknown target block: {}",
                    edge.target
                )));
            }
        }

        // No block may belong to more than one subflow container
        let mut membership: HashMap<&str, &str> = HashMap::new();
        let containers = loops
            .values()
            .map(|l| (l.id.as_str(), &l.nodes))
            .chain(parallels.values().map(|p| (p.id.as_str(), &p.nodes)));
        for (container_id, nodes) in containers {
            for node in nodes {
                if let Some(other) = membership.insert(node.as_str(), container_id) {
                    return Err(BlockflowError::validation(format!(
                        "block {} belongs to multiple subflow containers ({} and {})",
                        node, other, container_id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Raw field id -> value map, no condition or canonical handling
fn raw_params(block: &BlockState) -> HashMap<String, Value> {
    block
        .sub_blocks
        .iter()
        .filter_map(|(id, sub)| sub.value.clone().map(|v| (id.clone(), v)))
        .collect()
}

/// Extract a flat parameter map from sub-fields in schema order
///
/// Conditions are evaluated left-to-right against already-extracted fields,
/// so a condition referencing a later field never holds.
fn extract_params(block: &BlockState, config: &BlockConfig) -> HashMap<String, Value> {
    let mut params = HashMap::new();

    for sub in &config.sub_blocks {
        if let Some(ref condition) = sub.condition
            && !condition.holds(&params)
        {
            continue;
        }

        let value = block
            .sub_blocks
            .get(&sub.id)
            .and_then(|s| s.value.clone())
            .filter(|v| !is_empty_value(v));

        match (value, sub.default_value) {
            (Some(v), _) => {
                params.insert(sub.id.clone(), v);
            }
            (None, Some(default)) => {
                params.insert(sub.id.clone(), default());
            }
            (None, None) => {}
        }
    }

    params
}

/// Collapse canonical parameter groups to a single winning value
///
/// With both a basic and a non-empty advanced value present, advanced wins
/// when the block is in advanced mode, basic otherwise. Only the canonical
/// key survives; all source keys are deleted.
fn canonicalize(
    mut params: HashMap<String, Value>,
    block: &BlockState,
    config: &BlockConfig,
) -> HashMap<String, Value> {
    // group -> (basic value, first non-empty advanced value)
    let mut groups: HashMap<String, (Option<Value>, Option<Value>)> = HashMap::new();
    let mut source_keys: Vec<String> = Vec::new();

    for sub in &config.sub_blocks {
        let Some(ref canonical) = sub.canonical else {
            continue;
        };
        source_keys.push(sub.id.clone());
        let entry = groups.entry(canonical.group.clone()).or_default();
        let value = params.get(&sub.id).filter(|v| !is_empty_value(v)).cloned();
        match canonical.role {
            CanonicalRole::Basic => {
                if entry.0.is_none() {
                    entry.0 = value;
                }
            }
            CanonicalRole::Advanced => {
                if entry.1.is_none() {
                    entry.1 = value;
                }
            }
        }
    }

    for key in source_keys {
        params.remove(&key);
    }

    for (group, (basic, advanced)) in groups {
        let winner = match (basic, advanced) {
            (Some(b), Some(a)) => Some(if block.advanced_mode { a } else { b }),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        if let Some(value) = winner {
            params.insert(group, value);
        }
    }

    params
}

/// Parse a response-format value: a variable reference or JSON
///
/// Unparseable values are dropped rather than propagated so malformed
/// structures never poison downstream consumers.
fn parse_response_format(value: &Value) -> Option<Value> {
    match value {
        Value::Object(_) | Value::Array(_) => Some(value.clone()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            // Variable references like <start.input> are carried verbatim
            if trimmed.starts_with('<') && trimmed.ends_with('>') && trimmed.len() > 2 {
                return Some(Value::String(trimmed.to_string()));
            }
            serde_json::from_str(trimmed).ok()
        }
        _ => None,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod serializer_test;
