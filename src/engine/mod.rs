//! Execution engine for serialized workflows
//!
//! Walks the IR in dependency order, dispatches each node through the
//! handler registry, and accumulates block logs. Independent nodes execute
//! concurrently as cooperative tasks; logs are appended in completion order.
//!
//! Node-level failures are captured into that node's log and do not abort
//! sibling branches; only their downstream dependents are skipped. Partial
//! success is a first-class outcome.

pub mod context;

use crate::constants::*;
use crate::handlers::HandlerRegistry;
use crate::model::*;
use crate::stream::{self, StreamEvent};
use crate::{BlockflowError, Result};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

pub use context::ExecutionContext;

/// Result of a workflow execution
///
/// `success` means the run itself completed (no fatal engine error);
/// individual node failures remain visible in `logs` and `spans`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub success: bool,
    pub output: Value,
    pub logs: Vec<BlockLog>,
    pub cost: CostSummary,
    pub spans: Vec<TraceSpan>,
}

/// Blockflow execution engine
pub struct Engine {
    handlers: Arc<HandlerRegistry>,
}

impl Engine {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self { handlers }
    }

    /// Execute a compiled workflow
    pub async fn execute(
        &self,
        workflow: &SerializedWorkflow,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult> {
        if workflow.version != WORKFLOW_VERSION {
            return Err(BlockflowError::validation(format!(
                "unsupported workflow version: {}",
                workflow.version
            )));
        }

        let mut logs = self.run_blocks(workflow, ctx).await?;
        ctx.emit(StreamEvent::RunEnd);

        // Final output: last completed block's output, if any
        let output = logs
            .last()
            .and_then(|log| log.output.clone())
            .unwrap_or(Value::Null);

        let cost = stream::aggregate_cost(&logs);
        let spans = stream::build_trace_spans(&logs);
        logs.shrink_to_fit();

        Ok(ExecutionResult {
            execution_id: ctx.execution_id,
            success: true,
            output,
            logs,
            cost,
            spans,
        })
    }

    /// Dependency-ordered walk with cooperative concurrency between
    /// independent ready nodes
    async fn run_blocks(
        &self,
        workflow: &SerializedWorkflow,
        ctx: &ExecutionContext,
    ) -> Result<Vec<BlockLog>> {
        // Disabled blocks drop out of the graph along with their edges
        let active: HashMap<&str, &SerializedBlock> = workflow
            .blocks
            .iter()
            .filter(|b| b.enabled)
            .map(|b| (b.id.as_str(), b))
            .collect();

        let mut in_degree: HashMap<&str, usize> =
            active.keys().map(|id| (*id, 0)).collect();
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();

        for conn in &workflow.connections {
            let (source, target) = (conn.source.as_str(), conn.target.as_str());
            if !active.contains_key(source) || !active.contains_key(target) {
                continue;
            }
            if let Some(deg) = in_degree.get_mut(target) {
                *deg += 1;
            }
            children.entry(source).or_default().push(target);
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_unstable(); // deterministic start order

        let mut logs = Vec::new();
        let mut completed: HashSet<&str> = HashSet::new();
        let mut failed: HashSet<&str> = HashSet::new();
        let mut tainted: HashSet<&str> = HashSet::new();
        let mut running = FuturesUnordered::new();

        loop {
            for block_id in ready.drain(..) {
                let block = active[block_id];
                running.push(self.run_one(block, ctx));
            }

            let Some((completed_id, outcome)) = running.next().await else {
                break;
            };
            // Rebind to the key borrowed from `active` so the bookkeeping
            // sets share one lifetime.
            let Some((&block_id, _)) = active.get_key_value(completed_id.as_str()) else {
                continue;
            };

            let ok = outcome.success;
            if let Some(log) = outcome.into_inner() {
                logs.push(log);
            }
            completed.insert(block_id);
            if !ok {
                failed.insert(block_id);
            }

            let mut cascade: Vec<&str> = Vec::new();
            for child in children.get(block_id).into_iter().flatten() {
                // Any one failed parent taints the dependent, no matter
                // which parent happens to complete last.
                if failed.contains(block_id) {
                    tainted.insert(*child);
                }
                let Some(deg) = in_degree.get_mut(child) else {
                    continue;
                };
                *deg -= 1;
                if *deg == 0 {
                    // A failed dependency skips the dependent, not its siblings
                    if tainted.contains(child) {
                        failed.insert(*child);
                        completed.insert(*child);
                        tracing::debug!(block_id = %child, "skipping block: upstream failed");
                        cascade.push(*child);
                    } else if !completed.contains(child) {
                        ready.push(*child);
                    }
                }
            }
            // Propagate the skip downstream
            while let Some(skipped) = cascade.pop() {
                for grandchild in children.get(skipped).cloned().unwrap_or_default() {
                    tainted.insert(grandchild);
                    let Some(deg) = in_degree.get_mut(grandchild) else {
                        continue;
                    };
                    *deg -= 1;
                    if *deg == 0 {
                        failed.insert(grandchild);
                        completed.insert(grandchild);
                        tracing::debug!(block_id = %grandchild, "skipping block: upstream failed");
                        cascade.push(grandchild);
                    }
                }
            }
        }

        if completed.len() != active.len() {
            return Err(BlockflowError::validation(
                "workflow contains a dependency cycle",
            ));
        }

        Ok(logs)
    }

    /// Execute one node and build its log entry
    async fn run_one(
        &self,
        block: &SerializedBlock,
        ctx: &ExecutionContext,
    ) -> (String, NodeOutcome) {
        // Subflow containers and trigger entry points carry no tool;
        // the topological driver owns their semantics
        let is_container = block.metadata.id == BLOCK_TYPE_LOOP
            || block.metadata.id == BLOCK_TYPE_PARALLEL;
        let is_trigger = block
            .metadata
            .category
            .as_deref()
            .is_some_and(|c| c == BLOCK_CATEGORY_TRIGGERS);
        if is_container || is_trigger {
            ctx.set_output(
                block.id.clone(),
                serde_json::to_value(&block.config.params).unwrap_or(Value::Null),
            );
            return (block.id.clone(), NodeOutcome::passthrough());
        }

        let started_at = Utc::now();
        let inputs = block.config.params.clone();
        let result = self.handlers.dispatch(block, &inputs, ctx).await;
        let ended_at = Utc::now();
        let duration_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;

        let block_name = block
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| block.id.clone());

        let log = match result {
            Ok(output) => {
                ctx.set_output(block.id.clone(), output.clone());
                ctx.emit(StreamEvent::BlockEnd {
                    block_id: block.id.clone(),
                });
                let cost = output
                    .get("cost")
                    .and_then(|c| serde_json::from_value::<BlockCost>(c.clone()).ok());
                BlockLog {
                    block_id: block.id.clone(),
                    block_name,
                    block_type: block.metadata.id.clone(),
                    started_at,
                    ended_at,
                    duration_ms,
                    success: true,
                    error: None,
                    input: serde_json::to_value(&inputs).ok(),
                    output: Some(output),
                    cost,
                }
            }
            Err(e) => {
                tracing::warn!(block_id = %block.id, error = %e, "block failed");
                BlockLog {
                    block_id: block.id.clone(),
                    block_name,
                    block_type: block.metadata.id.clone(),
                    started_at,
                    ended_at,
                    duration_ms,
                    success: false,
                    error: Some(e.to_string()),
                    input: serde_json::to_value(&inputs).ok(),
                    output: None,
                    cost: None,
                }
            }
        };

        let success = log.success;
        (block.id.clone(), NodeOutcome::logged(log, success))
    }
}

/// Outcome of one node execution: containers complete without a log entry
struct NodeOutcome {
    success: bool,
    log: Option<BlockLog>,
}

impl NodeOutcome {
    fn passthrough() -> Self {
        Self {
            success: true,
            log: None,
        }
    }

    fn logged(log: BlockLog, success: bool) -> Self {
        Self {
            success,
            log: Some(log),
        }
    }

    fn into_inner(self) -> Option<BlockLog> {
        self.log
    }
}
