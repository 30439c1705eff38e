//! Streaming output assembly and run-level aggregation.
//!
//! Execution emits [`StreamEvent`]s over an unbounded channel; the
//! [`StreamAssembler`] turns them into one readable text stream with a
//! blank-line separator between blocks and never before the first one.
//! After the run completes, the same block logs feed cost aggregation and
//! the fabricated trace timeline.

use std::collections::HashMap;

use serde_json::Value;

use crate::constants::STREAM_BLOCK_SEPARATOR;
use crate::model::{BlockLog, CostSummary, ModelCost, TraceSpan};

/// Event emitted during workflow execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental text produced by a block
    Chunk { block_id: String, text: String },
    /// A block finished successfully
    BlockEnd { block_id: String },
    /// The run is over; no further events follow
    RunEnd,
}

/// Stitches chunk events into one text stream.
///
/// Chunks from the same block concatenate directly; a chunk from a new
/// block is preceded by the separator, but only if some block already
/// produced text. The output therefore never starts with a separator.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    assembled: String,
    current_block: Option<String>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one event, returning the exact text to forward downstream
    /// (separator included), or `None` when the event carries no text.
    pub fn feed(&mut self, event: &StreamEvent) -> Option<String> {
        match event {
            StreamEvent::Chunk { block_id, text } => {
                if text.is_empty() {
                    return None;
                }
                let mut piece = String::new();
                let switching = self.current_block.as_deref() != Some(block_id.as_str());
                if switching && !self.assembled.is_empty() {
                    piece.push_str(STREAM_BLOCK_SEPARATOR);
                }
                self.current_block = Some(block_id.clone());
                piece.push_str(text);
                self.assembled.push_str(&piece);
                Some(piece)
            }
            StreamEvent::BlockEnd { .. } | StreamEvent::RunEnd => None,
        }
    }

    /// Everything forwarded so far, in order.
    pub fn output(&self) -> &str {
        &self.assembled
    }

    pub fn into_output(self) -> String {
        self.assembled
    }
}

/// Resolve selected output references against completed block logs.
///
/// A reference is either a bare block id, or `<blockId>_<dotted.path>`
/// navigating into that block's structured output. Resolved values render
/// as-is for strings and pretty-printed JSON otherwise, joined by the
/// block separator. Unresolvable references are skipped.
pub fn resolve_selected_outputs(selected: &[String], logs: &[BlockLog]) -> String {
    let mut parts = Vec::new();
    for reference in selected {
        if let Some(value) = resolve_reference(reference, logs) {
            parts.push(render_value(&value));
        } else {
            tracing::debug!(reference = %reference, "selected output did not resolve");
        }
    }
    parts.join(STREAM_BLOCK_SEPARATOR)
}

/// Append resolved selected outputs after the streamed text, keeping the
/// separator convention: one separator between the two pieces, never
/// leading, and no trailing debris when either side is empty.
pub fn compose_run_output(streamed: &str, selected: &str) -> String {
    if streamed.is_empty() {
        return selected.to_string();
    }
    if selected.is_empty() {
        return streamed.to_string();
    }
    format!("{streamed}{STREAM_BLOCK_SEPARATOR}{selected}")
}

fn resolve_reference(reference: &str, logs: &[BlockLog]) -> Option<Value> {
    // Block ids may themselves contain underscores, so match the longest
    // known id first rather than splitting at the first underscore.
    let mut best: Option<(&BlockLog, Option<&str>)> = None;
    for log in logs {
        if reference == log.block_id {
            best = Some((log, None));
            break;
        }
        if let Some(rest) = reference.strip_prefix(&log.block_id)
            && let Some(path) = rest.strip_prefix('_')
            && best.is_none_or(|(prev, _)| prev.block_id.len() < log.block_id.len())
        {
            best = Some((log, Some(path)));
        }
    }

    let (log, path) = best?;
    let output = log.output.clone()?;
    match path {
        None => Some(output),
        Some(path) => navigate(&output, path).cloned(),
    }
}

fn navigate<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in dotted.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

/// Sum every block's recorded cost into a run-level summary with a
/// per-model breakdown.
pub fn aggregate_cost(logs: &[BlockLog]) -> CostSummary {
    let mut summary = CostSummary::default();
    let mut models: HashMap<String, ModelCost> = HashMap::new();

    for cost in logs.iter().filter_map(|log| log.cost.as_ref()) {
        summary.input += cost.input;
        summary.output += cost.output;
        summary.total += cost.total;
        summary.tokens.prompt += cost.tokens.prompt;
        summary.tokens.completion += cost.tokens.completion;
        summary.tokens.total += cost.tokens.total;

        if let Some(ref model) = cost.model {
            let entry = models.entry(model.clone()).or_default();
            entry.input += cost.input;
            entry.output += cost.output;
            entry.total += cost.total;
            entry.tokens.prompt += cost.tokens.prompt;
            entry.tokens.completion += cost.tokens.completion;
            entry.tokens.total += cost.tokens.total;
        }
    }

    summary.models = models;
    summary
}

/// Build the run trace from block logs with fabricated relative offsets.
///
/// Wall-clock timestamps from concurrently-finishing blocks can collide or
/// even invert, so offsets are synthesized: spans are ordered by recorded
/// start time and each span starts strictly after the previous one.
pub fn build_trace_spans(logs: &[BlockLog]) -> Vec<TraceSpan> {
    let mut ordered: Vec<&BlockLog> = logs.iter().collect();
    ordered.sort_by_key(|log| log.started_at);

    let base = match ordered.first() {
        Some(log) => log.started_at,
        None => return Vec::new(),
    };

    let mut spans = Vec::with_capacity(ordered.len());
    let mut previous_start: Option<u64> = None;
    for log in ordered {
        let recorded = (log.started_at - base).num_milliseconds().max(0) as u64;
        let start_time = match previous_start {
            Some(prev) if recorded <= prev => prev + 1,
            _ => recorded,
        };
        previous_start = Some(start_time);

        let end_time = start_time + log.duration_ms;
        spans.push(TraceSpan {
            id: log.block_id.clone(),
            name: log.block_name.clone(),
            span_type: log.block_type.clone(),
            status: if log.success { "success" } else { "error" }.to_string(),
            start_time,
            end_time,
            duration_ms: log.duration_ms,
            children: Vec::new(),
        });
    }
    spans
}
